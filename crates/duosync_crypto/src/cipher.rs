//! Message encryption using AES-256-GCM.

use crate::error::{CryptoError, CryptoResult};
use crate::key::EncryptionKey;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encrypts and decrypts messages exchanged between paired devices.
///
/// The wire format is `base64(nonce (12 bytes) || ciphertext || tag (16 bytes))`.
pub struct CryptoBox {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl CryptoBox {
    /// Creates a crypto box bound to the given key.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self {
            cipher,
            fingerprint: key.fingerprint(),
        }
    }

    /// Fingerprint of the key this box was built with.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Encrypts a UTF-8 message under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut framed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend(ciphertext);

        Ok(STANDARD.encode(framed))
    }

    /// Authenticates and decrypts a message produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] for every failure.
    pub fn decrypt(&self, encoded: &str) -> CryptoResult<String> {
        let framed = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if framed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let nonce = Nonce::from_slice(&framed[..NONCE_SIZE]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &framed[NONCE_SIZE..])
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox")
            .field("cipher", &"Aes256Gcm")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Encrypts `plaintext` under `key`.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> CryptoResult<String> {
    CryptoBox::new(key).encrypt(plaintext)
}

/// Decrypts a message produced by [`encrypt`].
pub fn decrypt(ciphertext: &str, key: &EncryptionKey) -> CryptoResult<String> {
    CryptoBox::new(key).decrypt(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();
        let crypto = CryptoBox::new(&key);

        let ciphertext = crypto.encrypt("Hello, peer!").unwrap();
        assert_ne!(ciphertext, "Hello, peer!");
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), "Hello, peer!");
    }

    #[test]
    fn encrypt_produces_different_ciphertext() {
        let key = EncryptionKey::generate();
        let crypto = CryptoBox::new(&key);

        // Fresh nonce per call
        let ct1 = crypto.encrypt("same data").unwrap();
        let ct2 = crypto.encrypt("same data").unwrap();
        assert_ne!(ct1, ct2);

        let n1 = &STANDARD.decode(&ct1).unwrap()[..NONCE_SIZE];
        let n2 = &STANDARD.decode(&ct2).unwrap()[..NONCE_SIZE];
        assert_ne!(n1, n2);
    }

    #[test]
    fn decrypt_wrong_key_fails() {
        let ciphertext = encrypt("secret", &EncryptionKey::generate()).unwrap();
        assert_eq!(
            decrypt(&ciphertext, &EncryptionKey::generate()).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn decrypt_tampered_fails() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt("data", &key).unwrap();

        let mut raw = STANDARD.decode(&ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = STANDARD.encode(raw);

        assert_eq!(
            decrypt(&tampered, &key).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn decrypt_garbage_fails_opaquely() {
        let key = EncryptionKey::generate();
        for input in ["", "%%%not-base64%%%", "AAAA", &STANDARD.encode([0u8; 27])] {
            assert_eq!(
                decrypt(input, &key).unwrap_err(),
                CryptoError::DecryptionFailed
            );
        }
    }

    #[test]
    fn empty_plaintext() {
        let key = EncryptionKey::generate();
        let ciphertext = encrypt("", &key).unwrap();
        assert_eq!(decrypt(&ciphertext, &key).unwrap(), "");
    }

    #[test]
    fn unicode_plaintext() {
        let key = EncryptionKey::generate();
        let message = "Einkaufen 🥛 – 買い物";
        assert_eq!(decrypt(&encrypt(message, &key).unwrap(), &key).unwrap(), message);
    }
}
