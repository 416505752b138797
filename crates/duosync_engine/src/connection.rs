//! Encrypted connection to the paired peer.
//!
//! The manager owns exactly one logical channel. Every frame is a JSON
//! message sealed with the pair's [`CryptoBox`]. Transport churn is hidden
//! behind [`ConnectionStatus`] transitions reported to a
//! [`ConnectionListener`].
//!
//! ```text
//!                connect()              channel open
//! Disconnected ───────────► Connecting ─────────────► Connected
//!      ▲                        │                         │
//!      │ disconnect()           │ dial failed             │ channel lost
//!      │                        ▼                         ▼
//!      └──────────────────── Error ◄──── backoff ──── Disconnected
//! ```
//!
//! Only the dialer reconnects. An address collision never reconnects.

use crate::config::ReconnectPolicy;
use crate::error::{ConnectionError, ConnectionResult};
use crate::transport::{Channel, ChannelEvent, Transport, TransportError};
use duosync_crypto::{CryptoBox, EncryptionKey};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Connection status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No channel and none being opened.
    Disconnected,
    /// A channel is being opened.
    Connecting,
    /// The channel is open.
    Connected,
    /// The last attempt failed.
    Error,
}

/// Which side of the channel this device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the channel, reconnects and starts the full sync.
    Dialer,
    /// Accepts inbound channels and never dials.
    Listener,
}

impl Role {
    /// The role of `local` in a pair with `peer`: the lower id dials.
    pub fn for_pair(local: &str, peer: &str) -> Self {
        if local < peer {
            Role::Dialer
        } else {
            Role::Listener
        }
    }
}

/// Transport address of a device.
pub fn peer_address(device_id: &str) -> String {
    format!("duosync-{device_id}")
}

/// Receives connection events.
pub trait ConnectionListener: Send + Sync + 'static {
    /// The status changed.
    fn on_status_change(&self, status: ConnectionStatus);
    /// A decrypted message arrived.
    fn on_message(&self, message: String);
    /// A non-fatal error occurred.
    fn on_error(&self, error: ConnectionError);
}

/// Connection events as a value, for channel-based listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The status changed.
    StatusChanged(ConnectionStatus),
    /// A decrypted message arrived.
    Message(String),
    /// A non-fatal error occurred.
    Error(ConnectionError),
}

impl ConnectionListener for mpsc::UnboundedSender<ConnectionEvent> {
    fn on_status_change(&self, status: ConnectionStatus) {
        let _ = self.send(ConnectionEvent::StatusChanged(status));
    }

    fn on_message(&self, message: String) {
        let _ = self.send(ConnectionEvent::Message(message));
    }

    fn on_error(&self, error: ConnectionError) {
        let _ = self.send(ConnectionEvent::Error(error));
    }
}

struct State {
    status: ConnectionStatus,
    role: Option<Role>,
    peer: Option<String>,
    crypto: Option<Arc<CryptoBox>>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    generation: u64,
    attempt: u32,
    reconnect: Option<JoinHandle<()>>,
    reconnect_seq: u64,
    reader: Option<JoinHandle<()>>,
    acceptor: Option<JoinHandle<()>>,
    registered: bool,
    stopped: bool,
    destroyed: bool,
}

impl State {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            role: None,
            peer: None,
            crypto: None,
            outbound: None,
            generation: 0,
            attempt: 0,
            reconnect: None,
            reconnect_seq: 0,
            reader: None,
            acceptor: None,
            registered: false,
            stopped: false,
            destroyed: false,
        }
    }

    /// Drops the channel and stops every task.
    fn teardown(&mut self) {
        self.generation += 1;
        self.outbound = None;
        self.attempt = 0;
        for handle in [
            self.reconnect.take(),
            self.reader.take(),
            self.acceptor.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner<T: Transport> {
    transport: Arc<T>,
    local_address: String,
    policy: ReconnectPolicy,
    listener: Arc<dyn ConnectionListener>,
    state: Mutex<State>,
}

/// Manages the encrypted channel to the paired peer.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a manager for this device's `local_address`.
    pub fn new(
        transport: Arc<T>,
        local_address: impl Into<String>,
        policy: ReconnectPolicy,
        listener: Arc<dyn ConnectionListener>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                local_address: local_address.into(),
                policy,
                listener,
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Returns true if the channel is open.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Role of this side, once connect or listen was called.
    pub fn role(&self) -> Option<Role> {
        self.inner.state.lock().role
    }

    /// Failed reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().attempt
    }

    /// Returns true if a reconnect timer is pending.
    pub fn reconnect_pending(&self) -> bool {
        self.inner
            .state
            .lock()
            .reconnect
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// This device's transport address.
    pub fn local_address(&self) -> &str {
        &self.inner.local_address
    }

    /// Dials `peer_address` and encrypts the channel with `key`.
    ///
    /// Resolves once the data channel is open. If the peer is unreachable the
    /// error is returned and a reconnect is scheduled. An address collision
    /// is returned without scheduling anything.
    pub async fn connect(&self, peer_address: &str, key: &EncryptionKey) -> ConnectionResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(ConnectionError::Destroyed);
            }
            state.teardown();
            state.peer = Some(peer_address.to_string());
            state.crypto = Some(Arc::new(CryptoBox::new(key)));
            state.role = Some(Role::Dialer);
            state.stopped = false;
        }
        tracing::info!(
            local = %self.inner.local_address,
            peer = %peer_address,
            key = %key.fingerprint(),
            "connecting to peer"
        );
        self.inner.open_channel().await
    }

    /// Accepts inbound channels encrypted with `key`.
    ///
    /// A newer inbound channel replaces the current one.
    pub async fn listen(&self, key: &EncryptionKey) -> ConnectionResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(ConnectionError::Destroyed);
            }
            state.teardown();
            state.crypto = Some(Arc::new(CryptoBox::new(key)));
            state.role = Some(Role::Listener);
            state.stopped = false;
        }
        self.inner.ensure_registered().await?;
        tracing::info!(
            local = %self.inner.local_address,
            key = %key.fingerprint(),
            "listening for peer"
        );
        self.inner.start_acceptor();
        Ok(())
    }

    /// Re-opens the channel after [`disconnect`](Self::disconnect), keeping
    /// the peer and key.
    pub async fn reconnect(&self) -> ConnectionResult<()> {
        let role = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return Err(ConnectionError::Destroyed);
            }
            if state.crypto.is_none() {
                return Err(ConnectionError::NotConnected);
            }
            state.stopped = false;
            state.role
        };
        match role {
            Some(Role::Dialer) => self.inner.open_channel().await,
            Some(Role::Listener) => {
                self.inner.start_acceptor();
                Ok(())
            }
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Serializes, encrypts and sends `message`.
    ///
    /// Returns false if no channel is open; the caller keeps the message.
    pub fn send<M: Serialize>(&self, message: &M) -> bool {
        let (outbound, crypto) = {
            let state = self.inner.state.lock();
            match (&state.outbound, &state.crypto, state.status) {
                (Some(outbound), Some(crypto), ConnectionStatus::Connected) => {
                    (outbound.clone(), Arc::clone(crypto))
                }
                _ => return false,
            }
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize outbound message");
                return false;
            }
        };
        let sealed = match crypto.encrypt(&json) {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encrypt outbound message");
                return false;
            }
        };
        outbound.send(sealed.into_bytes()).is_ok()
    }

    /// Closes the channel and cancels timers. [`reconnect`](Self::reconnect)
    /// undoes this.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            state.teardown();
        }
        tracing::info!(local = %self.inner.local_address, "disconnected");
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    /// Closes everything and releases the transport address. The manager
    /// is unusable afterwards.
    pub async fn destroy(&self) {
        let registered = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.stopped = true;
            state.teardown();
            state.crypto = None;
            std::mem::take(&mut state.registered)
        };
        if registered {
            self.inner.transport.release().await;
        }
        tracing::info!(local = %self.inner.local_address, "connection manager destroyed");
        self.inner.set_status(ConnectionStatus::Disconnected);
    }
}

impl<T: Transport> Inner<T> {
    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut state = self.state.lock();
            if state.status == status {
                return;
            }
            state.status = status;
        }
        tracing::debug!(local = %self.local_address, ?status, "connection status changed");
        self.listener.on_status_change(status);
    }

    async fn ensure_registered(&self) -> ConnectionResult<()> {
        if self.state.lock().registered {
            return Ok(());
        }
        match self.transport.register(&self.local_address).await {
            Ok(()) => {
                let destroyed = {
                    let mut state = self.state.lock();
                    state.registered = !state.destroyed;
                    state.destroyed
                };
                if destroyed {
                    self.transport.release().await;
                    return Err(ConnectionError::Destroyed);
                }
                Ok(())
            }
            Err(TransportError::AddressClaimed(address)) => {
                tracing::warn!(%address, "address claimed by another session");
                self.set_status(ConnectionStatus::Error);
                self.listener.on_error(ConnectionError::DeviceIdCollision);
                Err(ConnectionError::DeviceIdCollision)
            }
            Err(err) => Err(ConnectionError::PeerUnreachable(err.to_string())),
        }
    }

    async fn open_channel(self: &Arc<Self>) -> ConnectionResult<()> {
        let (peer, generation) = {
            let state = self.state.lock();
            if state.destroyed {
                return Err(ConnectionError::Destroyed);
            }
            if state.stopped {
                return Err(ConnectionError::NotConnected);
            }
            let peer = state.peer.clone().ok_or(ConnectionError::NotConnected)?;
            (peer, state.generation)
        };
        self.set_status(ConnectionStatus::Connecting);

        let result = match self.ensure_registered().await {
            Ok(()) => self.transport.dial(&peer).await,
            Err(err @ (ConnectionError::DeviceIdCollision | ConnectionError::Destroyed)) => {
                return Err(err)
            }
            Err(err) => Err(TransportError::Unreachable(err.to_string())),
        };
        let opened = match result {
            Ok(channel) => channel.opened().await,
            Err(err) => Err(err),
        };

        // disconnect or destroy may have run while the dial was pending.
        self.still_current(generation)?;
        match opened {
            Ok(channel) => {
                if self.attach(channel, Some(generation)) {
                    Ok(())
                } else {
                    self.still_current(generation)
                }
            }
            Err(TransportError::AddressClaimed(_)) => {
                self.set_status(ConnectionStatus::Error);
                self.listener.on_error(ConnectionError::DeviceIdCollision);
                Err(ConnectionError::DeviceIdCollision)
            }
            Err(err) => {
                tracing::debug!(peer = %peer, error = %err, "peer unreachable");
                let error = ConnectionError::PeerUnreachable(peer);
                self.set_status(ConnectionStatus::Error);
                self.listener.on_error(error.clone());
                self.schedule_reconnect();
                Err(error)
            }
        }
    }

    /// Fails if the attempt started at `generation` was cancelled.
    fn still_current(&self, generation: u64) -> ConnectionResult<()> {
        let state = self.state.lock();
        if state.destroyed {
            Err(ConnectionError::Destroyed)
        } else if state.stopped || state.generation != generation {
            Err(ConnectionError::NotConnected)
        } else {
            Ok(())
        }
    }

    /// Installs `channel` as the current channel and starts reading it.
    ///
    /// A dialed channel passes the generation its attempt started at and is
    /// dropped if that attempt was cancelled. Returns false if dropped.
    fn attach(self: &Arc<Self>, channel: Channel, dialed_at: Option<u64>) -> bool {
        let Channel { outbound, events } = channel;
        let (generation, replaced) = {
            let mut state = self.state.lock();
            if state.destroyed
                || state.stopped
                || dialed_at.is_some_and(|generation| generation != state.generation)
            {
                tracing::debug!(local = %self.local_address, "dropping channel of a cancelled attempt");
                return false;
            }
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            if let Some(timer) = state.reconnect.take() {
                timer.abort();
            }
            state.generation += 1;
            state.outbound = Some(outbound);
            state.attempt = 0;
            (state.generation, state.status == ConnectionStatus::Connected)
        };

        // The old channel died silently; report it so listeners re-sync.
        if replaced {
            self.set_status(ConnectionStatus::Disconnected);
        }
        tracing::info!(local = %self.local_address, "channel open");
        self.set_status(ConnectionStatus::Connected);

        let reader = tokio::spawn(Arc::clone(self).read_loop(events, generation));
        let mut state = self.state.lock();
        if state.generation == generation {
            state.reader = Some(reader);
        } else {
            reader.abort();
        }
        true
    }

    async fn read_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        generation: u64,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {}
                ChannelEvent::Data(frame) => self.deliver(frame, generation),
                ChannelEvent::Closed => break,
                ChannelEvent::Error(err) => {
                    tracing::warn!(error = %err, "channel error");
                    break;
                }
            }
        }
        self.channel_lost(generation);
    }

    fn deliver(&self, frame: Vec<u8>, generation: u64) {
        let crypto = {
            let state = self.state.lock();
            if state.generation != generation {
                return;
            }
            match &state.crypto {
                Some(crypto) => Arc::clone(crypto),
                None => return,
            }
        };

        let plaintext = String::from_utf8(frame)
            .ok()
            .and_then(|sealed| crypto.decrypt(&sealed).ok());
        match plaintext {
            Some(message) => self.listener.on_message(message),
            None => {
                tracing::warn!(key = %crypto.fingerprint(), "discarding frame that failed to decrypt");
                self.listener.on_error(ConnectionError::DecryptionFailed);
            }
        }
    }

    fn channel_lost(self: &Arc<Self>, generation: u64) {
        let should_reconnect = {
            let mut state = self.state.lock();
            if state.generation != generation || state.destroyed {
                return;
            }
            state.outbound = None;
            state.reader = None;
            !state.stopped && state.role == Some(Role::Dialer)
        };

        tracing::info!(local = %self.local_address, "channel closed");
        self.set_status(ConnectionStatus::Disconnected);
        if should_reconnect {
            self.schedule_reconnect();
        }
    }

    /// Arms the single reconnect timer, replacing any pending one.
    fn schedule_reconnect(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.destroyed || state.stopped || state.role != Some(Role::Dialer) {
            return;
        }
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }

        let delay = self.policy.delay_for_attempt(state.attempt);
        state.attempt = state.attempt.saturating_add(1);
        state.reconnect_seq += 1;
        let seq = state.reconnect_seq;
        tracing::debug!(attempt = state.attempt, ?delay, "reconnect scheduled");

        let inner = Arc::clone(self);
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = inner.state.lock();
                if state.reconnect_seq != seq {
                    return;
                }
                state.reconnect = None;
            }
            if let Err(err) = inner.open_channel().await {
                tracing::debug!(error = %err, "reconnect attempt failed");
            }
        }));
    }

    fn start_acceptor(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state
            .acceptor
            .as_ref()
            .is_some_and(|acceptor| !acceptor.is_finished())
        {
            return;
        }

        let inner = Arc::clone(self);
        state.acceptor = Some(tokio::spawn(async move {
            loop {
                let channel = match inner.transport.accept().await {
                    Ok(channel) => channel,
                    Err(err) => {
                        tracing::debug!(error = %err, "acceptor stopped");
                        return;
                    }
                };
                match channel.opened().await {
                    Ok(channel) => {
                        inner.attach(channel, None);
                    }
                    Err(err) => tracing::debug!(error = %err, "inbound channel failed to open"),
                }
            }
        }));
    }
}
