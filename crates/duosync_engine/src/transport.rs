//! Transport port for peer-to-peer channels.
//!
//! A transport moves opaque frames between two addressed endpoints and
//! reports open/close/error events. NAT traversal, relays and STUN are the
//! transport's business; the connection manager only sees [`Channel`]s.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The address is held by another live session.
    #[error("address {0} is already claimed")]
    AddressClaimed(String),

    /// Nothing answers at the address.
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    /// This endpoint has not registered an address.
    #[error("transport not registered")]
    NotRegistered,

    /// The channel or endpoint was closed.
    #[error("channel closed")]
    Closed,
}

/// Event delivered on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The data channel is open.
    Open,
    /// A frame from the peer.
    Data(Vec<u8>),
    /// The channel closed.
    Closed,
    /// The channel failed.
    Error(TransportError),
}

/// One bidirectional data channel to a peer.
///
/// Dropping the channel closes it.
#[derive(Debug)]
pub struct Channel {
    /// Frames to the peer.
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Events from the peer.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    /// Waits for the channel to report [`ChannelEvent::Open`].
    pub async fn opened(mut self) -> Result<Self, TransportError> {
        loop {
            match self.events.recv().await {
                Some(ChannelEvent::Open) => return Ok(self),
                Some(ChannelEvent::Data(_)) => {}
                Some(ChannelEvent::Error(err)) => return Err(err),
                Some(ChannelEvent::Closed) | None => return Err(TransportError::Closed),
            }
        }
    }
}

/// A peer-to-peer transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Claims `address` for this endpoint.
    ///
    /// Fails with [`TransportError::AddressClaimed`] if another live session
    /// holds it. Registering the same address twice is a no-op.
    async fn register(&self, address: &str) -> Result<(), TransportError>;

    /// Opens a channel to `peer_address`.
    async fn dial(&self, peer_address: &str) -> Result<Channel, TransportError>;

    /// Waits for the next inbound channel.
    async fn accept(&self) -> Result<Channel, TransportError>;

    /// Gives up the registered address.
    async fn release(&self);
}
