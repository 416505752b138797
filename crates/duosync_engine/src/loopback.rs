//! In-process transport.
//!
//! `LoopbackNetwork` is a switchboard: transports register addresses on it
//! and dial each other. Frames are forwarded by one pump task per direction.
//! `partition` drops every live link and refuses new dials until `heal`.

use crate::transport::{Channel, ChannelEvent, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Endpoint {
    owner: u64,
    incoming: mpsc::UnboundedSender<Channel>,
}

struct Link {
    pumps: [JoinHandle<()>; 2],
    events: [mpsc::UnboundedSender<ChannelEvent>; 2],
}

impl Link {
    fn is_finished(&self) -> bool {
        self.pumps.iter().all(JoinHandle::is_finished)
    }

    fn sever(self) {
        for pump in &self.pumps {
            pump.abort();
        }
        for events in &self.events {
            let _ = events.send(ChannelEvent::Closed);
        }
    }
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    endpoints: HashMap<String, Endpoint>,
    links: Vec<Link>,
    partitioned: bool,
}

/// An in-memory network connecting [`LoopbackTransport`]s.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this network.
    pub fn transport(&self) -> LoopbackTransport {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.next_id
        };
        LoopbackTransport {
            id,
            network: self.clone(),
            address: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
        }
    }

    /// Severs every live link and refuses new dials.
    pub fn partition(&self) {
        let links = {
            let mut state = self.state.lock();
            state.partitioned = true;
            std::mem::take(&mut state.links)
        };
        tracing::debug!(links = links.len(), "loopback network partitioned");
        for link in links {
            link.sever();
        }
    }

    /// Allows dials again.
    pub fn heal(&self) {
        self.state.lock().partitioned = false;
        tracing::debug!("loopback network healed");
    }

    /// Returns true if `address` is registered.
    pub fn is_registered(&self, address: &str) -> bool {
        self.state.lock().endpoints.contains_key(address)
    }

    /// Number of links whose pumps are still running.
    pub fn live_links(&self) -> usize {
        let mut state = self.state.lock();
        state.links.retain(|link| !link.is_finished());
        state.links.len()
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    id: u64,
    network: LoopbackNetwork,
    address: Mutex<Option<String>>,
    incoming: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Channel>>>,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("id", &self.id)
            .field("address", &*self.address.lock())
            .finish()
    }
}

fn pump(
    mut from: mpsc::UnboundedReceiver<Vec<u8>>,
    to: mpsc::UnboundedSender<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = from.recv().await {
            if to.send(ChannelEvent::Data(frame)).is_err() {
                return;
            }
        }
        let _ = to.send(ChannelEvent::Closed);
    })
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn register(&self, address: &str) -> Result<(), TransportError> {
        let receiver = {
            let mut state = self.network.state.lock();
            if let Some(existing) = state.endpoints.get(address) {
                if existing.owner == self.id {
                    return Ok(());
                }
                return Err(TransportError::AddressClaimed(address.to_string()));
            }

            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
            state.endpoints.insert(
                address.to_string(),
                Endpoint {
                    owner: self.id,
                    incoming: incoming_tx,
                },
            );
            incoming_rx
        };

        *self.address.lock() = Some(address.to_string());
        *self.incoming.lock().await = Some(receiver);
        Ok(())
    }

    async fn dial(&self, peer_address: &str) -> Result<Channel, TransportError> {
        if self.address.lock().is_none() {
            return Err(TransportError::NotRegistered);
        }

        let mut state = self.network.state.lock();
        if state.partitioned {
            return Err(TransportError::Unreachable(peer_address.to_string()));
        }
        let Some(endpoint) = state.endpoints.get(peer_address) else {
            return Err(TransportError::Unreachable(peer_address.to_string()));
        };

        let (local_out_tx, local_out_rx) = mpsc::unbounded_channel();
        let (local_events_tx, local_events_rx) = mpsc::unbounded_channel();
        let (remote_out_tx, remote_out_rx) = mpsc::unbounded_channel();
        let (remote_events_tx, remote_events_rx) = mpsc::unbounded_channel();

        let _ = remote_events_tx.send(ChannelEvent::Open);
        let remote = Channel {
            outbound: remote_out_tx,
            events: remote_events_rx,
        };
        if endpoint.incoming.send(remote).is_err() {
            return Err(TransportError::Unreachable(peer_address.to_string()));
        }
        let _ = local_events_tx.send(ChannelEvent::Open);

        let link = Link {
            pumps: [
                pump(local_out_rx, remote_events_tx.clone()),
                pump(remote_out_rx, local_events_tx.clone()),
            ],
            events: [local_events_tx, remote_events_tx],
        };
        state.links.retain(|link| !link.is_finished());
        state.links.push(link);

        Ok(Channel {
            outbound: local_out_tx,
            events: local_events_rx,
        })
    }

    async fn accept(&self) -> Result<Channel, TransportError> {
        let mut incoming = self.incoming.lock().await;
        match incoming.as_mut() {
            Some(receiver) => receiver.recv().await.ok_or(TransportError::Closed),
            None => Err(TransportError::NotRegistered),
        }
    }

    async fn release(&self) {
        let Some(address) = self.address.lock().take() else {
            return;
        };
        let mut state = self.network.state.lock();
        if state
            .endpoints
            .get(&address)
            .is_some_and(|endpoint| endpoint.owner == self.id)
        {
            state.endpoints.remove(&address);
        }
    }
}
