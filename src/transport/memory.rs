//! In-process transport hub used for tests and local simulations.
//!
//! Every endpoint registers per-kind mailboxes on a shared [`MemoryNetwork`].
//! Packets are encoded and decoded exactly as they would be on the wire, and
//! a full mailbox drops the frame like a congested datagram socket would.

use crate::transport::{Frame, Packet, PacketKind, Transport};
use crate::utils::{NetworkError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

type Mailboxes = HashMap<PacketKind, mpsc::Sender<Frame>>;

/// Shared switchboard connecting memory endpoints by address
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<RwLock<HashMap<String, Mailboxes>>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint reachable at `address`
    pub fn endpoint(&self, address: impl Into<String>, capacity: usize) -> MemoryTransport {
        let address = address.into();
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in PacketKind::ALL {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.insert(kind, tx);
            receivers.insert(kind, Mutex::new(rx));
        }

        self.endpoints.write().insert(address.clone(), senders);
        MemoryTransport {
            network: self.clone(),
            address,
            inbound: receivers,
        }
    }

    /// Make `address` unreachable
    pub fn disconnect(&self, address: &str) {
        self.endpoints.write().remove(address);
    }

    fn deliver(&self, from: &str, to: &str, bytes: &[u8]) -> Result<()> {
        let frame = Frame::from_bytes(bytes)?.with_source(from);
        let kind = frame.packet.kind();

        let endpoints = self.endpoints.read();
        let mailbox = endpoints
            .get(to)
            .and_then(|mailboxes| mailboxes.get(&kind))
            .ok_or_else(|| NetworkError::Transport {
                reason: format!("{to} is unreachable"),
            })?;

        if mailbox.try_send(frame).is_err() {
            log::warn!("Dropping {} frame for {}: mailbox full", kind, to);
        }
        Ok(())
    }
}

/// One endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: String,
    inbound: HashMap<PacketKind, Mutex<mpsc::Receiver<Frame>>>,
}

impl MemoryTransport {
    /// Address of this endpoint
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Take every queued frame of `kind` without waiting
    pub async fn drain(&self, kind: PacketKind) -> Vec<Frame> {
        let mut frames = Vec::new();
        if let Some(rx) = self.inbound.get(&kind) {
            let mut rx = rx.lock().await;
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, address: &str, packet: &Packet) -> Result<()> {
        let bytes = Frame::new(packet.clone()).to_bytes()?;
        self.network.deliver(&self.address, address, &bytes)
    }

    async fn listen(&self, kind: PacketKind) -> Result<Frame> {
        let rx = self.inbound.get(&kind).ok_or_else(|| NetworkError::ChannelClosed {
            kind: kind.to_string(),
        })?;
        rx.lock().await.recv().await.ok_or_else(|| {
            NetworkError::ChannelClosed {
                kind: kind.to_string(),
            }
            .into()
        })
    }

    async fn discover_peers(&self, probe: &Packet) -> Result<()> {
        let bytes = Frame::new(probe.clone()).to_bytes()?;
        let others: Vec<String> = self
            .network
            .endpoints
            .read()
            .keys()
            .filter(|address| **address != self.address)
            .cloned()
            .collect();

        for address in others {
            if let Err(e) = self.network.deliver(&self.address, &address, &bytes) {
                log::debug!("Discovery probe to {} failed: {}", address, e);
            }
        }
        Ok(())
    }

    fn local_address(&self) -> Option<String> {
        Some(self.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{CallEnd, PeerId};

    fn call_end() -> Packet {
        Packet::CallEnd(CallEnd {
            sender_id: PeerId(1),
            receiver_id: PeerId(2),
        })
    }

    #[tokio::test]
    async fn test_send_and_listen() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("10.0.0.1", 8);
        let b = network.endpoint("10.0.0.2", 8);

        a.send("10.0.0.2", &call_end()).await.unwrap();
        let frame = b.listen(PacketKind::CallEnd).await.unwrap();
        assert_eq!(frame.packet, call_end());
        assert_eq!(frame.source.as_deref(), Some("10.0.0.1"));
        assert!(b.drain(PacketKind::Text).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_address() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("10.0.0.1", 8);
        assert!(a.send("10.0.0.9", &call_end()).await.is_err());

        let _b = network.endpoint("10.0.0.2", 8);
        network.disconnect("10.0.0.2");
        assert!(a.send("10.0.0.2", &call_end()).await.is_err());
    }

    #[tokio::test]
    async fn test_full_mailbox_drops() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("10.0.0.1", 1);
        let b = network.endpoint("10.0.0.2", 1);

        a.send("10.0.0.2", &call_end()).await.unwrap();
        a.send("10.0.0.2", &call_end()).await.unwrap();
        assert_eq!(b.drain(PacketKind::CallEnd).await.len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_reaches_everyone_else() {
        let network = MemoryNetwork::new();
        let a = network.endpoint("10.0.0.1", 8);
        let b = network.endpoint("10.0.0.2", 8);
        let c = network.endpoint("10.0.0.3", 8);

        let probe = Packet::Keepalive {
            sender_id: PeerId(1),
            devices: Vec::new(),
        };
        a.discover_peers(&probe).await.unwrap();

        assert_eq!(b.drain(PacketKind::Keepalive).await.len(), 1);
        assert_eq!(c.drain(PacketKind::Keepalive).await.len(), 1);
        assert!(a.drain(PacketKind::Keepalive).await.is_empty());
    }
}
