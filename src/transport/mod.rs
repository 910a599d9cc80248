//! Transport layer for mesh packets.
//!
//! A transport sends a packet to a network address and delivers inbound
//! frames into one queue per [`PacketKind`], so each kind can be consumed
//! by its own listen loop.

pub mod memory;
pub mod protocol;
pub mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::*;
pub use udp::UdpTransport;

use crate::utils::Result;
use async_trait::async_trait;

/// Per-kind send/listen primitives addressed by network address
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a packet to a single address
    async fn send(&self, address: &str, packet: &Packet) -> Result<()>;

    /// Wait for the next inbound frame of `kind`
    async fn listen(&self, kind: PacketKind) -> Result<Frame>;

    /// Announce `probe` to every reachable device, known or not
    async fn discover_peers(&self, probe: &Packet) -> Result<()>;

    /// Address peers reach this device at, if the transport knows it
    fn local_address(&self) -> Option<String>;
}
