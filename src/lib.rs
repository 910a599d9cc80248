//! # Mesh Messenger
//!
//! A serverless messaging engine for devices sharing a local wireless group.
//! Devices find each other through periodic keepalives, exchange text, files,
//! voice notes and call signals directly, and can seal payloads end to end
//! with per-peer sessions derived from an X25519 key agreement.
//!
//! ## Features
//!
//! - **Peer Directory**: live-peer table refreshed by keepalives and swept on a timer
//! - **Delivery States**: `Sent → Received → Read`, monotonic under any reordering
//! - **Call Signaling**: latest-value slots for call request, response, end and audio
//! - **End-to-End Encryption**: ChaCha20-Poly1305 sessions keyed from X25519
//! - **Pluggable Adapters**: transport, record store and media store are traits
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mesh_messenger::{
//!     crypto::{DeviceIdentity, IdentityKeyStore},
//!     messaging::Profile,
//!     storage::{MemoryMediaStore, MemoryStore},
//!     transport::UdpTransport,
//!     utils::{MeshConfig, SystemClock},
//!     MeshNode,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::default();
//!     let identity = DeviceIdentity::generate();
//!     let profile = Profile {
//!         peer_id: identity.peer_id,
//!         updated_at: 1,
//!         username: "alice".to_string(),
//!         image_ref: None,
//!     };
//!     let transport = Arc::new(UdpTransport::bind(&config.network).await?);
//!
//!     let node = MeshNode::new(
//!         config,
//!         identity,
//!         Arc::new(IdentityKeyStore::in_memory()),
//!         profile,
//!         transport,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryMediaStore::new()),
//!         Arc::new(SystemClock),
//!     );
//!     node.start();
//!     tokio::signal::ctrl_c().await?;
//!     node.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: device identity and long-lived keys
//! - [`session`]: per-peer encryption sessions and sealed envelopes
//! - [`network`]: the live-peer directory
//! - [`messaging`]: messages, call signals and the delivery state machine
//! - [`transport`]: wire protocol plus in-memory and UDP transports
//! - [`storage`]: persistence and media store seams
//! - [`node`]: a complete device wiring everything together
//! - [`utils`]: configuration, errors, clocks and background tasks

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod messaging;
pub mod network;
pub mod node;
pub mod session;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use crypto::{DeviceIdentity, IdentityKeyStore};
pub use messaging::{DeliveryState, Message, MessageContent, MessageId, Messenger, PeerId};
pub use network::PeerDirectory;
pub use node::MeshNode;
pub use session::SessionEngine;
pub use transport::{Packet, PacketKind, Transport, PROTOCOL_VERSION};
pub use utils::{MeshConfig, MeshError, Result};

/// Default configuration values
pub mod defaults {
    /// Default UDP port shared by every device of the group
    pub const DEFAULT_PORT: u16 = 8800;

    /// Address the group owner holds on a Wi-Fi Direct group
    pub const GROUP_OWNER_ADDRESS: &str = "192.168.49.1";

    /// Keepalive broadcast period in milliseconds
    pub const KEEPALIVE_INTERVAL_MS: u64 = 1_000;

    /// Discovery probe period in milliseconds
    pub const DISCOVERY_INTERVAL_MS: u64 = 5_000;

    /// Directory sweep period in milliseconds
    pub const DIRECTORY_SWEEP_INTERVAL_MS: u64 = 1_000;

    /// Keepalive age after which a peer is evicted, in milliseconds
    pub const LIVENESS_TIMEOUT_MS: u64 = 3_000;

    /// Idle time after which a session expires (24 hours)
    pub const SESSION_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1_000;

    /// Session expiry sweep period in seconds
    pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 3_600;
}
