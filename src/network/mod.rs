//! Peer presence on the local mesh.
//!
//! Devices announce themselves with periodic keepalives; the directory keeps
//! the peers whose keepalive is recent enough and forgets the rest.

pub mod directory;

pub use directory::*;
