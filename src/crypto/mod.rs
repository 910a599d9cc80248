//! Device identity and long-lived key material.
//!
//! The identity key store is the root of every end-to-end session: its
//! X25519 secret feeds session key agreement and its Ed25519 key signs
//! handshake offers.

pub mod identity;

pub use identity::*;
