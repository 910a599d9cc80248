//! End-to-end encryption sessions and sealed envelopes.
//!
//! [`SessionEngine`] owns the per-peer session table; [`EnvelopeHandler`]
//! wraps its ciphertexts in typed envelopes for the wire.

pub mod envelope;
pub mod manager;

pub use envelope::*;
pub use manager::*;
