//! Messages, delivery states and call signaling.
//!
//! [`model`] holds the records shared with the persistence layer,
//! [`signaling`] the ephemeral call slots, and [`processor`] the state
//! machine that moves messages between devices.

pub mod model;
pub mod processor;
pub mod signaling;

pub use model::*;
pub use processor::{Messenger, MessengerOptions, MessengerServices};
pub use signaling::*;
