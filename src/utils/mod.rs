//! Utility modules for configuration, error handling, time and background tasks.

pub mod clock;
pub mod config;
pub mod errors;
pub mod tasks;

pub use clock::*;
pub use config::*;
pub use errors::*;
pub use tasks::*;
