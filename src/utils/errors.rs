//! Error types and handling for the mesh messenger.
//!
//! This module provides a unified error handling system across all components
//! of the engine. An unresolved peer, a missing session or a failed
//! authentication never surfaces here; the owning component reports it as
//! `None` or drops the packet.

use thiserror::Error;

/// Result type alias for the mesh messenger library
pub type Result<T> = std::result::Result<T, MeshError>;

/// Comprehensive error type for all mesh operations
#[derive(Error, Debug, Clone)]
pub enum MeshError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Session management errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Persistence and media store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Key agreement failure
    #[error("Key agreement failed: {reason}")]
    KeyAgreement { reason: String },

    /// Key store could not be read or written
    #[error("Key store error: {reason}")]
    KeyStore { reason: String },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Socket could not be bound
    #[error("Failed to bind {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// Network transport error
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Invalid network address
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// The per-kind inbound channel is closed
    #[error("Channel closed: {kind}")]
    ChannelClosed { kind: String },

    /// Peer discovery failure
    #[error("Peer discovery failed: {reason}")]
    DiscoveryFailed { reason: String },
}

/// Session management errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// No session exists for the peer
    #[error("Session not found for peer {peer_id}")]
    NotFound { peer_id: String },

    /// Session key derivation failure
    #[error("Session key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Unsupported protocol version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: String },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Sender claimed in a sealed payload does not match its envelope
    #[error("Sender mismatch: envelope {envelope}, payload {payload}")]
    SenderMismatch { envelope: String, payload: String },
}

/// Persistence and media store errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Record store rejected a write
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    /// Stored item does not exist
    #[error("Not found: {key}")]
    NotFound { key: String },

    /// Media file could not be saved or read
    #[error("Media error for {name}: {reason}")]
    Media { name: String, reason: String },
}

impl MeshError {
    /// Returns true if retrying the failed operation may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Transport { .. })
                | Self::Network(NetworkError::DiscoveryFailed { .. })
                | Self::Session(SessionError::NotFound { .. })
                | Self::Storage(StorageError::WriteFailed { .. })
                | Self::Storage(StorageError::Media { .. })
                | Self::Protocol(ProtocolError::MessageTooLarge { .. })
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Protocol(ProtocolError::SenderMismatch { .. })
        )
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MeshError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}

impl From<toml::ser::Error> for MeshError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(ConfigError::ParseError {
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MeshError::Crypto(CryptoError::InvalidKey {
            reason: "expected 32 bytes, got 31".to_string(),
        });
        assert!(error.to_string().contains("Invalid key"));
        assert!(error.to_string().contains("31"));
    }

    #[test]
    fn test_error_recovery() {
        let storage_error = MeshError::Storage(StorageError::WriteFailed {
            reason: "disk full".to_string(),
        });
        assert!(storage_error.is_recoverable());

        let crypto_error = MeshError::Crypto(CryptoError::SignatureVerification);
        assert!(!crypto_error.is_recoverable());

        let closed = MeshError::Network(NetworkError::ChannelClosed {
            kind: "text".to_string(),
        });
        assert!(!closed.is_recoverable());
    }

    #[test]
    fn test_security_violations() {
        let mismatch = MeshError::Protocol(ProtocolError::SenderMismatch {
            envelope: "1".to_string(),
            payload: "2".to_string(),
        });
        assert!(mismatch.is_security_violation());

        let network_error = MeshError::Network(NetworkError::Transport {
            reason: "unreachable".to_string(),
        });
        assert!(!network_error.is_security_violation());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: MeshError = io.into();
        assert!(matches!(error, MeshError::Io(ref msg) if msg.contains("missing")));
    }
}
