//! Configuration management for the mesh messenger.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::defaults;
use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "mesh.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESH";

/// Complete configuration for a mesh node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Network configuration
    pub network: NetworkConfig,
    /// Cryptographic configuration
    pub crypto: CryptoConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network, presence and transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port used for every packet kind
    pub listen_port: u16,
    /// Local address to bind
    pub bind_address: String,
    /// Address advertised to peers in keepalives; `None` lets peers fall
    /// back to the group owner's view of us
    pub advertised_address: Option<String>,
    /// Address of the group owner that relays membership
    pub group_owner_address: String,
    /// Whether this device is the group owner
    pub is_group_owner: bool,
    /// Liveness broadcast period in milliseconds
    pub keepalive_interval_ms: u64,
    /// Discovery probe period in milliseconds
    pub discovery_interval_ms: u64,
    /// Directory sweep period in milliseconds
    pub sweep_interval_ms: u64,
    /// Age after which a peer is considered gone, in milliseconds
    pub liveness_timeout_ms: u64,
    /// Size of the per-kind inbound queues
    pub channel_capacity: usize,
}

/// End-to-end encryption policy for outbound payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    /// Payloads always travel in the clear
    Disabled,
    /// Seal when a live session exists, plaintext otherwise
    #[default]
    Opportunistic,
    /// Seal or drop
    Required,
}

/// Cryptographic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Idle time after which a session expires, in milliseconds
    pub session_timeout_ms: u64,
    /// Period of the session expiry sweep, in seconds
    pub session_sweep_interval_secs: u64,
    /// Outbound encryption policy
    pub encryption: EncryptionPolicy,
    /// Start a handshake with every newly seen peer
    pub auto_handshake: bool,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for the device identity and key file
    pub keys_dir: PathBuf,
    /// Directory for received and sent media
    pub media_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: defaults::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            advertised_address: None,
            group_owner_address: defaults::GROUP_OWNER_ADDRESS.to_string(),
            is_group_owner: false,
            keepalive_interval_ms: defaults::KEEPALIVE_INTERVAL_MS,
            discovery_interval_ms: defaults::DISCOVERY_INTERVAL_MS,
            sweep_interval_ms: defaults::DIRECTORY_SWEEP_INTERVAL_MS,
            liveness_timeout_ms: defaults::LIVENESS_TIMEOUT_MS,
            channel_capacity: 256,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: defaults::SESSION_TIMEOUT_MS,
            session_sweep_interval_secs: defaults::SESSION_SWEEP_INTERVAL_SECS,
            encryption: EncryptionPolicy::default(),
            auto_handshake: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mesh-messenger");
        Self::rooted_at(data_dir)
    }
}

impl StorageConfig {
    /// Storage layout with every directory under `data_dir`
    pub fn rooted_at(data_dir: PathBuf) -> Self {
        Self {
            keys_dir: data_dir.join("keys"),
            media_dir: data_dir.join("media"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// When `config_file` is `None`, `mesh.toml` in the working directory and
    /// then the platform config directory are tried in order.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("mesh-messenger")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.network = other.network;
        self.crypto = other.crypto;
        self.storage = other.storage;
        self.logging = other.logging;
        self
    }

    fn env_var(name: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}_{name}")).ok()
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Some(port) = Self::env_var("NETWORK_LISTEN_PORT") {
            self.network.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_NETWORK_LISTEN_PORT"),
                value: port,
            })?;
        }

        if let Some(address) = Self::env_var("NETWORK_ADVERTISED_ADDRESS") {
            self.network.advertised_address = Some(address);
        }

        if let Some(level) = Self::env_var("LOGGING_LEVEL") {
            self.logging.level = level;
        }

        if let Some(data_dir) = Self::env_var("STORAGE_DATA_DIR") {
            self.storage = StorageConfig::rooted_at(PathBuf::from(data_dir));
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, value: impl ToString) -> crate::utils::MeshError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                value: value.to_string(),
            }
            .into()
        }

        let network = &self.network;
        if network.listen_port == 0 {
            return Err(invalid("network.listen_port", 0));
        }

        for (field, value) in [
            ("network.keepalive_interval_ms", network.keepalive_interval_ms),
            ("network.discovery_interval_ms", network.discovery_interval_ms),
            ("network.sweep_interval_ms", network.sweep_interval_ms),
            ("crypto.session_timeout_ms", self.crypto.session_timeout_ms),
            (
                "crypto.session_sweep_interval_secs",
                self.crypto.session_sweep_interval_secs,
            ),
        ] {
            if value == 0 {
                return Err(invalid(field, 0));
            }
        }

        if network.liveness_timeout_ms <= network.sweep_interval_ms {
            return Err(invalid(
                "network.liveness_timeout_ms",
                network.liveness_timeout_ms,
            ));
        }

        if network.channel_capacity == 0 {
            return Err(invalid("network.channel_capacity", 0));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(invalid("logging.level", other)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            &self.storage.data_dir,
            &self.storage.keys_dir,
            &self.storage.media_dir,
        ];

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
