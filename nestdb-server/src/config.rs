//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via NESTDB_CONFIG or --config)
//! 3. Environment variables
//! 4. Command line arguments (applied by the binary)

use crate::auth::SecretValidator;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Expiry sweep configuration.
    pub expiry: ExpiryConfig,
    /// Wire protocol options.
    pub protocol: ProtocolConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from `path` (or `NESTDB_CONFIG`), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("NESTDB_CONFIG") {
                Ok(path) => Self::from_file(path)?,
                Err(_) => Self::default(),
            },
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.expiry.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks the fully layered configuration before startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.port == 0 {
            return Err(ConfigError::ValidationError(
                "listen port is required".to_string(),
            ));
        }
        if self.expiry.accuracy_ms == 0 {
            return Err(ConfigError::ValidationError(
                "expiry accuracy must be at least 1ms".to_string(),
            ));
        }
        if self.network.outbound_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "outbound capacity must be at least 1".to_string(),
            ));
        }
        if self.auth.secret.is_some() && self.auth.secret_hash.is_some() {
            return Err(ConfigError::ValidationError(
                "set either auth.secret or auth.secret_hash, not both".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on. Required; 0 means unset.
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Queued event notifications per connection before new ones are dropped.
    pub outbound_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: nestdb_protocol::DEFAULT_HOST.to_string(),
            port: 0,
            max_connections: 1000,
            outbound_capacity: 256,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NESTDB_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }

        if let Ok(port) = std::env::var("NESTDB_PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }

        if let Ok(max) = std::env::var("NESTDB_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(capacity) = std::env::var("NESTDB_OUTBOUND_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.outbound_capacity = n;
            }
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret clients must present in `init`. Absent disables the gate.
    pub secret: Option<String>,
    /// SHA-256 hex digest of the shared secret, as an alternative to `secret`.
    pub secret_hash: Option<String>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("NESTDB_SECRET") {
            if !secret.is_empty() {
                self.secret = Some(secret);
                self.secret_hash = None;
            }
        }
    }

    /// Builds the validator for `init` secrets.
    pub fn validator(&self) -> SecretValidator {
        match (&self.secret, &self.secret_hash) {
            (Some(secret), _) => SecretValidator::new(Some(secret)),
            (None, Some(hash)) => SecretValidator::from_hash(Some(hash.clone())),
            (None, None) => SecretValidator::disabled(),
        }
    }

    /// Returns whether the auth gate is off.
    pub fn is_disabled(&self) -> bool {
        self.secret.is_none() && self.secret_hash.is_none()
    }
}

/// Expiry sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Milliseconds between expiry sweeps.
    pub accuracy_ms: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            accuracy_ms: nestdb_protocol::DEFAULT_EXPIRY_ACCURACY_MS,
        }
    }
}

impl ExpiryConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("NESTDB_EXPIRY_ACCURACY_MS") {
            if let Ok(n) = ms.parse() {
                self.accuracy_ms = n;
            }
        }
    }

    /// Returns the sweep interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.accuracy_ms)
    }
}

/// Wire protocol options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Include the subscription flag as `value` in `isWatching` responses.
    pub report_is_watching: bool,
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(report) = std::env::var("NESTDB_REPORT_IS_WATCHING") {
            self.report_is_watching = report == "1" || report.to_lowercase() == "true";
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("NESTDB_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("NESTDB_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Serializes SocketAddr as a string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
