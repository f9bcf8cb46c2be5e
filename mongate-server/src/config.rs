//! Gateway configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MONGATE_CONFIG or --config)
//! 3. Environment variables

use crate::logging::DEFAULT_REQUEST_LENGTH_LIMIT;
use crate::plugins::Identity;
use bson::Document;
use mongate_wire::Compressor;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Request handling configuration.
    pub gateway: GatewaySettings,
    /// Graceful shutdown configuration.
    pub shutdown: ShutdownConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
    /// Ordered pipeline stages.
    pub plugins: Vec<PluginSpec>,
}

impl Config {
    /// Loads configuration from `path` if given, then applies environment
    /// variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse(_, msg) => ConfigError::Parse(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(PathBuf::new(), e.to_string()))
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.gateway.apply_env_overrides();
        self.shutdown.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that would make the gateway misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.idle_cursor_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "gateway.idle_cursor_timeout_secs must be positive".to_string(),
            ));
        }
        if self.gateway.cursor_reap_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "gateway.cursor_reap_interval_ms must be positive".to_string(),
            ));
        }
        if self.shutdown.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "shutdown.poll_interval_ms must be positive".to_string(),
            ));
        }
        for spec in &self.plugins {
            spec.config_document()?;
        }
        Ok(())
    }

    /// Returns the stage list as `(name, config)` pairs.
    pub fn plugin_specs(&self) -> Result<Vec<(String, Document)>, ConfigError> {
        self.plugins
            .iter()
            .map(|spec| Ok((spec.name.clone(), spec.config_document()?)))
            .collect()
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 27016)),
            max_connections: 10_000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("MONGATE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("MONGATE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }
}

/// Request handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Sliding TTL of idle cursors in seconds.
    pub idle_cursor_timeout_secs: u64,
    /// Period of the cursor expiry scan in milliseconds.
    pub cursor_reap_interval_ms: u64,
    /// Bound on logged request renderings, in bytes.
    pub request_length_limit: usize,
    /// Compressors offered to clients.
    pub compressors: Vec<Compressor>,
    /// Identity used for gateway-issued `killCursors` commands.
    pub internal_identity: Identity,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            idle_cursor_timeout_secs: 30 * 60,
            cursor_reap_interval_ms: 1000,
            request_length_limit: DEFAULT_REQUEST_LENGTH_LIMIT,
            compressors: vec![Compressor::Snappy, Compressor::Zlib, Compressor::Zstd],
            internal_identity: Identity::new("internal", "mongate-internal", vec!["root".to_string()]),
        }
    }
}

impl GatewaySettings {
    fn apply_env_overrides(&mut self) {
        if let Ok(secs) = std::env::var("MONGATE_CURSOR_TIMEOUT") {
            if let Ok(n) = secs.parse() {
                self.idle_cursor_timeout_secs = n;
            }
        }

        if let Ok(limit) = std::env::var("MONGATE_REQUEST_LENGTH_LIMIT") {
            if let Ok(n) = limit.parse() {
                self.request_length_limit = n;
            }
        }

        if let Ok(list) = std::env::var("MONGATE_COMPRESSORS") {
            let parsed: Result<Vec<Compressor>, _> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(compressors) => self.compressors = compressors,
                Err(e) => tracing::warn!("Ignoring MONGATE_COMPRESSORS: {}", e),
            }
        }
    }

    pub fn idle_cursor_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_cursor_timeout_secs)
    }

    pub fn cursor_reap_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_reap_interval_ms)
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Period of the drain loop in milliseconds.
    pub poll_interval_ms: u64,
    /// How long a connection must sit idle before the drain closes it.
    pub idle_grace_ms: u64,
    /// Delay between the termination signal and the start of the drain.
    pub term_sleep_secs: u64,
    /// Upper bound on the drain; 0 waits for every connection.
    pub deadline_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            idle_grace_ms: 5000,
            term_sleep_secs: 5,
            deadline_secs: 60,
        }
    }
}

impl ShutdownConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("MONGATE_IDLE_GRACE_MS") {
            if let Ok(n) = ms.parse() {
                self.idle_grace_ms = n;
            }
        }

        if let Ok(secs) = std::env::var("MONGATE_TERM_SLEEP") {
            if let Ok(n) = secs.parse() {
                self.term_sleep_secs = n;
            }
        }

        if let Ok(secs) = std::env::var("MONGATE_SHUTDOWN_DEADLINE") {
            if let Ok(n) = secs.parse() {
                self.deadline_secs = n;
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn term_sleep(&self) -> Duration {
        Duration::from_secs(self.term_sleep_secs)
    }

    /// Returns the drain deadline, if bounded.
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0).then(|| Duration::from_secs(self.deadline_secs))
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
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("MONGATE_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("MONGATE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// One pipeline stage: a registered name plus its configuration map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl PluginSpec {
    /// Converts the configuration map into the document passed to
    /// `Plugin::configure`. A missing map becomes an empty document.
    pub fn config_document(&self) -> Result<Document, ConfigError> {
        if self.config.is_null() {
            return Ok(Document::new());
        }
        bson::to_document(&self.config).map_err(|e| {
            ConfigError::Validation(format!("plugin {}: config must be a map: {}", self.name, e))
        })
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
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
