//! Configuration system for sluice.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. first command-line argument
//!   2. $SLUICE_CONFIG (explicit override)
//!   3. $XDG_CONFIG_HOME/sluice/config.toml
//!   4. ~/.config/sluice/config.toml
//!
//! A file named by 1 or 2 must exist. Only the default locations are seeded
//! with a default config when missing.
//!
//! Files ending in `.json` are parsed as JSON, everything else as TOML.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::addr::{parse_endpoint, parse_endpoint_list};
use crate::filter::ObfuscationFilter;

/// Upper bound on datagrams read per readiness event.
pub const MAX_RECV_BATCH: usize = 64;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub runtime: RuntimeConfig,
    #[serde(rename = "proxy")]
    pub proxies: Vec<ProxyConfig>,
}

/// Settings shared by every proxy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How often idle sessions are swept.
    pub reaper_interval_secs: u64,
    /// How often a stats snapshot is logged. 0 = never.
    pub stats_interval_secs: u64,
    /// Slots per allocator block (buffers and send requests).
    pub pool_block_size: usize,
}

/// One listener and the upstreams it forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Label used in logs. Defaults to the source endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Listening endpoint, `host:port`.
    pub source: String,
    /// Upstream endpoints, comma-separated or as a list.
    pub destinations: Destinations,
    /// Sessions idle this long are evicted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Datagrams read per readiness event. 1 = no batching.
    #[serde(default = "default_recv_batch")]
    pub recv_batch: usize,
    /// SO_RCVBUF for every socket of this instance. 0 = OS default.
    #[serde(default)]
    pub recv_buffer_size: usize,
    /// SO_SNDBUF for every socket of this instance. 0 = OS default.
    #[serde(default)]
    pub send_buffer_size: usize,
    /// Log every forwarded datagram at trace level.
    #[serde(default)]
    pub debug: bool,
    /// Prefix XOR. Absent = disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfuscation: Option<ObfuscationConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Destinations {
    Joined(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationConfig {
    pub key: u8,
    pub size: usize,
}

/// A proxy instance with every endpoint resolved and every limit checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: String,
    pub source: SocketAddr,
    pub destinations: Vec<SocketAddr>,
    pub obfuscation: ObfuscationFilter,
    pub idle_timeout: Duration,
    pub recv_batch: usize,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    pub debug: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_recv_batch() -> usize {
    1
}

impl Default for SluiceConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            proxies: vec![ProxyConfig::new("127.0.0.1:1234", "8.8.8.8:53")],
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reaper_interval_secs: 5,
            stats_interval_secs: 30,
            pool_block_size: 100,
        }
    }
}

impl ProxyConfig {
    /// Instance with default settings.
    pub fn new(source: &str, destinations: &str) -> Self {
        Self {
            name: None,
            source: source.to_string(),
            destinations: Destinations::Joined(destinations.to_string()),
            idle_timeout_secs: default_idle_timeout_secs(),
            recv_batch: default_recv_batch(),
            recv_buffer_size: 0,
            send_buffer_size: 0,
            debug: false,
            obfuscation: None,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("sluice")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to parse {0}: {1}")]
    JsonFailed(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(String),
    #[error("no proxy instances configured")]
    NoInstances,
    #[error("invalid endpoint '{value}': {reason}")]
    InvalidEndpoint { value: String, reason: String },
    #[error("proxy '{instance}' has no destinations")]
    NoDestinations { instance: String },
    #[error("proxy '{instance}' mixes IPv4 and IPv6 destinations")]
    MixedFamilies { instance: String },
    #[error("proxy '{}': recv_batch must be between 1 and {}, got {}", .instance, MAX_RECV_BATCH, .value)]
    InvalidBatch { instance: String, value: usize },
    #[error("proxy '{instance}': idle_timeout_secs must be greater than zero")]
    ZeroIdleTimeout { instance: String },
    #[error("runtime: {0} must be greater than zero")]
    ZeroInterval(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SluiceConfig {
    /// Load config from `path`, falling back to defaults if it does not
    /// exist. Env overrides are applied either way.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::parse(path, &text)?
        } else {
            SluiceConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse config text; the format follows the file extension.
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        if is_json(path) {
            serde_json::from_str(text).map_err(|e| ConfigError::JsonFailed(path.to_path_buf(), e))
        } else {
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
        }
    }

    /// Find and load the config file.
    ///
    /// A path named on the command line or in $SLUICE_CONFIG must exist.
    /// Only the default location is seeded with a default config on first
    /// start. Returns the path that was used alongside the config.
    pub fn locate(cli: Option<PathBuf>) -> Result<(PathBuf, Self), ConfigError> {
        let explicit = cli.or_else(|| std::env::var_os("SLUICE_CONFIG").map(PathBuf::from));
        if let Some(path) = explicit {
            let config = Self::load_existing(&path)?;
            return Ok((path, config));
        }

        let path = config_dir().join("config.toml");
        if let Err(e) = Self::write_default_if_missing(&path) {
            tracing::warn!(error = %e, "failed to write default config");
        }
        let config = Self::load_from(&path)?;
        Ok((path, config))
    }

    /// Load config from `path`, which must exist.
    pub fn load_existing(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ReadFailed(
                path.to_path_buf(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such config file"),
            ));
        }
        Self::load_from(path)
    }

    /// Write default config to `path` if nothing is there. Returns the path.
    pub fn write_default_if_missing(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let defaults = SluiceConfig::default();
            let text = if is_json(path) {
                serde_json::to_string_pretty(&defaults)
                    .map_err(|e| ConfigError::SerializeFailed(e.to_string()))?
            } else {
                toml::to_string_pretty(&defaults)
                    .map_err(|e| ConfigError::SerializeFailed(e.to_string()))?
            };
            std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(path.to_path_buf())
    }

    /// Apply SLUICE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SLUICE_RUNTIME__REAPER_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.runtime.reaper_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SLUICE_RUNTIME__STATS_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.runtime.stats_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SLUICE_RUNTIME__POOL_BLOCK_SIZE") {
            if let Ok(n) = v.parse() {
                self.runtime.pool_block_size = n;
            }
        }
    }

    /// Check runtime settings and resolve every proxy instance.
    ///
    /// Runs before any socket is opened, so a typo in one endpoint stops the
    /// process with a readable message instead of a half-started daemon.
    pub fn resolve(&self) -> Result<Vec<InstanceConfig>, ConfigError> {
        if self.proxies.is_empty() {
            return Err(ConfigError::NoInstances);
        }
        if self.runtime.reaper_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("reaper_interval_secs"));
        }
        self.proxies.iter().map(ProxyConfig::resolve).collect()
    }
}

impl ProxyConfig {
    /// Resolve endpoints and validate limits.
    pub fn resolve(&self) -> Result<InstanceConfig, ConfigError> {
        let source = parse_endpoint(&self.source)?;
        let instance = self.name.clone().unwrap_or_else(|| self.source.trim().to_string());

        let destinations = match &self.destinations {
            Destinations::Joined(text) => parse_endpoint_list(text)?,
            Destinations::List(items) => items
                .iter()
                .map(|item| parse_endpoint(item))
                .collect::<Result<Vec<_>, _>>()?,
        };
        let Some(first) = destinations.first() else {
            return Err(ConfigError::NoDestinations { instance });
        };
        if destinations.iter().any(|d| d.is_ipv4() != first.is_ipv4()) {
            return Err(ConfigError::MixedFamilies { instance });
        }

        if self.recv_batch == 0 || self.recv_batch > MAX_RECV_BATCH {
            return Err(ConfigError::InvalidBatch {
                instance,
                value: self.recv_batch,
            });
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ZeroIdleTimeout { instance });
        }

        let obfuscation = self
            .obfuscation
            .map(|o| ObfuscationFilter::new(o.key, o.size))
            .unwrap_or_else(ObfuscationFilter::disabled);

        Ok(InstanceConfig {
            name: instance,
            source,
            destinations,
            obfuscation,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            recv_batch: self.recv_batch,
            recv_buffer_size: self.recv_buffer_size,
            send_buffer_size: self.send_buffer_size,
            debug: self.debug,
        })
    }
}
