//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!     database credentials are never read from the file, only from the
//!     environment, and their absence stops startup.
//!
//! structure:
//!     - ServerConfig: Where the endpoint listens.
//!     - StoreConfig: Which backend holds readings, and its table.
//!     - NotifyConfig: How often the polling change feed re-reads the store
//!       (0 turns the polling feed off).
//!     - LoggingConfig: Default log filter when RUST_LOG is unset.
//!
//! ==============================================================================

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const URL_VAR: &str = "SUPABASE_URL";
pub const KEY_VAR: &str = "SUPABASE_SERVICE_ROLE_KEY";
pub const CONFIG_PATH_VAR: &str = "BIN_HOST_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Rest,
    Memory,
}

/// any key left out of `[store]` keeps its default
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub table: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotifyConfig {
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".to_string() }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Rest,
            table: "waste_bins".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { poll_interval_seconds: 5 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Credentials for the hosted database
#[derive(Clone)]
pub struct StoreCredentials {
    pub url: String,
    pub key: String,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl StoreCredentials {
    /// Read both variables; missing or empty is fatal
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("required environment variable {} is not set", name))
        };

        Ok(Self {
            url: required(URL_VAR)?,
            key: required(KEY_VAR)?,
        })
    }
}

/// Where the running configuration came from
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults { failures: Vec<String> },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
            ConfigSource::Defaults { failures } => {
                for failure in failures {
                    tracing::warn!("[CONFIG] Failed to load {}", failure);
                }
                tracing::warn!("[CONFIG] No usable config file - using defaults");
            }
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config")
    }

    /// Load with default fallback
    ///
    /// nothing is logged here since logging is configured from the result;
    /// the caller reports the returned source once the subscriber is up.
    pub fn load_or_default() -> (Self, ConfigSource) {
        let paths = match std::env::var(CONFIG_PATH_VAR) {
            Ok(explicit) => vec![PathBuf::from(explicit)],
            Err(_) => vec![
                PathBuf::from("config").join("host.toml"),
                PathBuf::from("..").join("config").join("host.toml"),
            ],
        };

        let mut failures = Vec::new();
        for path in paths {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return (config, ConfigSource::File(path)),
                    Err(e) => failures.push(format!("{}: {:#}", path.display(), e)),
                }
            }
        }

        (Self::default(), ConfigSource::Defaults { failures })
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            bind = %self.server.bind,
            backend = ?self.store.backend,
            table = %self.store.table,
            poll_interval_seconds = self.notify.poll_interval_seconds,
            log_level = %self.logging.level,
            "host configuration"
        );
    }
}
