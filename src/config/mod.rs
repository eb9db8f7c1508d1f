use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Complete panel-sync configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub panel: PanelConfig,
}

/// Vault configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    /// How long decrypted secrets stay in the in-memory cache (seconds)
    #[serde(default = "default_secret_cache_ttl")]
    pub secret_cache_ttl_seconds: u64,
}

fn default_secret_cache_ttl() -> u64 {
    600
}

impl VaultConfig {
    pub fn secret_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.secret_cache_ttl_seconds)
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            secret_cache_ttl_seconds: default_secret_cache_ttl(),
        }
    }
}

/// Panel client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    /// TCP connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Overall request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// How long a fetched server list stays valid (seconds)
    #[serde(default = "default_server_cache_ttl")]
    pub server_cache_ttl_seconds: u64,
    /// Hard cap on servers collected across pagination
    #[serde(default = "default_max_servers")]
    pub max_servers: usize,
    /// Store OAuth tokens encrypted in the vault so they survive restarts
    #[serde(default)]
    pub persist_tokens: bool,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_server_cache_ttl() -> u64 {
    60
}

fn default_max_servers() -> usize {
    1000
}

impl PanelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn server_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.server_cache_ttl_seconds)
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            request_timeout_seconds: default_request_timeout(),
            server_cache_ttl_seconds: default_server_cache_ttl(),
            max_servers: default_max_servers(),
            persist_tokens: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            panel: PanelConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<SyncConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path))?;
    let config: SyncConfig = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}
