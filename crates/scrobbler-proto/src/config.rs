//! `config.toml`.  Every section and key is optional; missing ones take the
//! defaults below, and a missing file is written out with all defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub bridge: BridgeConfig,
    pub http: HttpConfig,
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    /// Where per-connector enable/disable choices are persisted.
    pub options_file: PathBuf,
}

/// Socket the browser-side shim connects to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_address: String,
    pub port: u16,
    /// How long to wait for the browser to answer a call.
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorsConfig {
    /// Local TOML connector list.  The built-in list is used when missing.
    pub connectors_toml: PathBuf,
}

const LOCALHOST: &str = "127.0.0.1";

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = platform::data_dir();
        Self {
            pid_file: data_dir.join("daemon.pid"),
            options_file: data_dir.join("options.json"),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: LOCALHOST.to_string(),
            port: platform::BRIDGE_TCP_PORT,
            call_timeout_ms: 5000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: LOCALHOST.to_string(),
            port: 8990,
        }
    }
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            connectors_toml: platform::config_dir().join("connectors.toml"),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path();

        if !path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.bridge.call_timeout_ms == 0 {
            anyhow::bail!("bridge.call_timeout_ms must be positive");
        }
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
