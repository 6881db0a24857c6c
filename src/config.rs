use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Interval between outbound heartbeat tokens while connected
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How often the liveness watchdog checks for silence
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    /// Silence duration after which a connected session is timed out
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    /// Fixed delay before a reconnection attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Reconnection budget for unintentional transport closures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum size of a single binary chunk frame
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_watchdog_interval_ms() -> u64 {
    1000
}

fn default_liveness_timeout_ms() -> u64 {
    10_000
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    5
}

fn default_chunk_size() -> usize {
    16 * 1024
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Config {
    /// Load config from the default path, or create it with defaults
    pub fn load() -> Result<Self> {
        Self::load_from(get_config_path())
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(get_config_path())
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the portaldrop directory (~/.portaldrop)
pub fn get_portaldrop_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portaldrop")
}

/// Get the config file path (~/.portaldrop/config.toml)
pub fn get_config_path() -> PathBuf {
    get_portaldrop_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.relay.bind_address, "127.0.0.1:3001");
        assert_eq!(config.session.heartbeat_interval_ms, 3000);
        assert_eq!(config.session.watchdog_interval_ms, 1000);
        assert_eq!(config.session.liveness_timeout_ms, 10_000);
        assert_eq!(config.session.retry_backoff_ms, 2000);
        assert_eq!(config.session.max_retries, 5);
        assert_eq!(config.transfer.chunk_size, 16384);
    }

    #[test]
    fn test_config_save_and_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.relay.bind_address = "0.0.0.0:9000".to_string();
        config.session.max_retries = 2;
        config.save_to(&path)?;

        let loaded = Config::load_from(&path)?;
        assert_eq!(loaded.relay.bind_address, "0.0.0.0:9000");
        assert_eq!(loaded.session.max_retries, 2);
        // Untouched fields keep their defaults
        assert_eq!(loaded.transfer.chunk_size, 16384);

        Ok(())
    }

    #[test]
    fn test_load_creates_default_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path)?;
        assert!(path.exists());
        assert_eq!(config.session.max_retries, 5);

        Ok(())
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str("[session]\nmax_retries = 1\n").unwrap();
        assert_eq!(config.session.max_retries, 1);
        assert_eq!(config.session.heartbeat_interval_ms, 3000);
        assert_eq!(config.relay.bind_address, "127.0.0.1:3001");
    }
}
