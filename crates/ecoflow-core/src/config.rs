//! Connection configuration

use crate::error::ConfigError;
use ecoflow_protocol::KeyTable;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable overriding [`ConnectionConfig::key_table_path`]
pub const ENV_KEY_TABLE: &str = "EF_KEY_TABLE";
/// Environment variable overriding [`ConnectionConfig::history_dir`]
pub const ENV_HISTORY_DIR: &str = "EF_HISTORY_DIR";

/// Timing, retry and file settings for a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on a single transport connect
    pub connect_timeout_ms: u64,
    /// Bound on all establishment retries together
    pub establish_timeout_ms: u64,
    /// Bound on each handshake response
    pub response_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_increment_ms: u64,
    pub reconnect_max_ms: u64,
    pub write_attempts: u32,
    pub write_backoff_ms: u64,
    /// Accumulated errors that force a reconnect
    pub error_threshold: u32,
    /// Reconnect after an unexpected disconnect
    pub retry: bool,
    pub key_table_path: Option<PathBuf>,
    pub history_dir: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            establish_timeout_ms: 120_000,
            response_timeout_ms: 10_000,
            reconnect_base_ms: 5_000,
            reconnect_increment_ms: 5_000,
            reconnect_max_ms: 60_000,
            write_attempts: 3,
            write_backoff_ms: 100,
            error_threshold: 10,
            retry: true,
            key_table_path: None,
            history_dir: None,
        }
    }
}

impl ConnectionConfig {
    /// Load from a JSON file; missing keys keep their defaults
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::debug!("Loaded connection config from {:?}", path);
        Ok(config)
    }

    /// Apply `EF_KEY_TABLE` and `EF_HISTORY_DIR` when set
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(ENV_KEY_TABLE) {
            self.key_table_path = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var(ENV_HISTORY_DIR) {
            self.history_dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Reject settings the lifecycle cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_attempts == 0 {
            return Err(ConfigError::Invalid("write_attempts must be at least 1".into()));
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::Invalid(
                "reconnect_max_ms is below reconnect_base_ms".into(),
            ));
        }
        Ok(())
    }

    /// Read the session key table, if one is configured
    pub async fn load_key_table(&self) -> Result<Option<KeyTable>, ConfigError> {
        let Some(path) = &self.key_table_path else {
            return Ok(None);
        };
        let data = fs::read(path).await?;
        tracing::info!("Loaded {} byte key table from {:?}", data.len(), path);
        Ok(Some(KeyTable::from_bytes(data)))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }

    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    #[must_use]
    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{ "reconnect_base_ms": 1000, "retry": false }"#).unwrap();
        assert_eq!(config.reconnect_base_ms, 1000);
        assert!(!config.retry);
        assert_eq!(config.write_attempts, 3);
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionConfig::default().validate().is_ok());
        let config = ConnectionConfig {
            write_attempts: 0,
            ..ConnectionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ecoflow-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "error_threshold": 4, "history_dir": "/tmp/ef" }"#)
            .await
            .unwrap();
        let config = ConnectionConfig::load(&path).await.unwrap();
        let _ = fs::remove_file(&path).await;
        assert_eq!(config.error_threshold, 4);
        assert_eq!(config.history_dir, Some(PathBuf::from("/tmp/ef")));
        assert!(config.load_key_table().await.unwrap().is_none());
    }
}
