//! Configuration file for the kadmesh CLI.

use kadmesh_dht::{DhtConfig, NodeId};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity and persistence
    #[serde(default)]
    pub node: NodeConfig,
    /// DHT tunables
    #[serde(default)]
    pub dht: DhtConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Fixed node id (hex); random per run when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Routing state written on shutdown and read on start
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Directory for diversifications, key-blocks and value versions
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Seconds between status reports while running
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_state_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kadmesh/state.bin")
}

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kadmesh/storage")
}

fn default_status_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            state_file: default_state_file(),
            storage_dir: default_storage_dir(),
            status_interval_secs: default_status_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("kadmesh/config.toml")
    }

    /// Load config from the default path, writing the defaults there if it
    /// does not exist yet
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Configured node id
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not 64 hex digits.
    pub fn node_id(&self) -> anyhow::Result<Option<NodeId>> {
        self.node
            .id
            .as_deref()
            .map(|hex| NodeId::from_hex(hex).ok_or_else(|| anyhow::anyhow!("Invalid node id: {hex}")))
            .transpose()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.node_id()?;
        self.dht.validate()?;

        if self.node.status_interval_secs == 0 {
            anyhow::bail!("Status interval must be at least one second");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.dht, DhtConfig::default());
        assert!(config.node_id().unwrap().is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.node.id = Some("not-hex".to_string());
        assert!(config.validate().is_err());

        config.node.id = Some(NodeId::hash(b"me").to_hex());
        assert!(config.validate().is_ok());

        config.dht.k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[dht]\nnetwork = 7\nbootstrap = [\"192.0.2.1:6881\"]\n\n[logging]\nlevel = \"warn\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.dht.network, 7);
        assert_eq!(config.dht.bootstrap.len(), 1);
        assert_eq!(config.dht.k, DhtConfig::default().k);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.node.status_interval_secs, 300);
        assert!(config.node.storage_dir.ends_with("kadmesh/storage"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.node.id = Some(NodeId::hash(b"node").to_hex());
        config.dht.alpha = 3;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node.id, config.node.id);
        assert_eq!(loaded.dht.alpha, 3);
    }
}
