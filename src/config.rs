use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::service::{Capabilities, ClientDescriptor, ClientId};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub clients: Vec<ClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            clients: Vec::new(),
        }
    }
}

/// Where lists, ledger and mirrors live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory (empty = platform data dir)
    pub data_dir: Option<String>,
    /// Database file name inside the data directory
    pub db_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            db_file: "tandem.redb".to_string(),
        }
    }
}

impl StorageConfig {
    /// Resolve the database path, creating the data directory.
    pub fn db_path(&self) -> Result<PathBuf> {
        let data_dir = match self.data_dir {
            Some(ref custom) => PathBuf::from(custom),
            None => dirs::data_dir()
                .context("Failed to get data directory")?
                .join("tandem"),
        };
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir.join(&self.db_file))
    }
}

/// Scheduled sync passes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduled passes
    pub interval_secs: u64,
    /// First retry delay after a transient failure
    pub backoff_base_secs: u64,
    /// Retry delay ceiling
    pub backoff_max_secs: u64,
    /// Concurrent passes per client when the client sets none
    pub default_max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            default_max_concurrent: 2,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// One connected external service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Non-zero client id, stable across restarts
    pub id: u32,
    pub name: String,
    /// "jellyfin", "emby", "plex", "subsonic"
    pub service: String,
    /// "playlists", "collections", "item_timestamps"
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    /// Concurrent passes against this service (0 = scheduler default)
    #[serde(default)]
    pub max_concurrent: usize,
}

fn default_capabilities() -> Vec<String> {
    vec!["playlists".to_string()]
}

impl ClientConfig {
    pub fn descriptor(&self) -> Result<ClientDescriptor> {
        if self.id == 0 {
            anyhow::bail!("Client '{}' uses reserved id 0", self.name);
        }
        Ok(ClientDescriptor {
            id: ClientId::new(self.id),
            name: self.name.clone(),
            service: self
                .service
                .parse()
                .with_context(|| format!("Invalid service for client '{}'", self.name))?,
            capabilities: Capabilities::from_names(&self.capabilities)
                .with_context(|| format!("Invalid capabilities for client '{}'", self.name))?,
            max_concurrent: self.max_concurrent,
        })
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("tandem");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Reject client entries that would break the registry.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for client in &self.clients {
            client.descriptor()?;
            if !seen.insert(client.id) {
                anyhow::bail!("Client id {} is configured twice", client.id);
            }
        }
        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
