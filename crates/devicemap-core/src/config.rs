//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend URL, where session tokens are kept, the last used login and the
//! session timing knobs.
//!
//! Configuration is stored at `~/.config/devicemap/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::auth::{FileStore, KeyringStore, MemoryStore, SessionSettings, TokenStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "devicemap";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/v1";

const DEFAULT_STALENESS_MARGIN_SECS: i64 = 5 * 60;
const DEFAULT_PROACTIVE_LEAD_SECS: i64 = 15 * 60;

/// Where session tokens are persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenStoreKind {
    #[default]
    File,
    Keyring,
    /// Nothing survives the process
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub token_store: TokenStoreKind,
    pub last_email: Option<String>,
    pub staleness_margin_secs: i64,
    pub proactive_lead_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            token_store: TokenStoreKind::default(),
            last_email: None,
            staleness_margin_secs: DEFAULT_STALENESS_MARGIN_SECS,
            proactive_lead_secs: DEFAULT_PROACTIVE_LEAD_SECS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            staleness_margin: Duration::seconds(self.staleness_margin_secs.max(0)),
            proactive_lead: Duration::seconds(self.proactive_lead_secs.max(0)),
        }
    }

    /// Build the configured token store.
    pub fn token_store(&self) -> Result<Arc<dyn TokenStore>> {
        let store: Arc<dyn TokenStore> = match self.token_store {
            TokenStoreKind::File => Arc::new(FileStore::new(self.cache_dir()?)),
            TokenStoreKind::Keyring => Arc::new(KeyringStore::new()),
            TokenStoreKind::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}
