//! Application configuration management.
//!
//! Configuration is stored at `~/.config/beatcache/config.json` and covers
//! the remote endpoints, sync intervals, cache TTLs and the last display
//! name used to sign in. A few settings can be overridden from the
//! environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cache::CacheTtls;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "beatcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_SERVER_URL: &str = "BEATCACHE_SERVER_URL";
const ENV_API_KEY: &str = "BEATCACHE_API_KEY";
const ENV_UPLOAD_URL: &str = "BEATCACHE_UPLOAD_URL";
const ENV_UPLOAD_PRESET: &str = "BEATCACHE_UPLOAD_PRESET";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub upload_url: Option<String>,
    pub upload_preset: Option<String>,
    pub last_display_name: Option<String>,
    #[serde(default)]
    pub encrypt_session: bool,
    #[serde(default)]
    pub admin_password_hash: Option<String>,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Intervals and TTLs for the sync layer. Missing fields take defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Periodic profile reconciliation
    pub profile_poll_secs: u64,
    /// Fallback poll for liked songs
    pub liked_poll_secs: u64,
    pub following_ttl_secs: u64,
    pub stats_ttl_secs: u64,
    pub suggestions_ttl_secs: u64,
    pub search_ttl_secs: u64,
    pub admin_token_ttl_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let ttls = CacheTtls::default();
        Self {
            profile_poll_secs: 30,
            liked_poll_secs: 60,
            following_ttl_secs: ttls.following.as_secs(),
            stats_ttl_secs: ttls.stats.as_secs(),
            suggestions_ttl_secs: ttls.suggestions.as_secs(),
            search_ttl_secs: ttls.search.as_secs(),
            admin_token_ttl_secs: 60 * 60,
        }
    }
}

impl SyncSettings {
    pub fn profile_poll_interval(&self) -> Duration {
        // A zero period would spin
        Duration::from_secs(self.profile_poll_secs.max(1))
    }

    pub fn liked_poll_interval(&self) -> Duration {
        Duration::from_secs(self.liked_poll_secs.max(1))
    }

    pub fn admin_token_ttl(&self) -> Duration {
        Duration::from_secs(self.admin_token_ttl_secs)
    }

    pub fn cache_ttls(&self) -> CacheTtls {
        CacheTtls {
            following: Duration::from_secs(self.following_ttl_secs),
            stats: Duration::from_secs(self.stats_ttl_secs),
            suggestions: Duration::from_secs(self.suggestions_ttl_secs),
            search: Duration::from_secs(self.search_ttl_secs),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
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

    /// Apply environment overrides on top of the file settings.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(ENV_SERVER_URL) {
            self.server_url = Some(url);
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup(ENV_UPLOAD_URL) {
            self.upload_url = Some(url);
        }
        if let Some(preset) = lookup(ENV_UPLOAD_PRESET) {
            self.upload_preset = Some(preset);
        }
    }
}
