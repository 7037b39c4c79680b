use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionVault;
use crate::models::UserProfile;

/// Session file name in cache directory (plain JSON)
const SESSION_FILE: &str = "session.json";

/// Session file name when sealed with a vault
const SEALED_SESSION_FILE: &str = "session.bin";

/// Serialized form written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub profile: UserProfile,
    pub saved_at: DateTime<Utc>,
}

/// The signed-in user, mirrored to a file in the cache directory.
///
/// Lifecycle: created at login, refreshed by reconciliation, destroyed at
/// logout or when the remote profile disappears.
#[derive(Debug)]
pub struct Session {
    cache_dir: PathBuf,
    vault: Option<SessionVault>,
    pub data: Option<UserProfile>,
}

impl Session {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            vault: None,
            data: None,
        }
    }

    /// Seal the persisted session with `vault`.
    pub fn with_vault(mut self, vault: SessionVault) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Load session from disk. Returns whether a session was found.
    pub fn load(&mut self) -> Result<bool> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(false);
        }

        let bytes = std::fs::read(&path).context("Failed to read session file")?;
        let bytes = match self.vault {
            Some(ref vault) => vault.open(&bytes)?,
            None => bytes,
        };
        let data: SessionData =
            serde_json::from_slice(&bytes).context("Failed to parse session file")?;

        self.data = Some(data.profile);
        Ok(true)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        if let Some(ref profile) = self.data {
            let path = self.session_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = SessionData {
                profile: profile.clone(),
                saved_at: Utc::now(),
            };
            let contents = serde_json::to_vec_pretty(&data)?;
            let contents = match self.vault {
                Some(ref vault) => vault.seal(&contents)?,
                None => contents,
            };
            std::fs::write(&path, contents)
                .with_context(|| format!("Failed to write session file: {}", path.display()))?;
        }
        Ok(())
    }

    /// Clear session data, in memory and on disk
    pub fn clear(&mut self) -> Result<()> {
        self.data = None;
        for path in [
            self.cache_dir.join(SESSION_FILE),
            self.cache_dir.join(SEALED_SESSION_FILE),
        ] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Update session with new data
    pub fn update(&mut self, profile: UserProfile) {
        self.data = Some(profile);
    }

    pub fn user_id(&self) -> Option<&str> {
        self.data.as_ref().map(|p| p.id.as_str())
    }

    /// Whether the active session belongs to `user_id`.
    pub fn is_user(&self, user_id: &str) -> bool {
        self.user_id() == Some(user_id)
    }

    fn session_path(&self) -> PathBuf {
        if self.vault.is_some() {
            self.cache_dir.join(SEALED_SESSION_FILE)
        } else {
            self.cache_dir.join(SESSION_FILE)
        }
    }
}
