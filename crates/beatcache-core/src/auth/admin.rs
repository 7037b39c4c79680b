//! Admin dashboard gate.
//!
//! This is UI gating, not a security boundary: anything it protects must
//! also be enforced by the remote store. The password is checked against an
//! Argon2 hash from configuration and unlocking yields a random token that
//! lives in memory only and expires.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use tracing::{info, warn};

use crate::cache::Clock;
use crate::error::ActionError;

const TOKEN_LEN: usize = 32;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone)]
struct AdminToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AdminGate {
    password_hash: Option<String>,
    token_ttl: Duration,
    clock: Arc<dyn Clock>,
    token: Option<AdminToken>,
}

impl AdminGate {
    pub fn new(password_hash: Option<String>, token_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            password_hash,
            token_ttl,
            clock,
            token: None,
        }
    }

    /// Produce a PHC-format hash suitable for the `admin_password_hash` setting.
    pub fn hash_password(password: &str) -> Result<String> {
        let mut salt_bytes = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| anyhow!("Failed to encode salt: {}", e))?;
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("Failed to hash password: {}", e))?;
        Ok(hash.to_string())
    }

    pub fn is_configured(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Check the password and hand out a fresh token.
    pub fn unlock(&mut self, password: &str) -> Result<String, ActionError> {
        let Some(ref hash) = self.password_hash else {
            return Err(ActionError::validation("Admin access is not configured"));
        };
        let parsed = PasswordHash::new(hash).map_err(|e| {
            warn!(error = %e, "Malformed admin password hash");
            ActionError::validation("Admin access is misconfigured")
        })?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            warn!("Admin unlock rejected");
            return Err(ActionError::CredentialMismatch);
        }

        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        let ttl = chrono::Duration::from_std(self.token_ttl).unwrap_or(chrono::Duration::hours(1));
        self.token = Some(AdminToken {
            value: value.clone(),
            expires_at: self.clock.now() + ttl,
        });
        info!("Admin gate unlocked");
        Ok(value)
    }

    pub fn is_unlocked(&self, token: &str) -> bool {
        let now = self.clock.now();
        self.token
            .as_ref()
            .map(|t| t.value == token && now < t.expires_at)
            .unwrap_or(false)
    }

    pub fn lock(&mut self) {
        self.token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;

    #[test]
    fn test_unlock_lifecycle() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hash = AdminGate::hash_password("open sesame").expect("hash");
        let mut gate = AdminGate::new(Some(hash), Duration::from_secs(60), clock.clone());

        assert!(matches!(
            gate.unlock("wrong"),
            Err(ActionError::CredentialMismatch)
        ));

        let token = gate.unlock("open sesame").expect("unlock");
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(gate.is_unlocked(&token));
        assert!(!gate.is_unlocked("some other token"));

        clock.advance(chrono::Duration::seconds(60));
        assert!(!gate.is_unlocked(&token));

        let token = gate.unlock("open sesame").expect("unlock again");
        gate.lock();
        assert!(!gate.is_unlocked(&token));
    }

    #[test]
    fn test_unconfigured_or_malformed_gate() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut gate = AdminGate::new(None, Duration::from_secs(60), clock.clone());
        assert!(!gate.is_configured());
        assert!(matches!(gate.unlock("x"), Err(ActionError::Validation(_))));

        let mut gate = AdminGate::new(Some("plaintext".into()), Duration::from_secs(60), clock);
        assert!(matches!(gate.unlock("plaintext"), Err(ActionError::Validation(_))));
    }
}
