use anyhow::{Context, Result};
use keyring::Entry;
use tracing::debug;

use super::vault::{decode_secret, encode_secret, SessionVault};

const SERVICE_NAME: &str = "beatcache";

/// Keychain account holding the session vault secret
const VAULT_ACCOUNT: &str = "__session_vault__";

/// OS keychain access for remembered passkeys and the vault secret.
pub struct CredentialStore;

impl CredentialStore {
    /// Remember the passkey for a display name
    pub fn store(display_name: &str, passkey: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, display_name)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(passkey)
            .context("Failed to store passkey in keychain")?;
        Ok(())
    }

    /// Retrieve the remembered passkey for a display name
    pub fn get_passkey(display_name: &str) -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, display_name)
            .context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve passkey from keychain")
    }

    /// Forget the remembered passkey for a display name
    pub fn delete(display_name: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, display_name)
            .context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete passkey from keychain")?;
        Ok(())
    }

    /// Load the vault secret, creating and storing one on first use.
    pub fn vault_secret() -> Result<Vec<u8>> {
        let entry = Entry::new(SERVICE_NAME, VAULT_ACCOUNT)
            .context("Failed to create keyring entry")?;
        match entry.get_password() {
            Ok(encoded) => decode_secret(&encoded),
            Err(keyring::Error::NoEntry) => {
                debug!("Creating session vault secret");
                let secret = SessionVault::generate_secret();
                entry
                    .set_password(&encode_secret(&secret))
                    .context("Failed to store vault secret in keychain")?;
                Ok(secret.to_vec())
            }
            Err(e) => Err(e).context("Failed to read vault secret from keychain"),
        }
    }
}
