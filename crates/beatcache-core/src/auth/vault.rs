//! Encryption at rest for the persisted session.
//!
//! The session body carries the profile's plaintext passkey, so when a vault
//! secret is available the file is sealed with ChaCha20-Poly1305. The key is
//! stretched from the secret with Argon2id; the on-disk layout is
//! `nonce (12 bytes) || ciphertext`.

use anyhow::{anyhow, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

/// Length of a generated vault secret in bytes
pub const SECRET_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Fixed salt: the secret itself is random, so the salt only separates this
/// use of it from any other.
const KEY_SALT: &[u8] = b"beatcache-session-vault-v1";

/// Argon2 cost. The input is a random 32-byte secret, not a password, so a
/// light setting is enough.
const ARGON2_MEMORY_KIB: u32 = 8 * 1024;
const ARGON2_ITERATIONS: u32 = 2;

pub struct SessionVault {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for SessionVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionVault(..)")
    }
}

impl SessionVault {
    pub fn new(secret: &[u8]) -> Result<Self> {
        let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, 1, Some(32))
            .map_err(|e| anyhow!("Invalid key derivation parameters: {}", e))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(secret, KEY_SALT, &mut key)
            .map_err(|e| anyhow!("Failed to derive session key: {}", e))?;

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    pub fn generate_secret() -> [u8; SECRET_LEN] {
        let mut secret = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        secret
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| anyhow!("Failed to encrypt session"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(anyhow!("Sealed session is truncated"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt session - wrong key or corrupted file"))
    }
}

/// Lowercase hex, for storing the secret in the keychain.
pub fn encode_secret(secret: &[u8]) -> String {
    secret.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn decode_secret(encoded: &str) -> Result<Vec<u8>> {
    if encoded.len() % 2 != 0 || !encoded.is_ascii() {
        return Err(anyhow!("Malformed vault secret"));
    }
    (0..encoded.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&encoded[i..i + 2], 16).map_err(|_| anyhow!("Malformed vault secret"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let vault = SessionVault::new(b"0123456789abcdef0123456789abcdef").expect("vault");
        let sealed = vault.seal(b"session body").expect("seal");
        assert_ne!(&sealed[NONCE_LEN..], b"session body");
        assert_eq!(vault.open(&sealed).expect("open"), b"session body");
    }

    #[test]
    fn test_wrong_secret_fails_to_open() {
        let vault = SessionVault::new(b"first secret value").expect("vault");
        let other = SessionVault::new(b"second secret value").expect("vault");
        let sealed = vault.seal(b"session body").expect("seal");
        assert!(other.open(&sealed).is_err());
        assert!(vault.open(&sealed[..4]).is_err());
    }

    #[test]
    fn test_secret_hex_round_trip() {
        let secret = SessionVault::generate_secret();
        let encoded = encode_secret(&secret);
        assert_eq!(encoded.len(), SECRET_LEN * 2);
        assert_eq!(decode_secret(&encoded).expect("decode"), secret.to_vec());
        assert!(decode_secret("abc").is_err());
        assert!(decode_secret("zz").is_err());
    }
}
