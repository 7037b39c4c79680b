//! Authentication module for sessions, credentials and admin gating.
//!
//! This module provides:
//! - `Session`: the signed-in profile, persisted to the cache directory
//! - `SessionVault`: optional encryption of the persisted session
//! - `CredentialStore`: OS keychain storage via keyring
//! - `AdminGate`: password-gated admin token (UI gating only)

pub mod admin;
pub mod credentials;
pub mod session;
pub mod vault;

pub use admin::AdminGate;
pub use credentials::CredentialStore;
pub use session::{Session, SessionData};
pub use vault::SessionVault;
