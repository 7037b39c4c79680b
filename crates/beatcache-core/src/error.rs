use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced to the caller of a user-initiated action.
///
/// Background reconciliation never returns these; it logs and keeps the
/// previous local state instead.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Display name or passkey is incorrect")]
    CredentialMismatch,

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ActionError::Validation(msg.into())
    }

    /// Whether repeating the same action later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ActionError::Store(e) => e.is_transient(),
            ActionError::Upload(_) => true,
            _ => false,
        }
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ActionError::Validation(msg) => msg.clone(),
            ActionError::CredentialMismatch => "Invalid display name or passkey".to_string(),
            ActionError::NotSignedIn => "Please sign in first".to_string(),
            ActionError::Upload(msg) => format!("Upload failed: {}", msg),
            ActionError::Store(StoreError::NotFound(_)) => "That account no longer exists".to_string(),
            ActionError::Store(e) if e.is_transient() => {
                "Unable to reach the server. Check your internet connection.".to_string()
            }
            ActionError::Store(e) => format!("Request failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ActionError::Store(StoreError::RateLimited).is_retryable());
        assert!(ActionError::Store(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!ActionError::Store(StoreError::NotFound("u1".into())).is_retryable());
        assert!(!ActionError::CredentialMismatch.is_retryable());
        assert!(!ActionError::validation("bad").is_retryable());
    }

    #[test]
    fn test_user_message() {
        assert_eq!(
            ActionError::validation("Bio is too long").user_message(),
            "Bio is too long"
        );
        assert_eq!(
            ActionError::CredentialMismatch.user_message(),
            "Invalid display name or passkey"
        );
        assert!(ActionError::Store(StoreError::Unavailable("503".into()))
            .user_message()
            .contains("internet connection"));
    }
}
