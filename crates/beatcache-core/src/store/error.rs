use thiserror::Error;

/// Errors returned by a `ProfileStore`.
///
/// A missing profile is not an error for `fetch_profile` (it returns
/// `Ok(None)`); `NotFound` is reserved for operations on a record that must
/// exist.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl StoreError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 | 403 => StoreError::AccessDenied(truncated),
            404 => StoreError::NotFound(truncated),
            409 => StoreError::Conflict(truncated),
            429 => StoreError::RateLimited,
            500..=599 => StoreError::Unavailable(truncated),
            _ => StoreError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Transient failures keep the stale local state and are retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::RateLimited | StoreError::Unavailable(_) | StoreError::NetworkError(_)
        )
    }
}
