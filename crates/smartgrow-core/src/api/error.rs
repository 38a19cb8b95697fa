use thiserror::Error;

use crate::auth::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// A 401 that was handed back to the caller: an auth endpoint rejected
    /// the request, or a request already replayed once was rejected again.
    #[error("Unauthorized - credentials were rejected: {0}")]
    Unauthorized(String),

    /// The session could not be renewed and has been cleared.
    #[error("Session expired: {0}")]
    AuthExpired(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built (body encoding failed).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The stored access token cannot be sent as a bearer credential.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Credential store error: {0}")]
    CredentialStore(#[from] StoreError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
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
            401 => ApiError::Unauthorized(truncated),
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// True when the error means the user has to sign in again.
    pub fn is_session_ended(&self) -> bool {
        matches!(self, ApiError::AuthExpired(_))
    }
}
