// Error handling module
// Defines the error type surfaced to callers of the request pipeline

use thiserror::Error;

/// Errors that can occur while talking to the backend
#[derive(Error, Debug)]
pub enum ApiError {
    /// Login was refused
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Backend answered with a non-success status
    ///
    /// A 401 here means the request was already replayed once, or the
    /// session could not be refreshed.
    #[error("HTTP error: {status} - {message}")]
    Status { status: u16, message: String },

    /// Network failure, timeout or undecodable body
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Credential persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Request could not be built
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this is an authentication failure the pipeline gave up on
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
