// Authentication types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which of the two session credentials an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Short-lived bearer token sent with every request
    Access,

    /// Longer-lived token used only against the refresh endpoint
    Refresh,
}

impl CredentialKind {
    /// Key under which the credential is persisted
    pub fn storage_key(self) -> &'static str {
        match self {
            CredentialKind::Access => "access_token",
            CredentialKind::Refresh => "refresh_token",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key())
    }
}

/// Login request body for `POST /token/`
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Credential pair issued at login
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Refresh request body for `POST /token/refresh/`
#[derive(Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

/// Refresh response body
///
/// The backend only returns `access` today. A rotated `refresh` is accepted
/// when present.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Lifecycle notifications published by the session context
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Credentials were stored after a successful login
    LoggedIn,

    /// A new access credential replaced the old one
    Refreshed,

    /// Refresh was impossible; both credentials were cleared and the user
    /// has to authenticate again
    Terminated { reason: String },

    /// The user ended the session explicitly
    LoggedOut,
}

/// Shorten a token for log output
pub fn redact(token: &str) -> String {
    let shown: String = token.chars().take(8).collect();
    if shown.len() < token.len() {
        format!("{}...", shown)
    } else {
        shown
    }
}
