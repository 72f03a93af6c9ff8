// Token endpoint calls
//
// These go out over a plain client so that a failing refresh can never
// re-enter the 401 handling of the authenticated pipeline.

use anyhow::{Context, Result};
use reqwest::Client;

use super::types::{LoginRequest, RefreshRequest, RefreshResponse, TokenPair};
use crate::error::ApiError;

/// Path of the login endpoint, relative to the API base URL
pub const LOGIN_PATH: &str = "/token/";

/// Path of the refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/token/refresh/";

/// User-Agent sent with every request, tagged with a host fingerprint
pub fn user_agent() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!(
        "userportal-client/{} ({:x})",
        env!("CARGO_PKG_VERSION"),
        hasher.finish()
    )
}

/// Exchange username and password for a credential pair
pub async fn obtain_token_pair(
    client: &Client,
    url: &str,
    username: &str,
    password: &str,
) -> Result<TokenPair, ApiError> {
    tracing::info!(username = username, "Requesting credential pair");

    let response = client
        .post(url)
        .json(&LoginRequest { username, password })
        .send()
        .await?;

    let status = response.status();
    if status.as_u16() == 400 || status.as_u16() == 401 {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = %status, body = %body, "Login rejected");
        return Err(ApiError::AuthError("Invalid credentials".to_string()));
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            message,
        });
    }

    let pair: TokenPair = response.json().await?;
    if pair.access.is_empty() || pair.refresh.is_empty() {
        return Err(ApiError::AuthError(
            "Login response does not contain both credentials".to_string(),
        ));
    }

    Ok(pair)
}

/// Mint a new access credential from a refresh credential
///
/// Any transport error, non-2xx status or unexpected body shape is a failure.
pub async fn refresh_access_token(
    client: &Client,
    url: &str,
    refresh_token: &str,
) -> Result<RefreshResponse> {
    tracing::info!("Refreshing access token...");

    let response = client
        .post(url)
        .json(&RefreshRequest {
            refresh: refresh_token,
        })
        .send()
        .await
        .context("Failed to send refresh request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Refresh failed: {} - {}", status, error_text);
    }

    let data: RefreshResponse = response
        .json()
        .await
        .context("Failed to parse refresh response")?;

    if data.access.is_empty() {
        anyhow::bail!("Refresh response does not contain an access credential");
    }

    tracing::info!("Access token refreshed");
    Ok(data)
}
