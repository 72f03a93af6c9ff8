// Typed wrappers for the backend's REST endpoints
//
// Every call goes through the authenticated pipeline.

mod dashboard;
mod files;
mod profile;

use std::sync::Arc;

use crate::http_client::AuthenticatedClient;

/// Endpoint wrappers sharing one authenticated client
#[derive(Clone)]
pub struct PortalApi {
    client: Arc<AuthenticatedClient>,
}

impl PortalApi {
    pub fn new(client: Arc<AuthenticatedClient>) -> Self {
        Self { client }
    }

    /// Underlying pipeline
    pub fn client(&self) -> &AuthenticatedClient {
        &self.client
    }
}

pub use files::guess_content_type;
