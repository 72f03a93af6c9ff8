use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use super::store::{CredentialStore, MemoryStore};
use super::types::{redact, CredentialKind, SessionEvent, TokenPair};
use crate::error::ApiError;

const EVENT_CAPACITY: usize = 16;

/// Session context
///
/// Single-session model: at most one access and one refresh credential are
/// live at a time. The context is handed to the request pipeline explicitly
/// so tests can swap the persistence layer.
pub struct SessionContext {
    /// Credential persistence
    store: Arc<dyn CredentialStore>,

    /// Authorization value advertised to consumers outside the pipeline.
    /// Informational only: the pipeline reads the store on every send.
    default_authorization: RwLock<Option<String>>,

    /// Lifecycle notifications for the presentation layer
    events: broadcast::Sender<SessionEvent>,
}

impl SessionContext {
    /// Create a session context over an existing store
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let default_authorization = store
            .get(CredentialKind::Access)
            .map(|token| bearer(&token));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            store,
            default_authorization: RwLock::new(default_authorization),
            events,
        }
    }

    /// Create a session context backed by process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Current access credential
    pub fn access_token(&self) -> Option<String> {
        self.store.get(CredentialKind::Access)
    }

    /// Current refresh credential
    pub fn refresh_token(&self) -> Option<String> {
        self.store.get(CredentialKind::Refresh)
    }

    /// Whether an access credential is stored
    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    /// `Bearer <access>` for the most recently issued credential
    ///
    /// Mirrors the store for display and for callers that build their own
    /// requests. Requests sent through `AuthenticatedClient` do not consult it.
    pub fn default_authorization(&self) -> Option<String> {
        self.default_authorization
            .read()
            .map(|value| value.clone())
            .unwrap_or(None)
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Store a freshly issued credential pair
    pub fn establish(&self, pair: &TokenPair) -> Result<(), ApiError> {
        self.store
            .set(CredentialKind::Access, &pair.access)
            .map_err(storage_error)?;
        self.store
            .set(CredentialKind::Refresh, &pair.refresh)
            .map_err(storage_error)?;
        self.set_default_authorization(Some(bearer(&pair.access)));

        tracing::info!(access = %redact(&pair.access), "Session established");
        self.publish(SessionEvent::LoggedIn);
        Ok(())
    }

    /// Replace the access credential after a successful refresh
    ///
    /// The refresh credential is only overwritten when the server rotated it.
    pub fn apply_refresh(&self, access: &str, rotated_refresh: Option<&str>) -> Result<(), ApiError> {
        self.store
            .set(CredentialKind::Access, access)
            .map_err(storage_error)?;

        if let Some(refresh) = rotated_refresh {
            tracing::info!("Server rotated the refresh credential");
            self.store
                .set(CredentialKind::Refresh, refresh)
                .map_err(storage_error)?;
        }

        self.set_default_authorization(Some(bearer(access)));
        tracing::debug!(access = %redact(access), "Access credential replaced");
        self.publish(SessionEvent::Refreshed);
        Ok(())
    }

    /// Tear the session down after an unrecoverable authentication failure
    ///
    /// Clears both credentials and publishes [`SessionEvent::Terminated`].
    /// Navigation back to the login entry point is left to subscribers.
    pub fn terminate(&self, reason: &str) {
        tracing::warn!(reason = reason, "Terminating session");
        self.clear_credentials();
        self.publish(SessionEvent::Terminated {
            reason: reason.to_string(),
        });
    }

    /// End the session at the user's request
    pub fn logout(&self) -> Result<(), ApiError> {
        self.store
            .clear(CredentialKind::Access)
            .map_err(storage_error)?;
        self.store
            .clear(CredentialKind::Refresh)
            .map_err(storage_error)?;
        self.set_default_authorization(None);

        tracing::info!("Logged out");
        self.publish(SessionEvent::LoggedOut);
        Ok(())
    }

    fn clear_credentials(&self) {
        for kind in [CredentialKind::Access, CredentialKind::Refresh] {
            if let Err(e) = self.store.clear(kind) {
                tracing::error!(credential = %kind, error = %e, "Failed to clear credential");
            }
        }
        self.set_default_authorization(None);
    }

    fn set_default_authorization(&self, value: Option<String>) {
        if let Ok(mut current) = self.default_authorization.write() {
            *current = value;
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Format a credential as an Authorization header value
pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

fn storage_error(e: anyhow::Error) -> ApiError {
    ApiError::Storage(format!("{:#}", e))
}
