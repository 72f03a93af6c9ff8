use anyhow::{Context, Result as AnyResult};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::auth::{self, redact, SessionContext, LOGIN_PATH, REFRESH_PATH};
use crate::error::{ApiError, Result};

/// One field of a multipart body
#[derive(Debug, Clone)]
pub struct MultipartField {
    name: String,
    value: FieldValue,
}

#[derive(Debug, Clone)]
enum FieldValue {
    Text(String),
    File {
        file_name: String,
        content_type: Option<String>,
        data: Bytes,
    },
}

/// Owned request body that can be rebuilt for every send
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes {
        content_type: String,
        data: Bytes,
    },
    Multipart(Vec<MultipartField>),
}

/// Snapshot of an outbound call
///
/// The snapshot is never mutated by the pipeline. Credentials are attached
/// per send, so the same snapshot can be replayed after a refresh.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: RequestBody,
}

impl PendingRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Add a header. `Authorization` is owned by the pipeline and is replaced
    /// on every send.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a JSON body
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::ValidationError(format!("Body is not serializable: {}", e)))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    /// Set a raw body
    pub fn bytes(mut self, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes {
            content_type: content_type.into(),
            data: data.into(),
        };
        self
    }

    /// Append a text field, switching the body to multipart
    pub fn text_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_field(MultipartField {
            name: name.into(),
            value: FieldValue::Text(value.into()),
        });
        self
    }

    /// Append a file field, switching the body to multipart
    pub fn file_field(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: Option<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.push_field(MultipartField {
            name: name.into(),
            value: FieldValue::File {
                file_name: file_name.into(),
                content_type,
                data: data.into(),
            },
        });
        self
    }

    fn push_field(&mut self, field: MultipartField) {
        if let RequestBody::Multipart(fields) = &mut self.body {
            fields.push(field);
        } else {
            self.body = RequestBody::Multipart(vec![field]);
        }
    }

    /// Build a transport request carrying `credential`, if any
    fn build(
        &self,
        client: &Client,
        base_url: &str,
        credential: Option<&str>,
    ) -> Result<RequestBuilder> {
        let mut headers = self.headers.clone();
        headers.remove(AUTHORIZATION);

        if let Some(token) = credential {
            match authorization_value(token) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => {
                    tracing::warn!(
                        token = %redact(token),
                        "Access credential is not a valid header value, sending unauthenticated"
                    );
                }
            }
        }

        let builder = client
            .request(self.method.clone(), join_url(base_url, &self.path))
            .headers(headers);

        let builder = match &self.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes { content_type, data } => {
                builder.header(CONTENT_TYPE, content_type.as_str()).body(data.clone())
            }
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        };

        Ok(builder)
    }
}

fn build_form(fields: &[MultipartField]) -> Result<reqwest::multipart::Form> {
    let mut form = reqwest::multipart::Form::new();
    for field in fields {
        form = match &field.value {
            FieldValue::Text(value) => form.text(field.name.clone(), value.clone()),
            FieldValue::File {
                file_name,
                content_type,
                data,
            } => {
                let mut part =
                    reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name.clone());
                if let Some(mime) = content_type {
                    part = part.mime_str(mime).map_err(|e| {
                        ApiError::ValidationError(format!("Invalid content type {}: {}", mime, e))
                    })?;
                }
                form.part(field.name.clone(), part)
            }
        };
    }
    Ok(form)
}

/// `Authorization` header value for an access credential
pub fn authorization_value(
    token: &str,
) -> std::result::Result<HeaderValue, reqwest::header::InvalidHeaderValue> {
    let mut value = HeaderValue::from_str(&auth::bearer(token))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Whether `url` shares scheme, host and port with `base_url`
pub fn same_origin(base_url: &str, url: &str) -> bool {
    match (reqwest::Url::parse(base_url), reqwest::Url::parse(url)) {
        (Ok(base), Ok(url)) => base.origin() == url.origin(),
        _ => false,
    }
}

/// Join the API base URL and a request path. Absolute URLs pass through.
pub fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Per-request retry context, carried alongside the snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attempt {
    /// Set once the request has been through the refresh path; never cleared
    pub retried: bool,

    /// Credential minted for the replay, overriding the store
    pub credential: Option<String>,
}

/// What the post-response stage does with a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not an authentication failure: hand the response to the caller
    PassThrough,

    /// Authentication failure on a replay: reject without another refresh
    Propagate,

    /// First authentication failure: refresh and replay
    Refresh,
}

/// Decide the post-response transition for `status`
pub fn classify(status: StatusCode, attempt: &Attempt) -> Verdict {
    if status != StatusCode::UNAUTHORIZED {
        Verdict::PassThrough
    } else if attempt.retried {
        Verdict::Propagate
    } else {
        Verdict::Refresh
    }
}

/// Result of one refresh, shared by every request waiting on it
#[derive(Debug, Clone, PartialEq)]
enum RefreshOutcome {
    Refreshed(String),
    Failed(String),
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Single-flight guard: at most one refresh call is in flight
#[derive(Default)]
struct RefreshGate {
    inflight: Mutex<Option<(u64, SharedRefresh)>>,
    generation: AtomicU64,
}

/// HTTP client that authenticates every request and recovers from expired
/// access credentials
pub struct AuthenticatedClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API base URL, e.g. `http://127.0.0.1:8000/api`
    base_url: String,

    /// Session credentials and lifecycle events
    session: Arc<SessionContext>,

    /// Deduplicates concurrent refreshes
    refresh_gate: Arc<RefreshGate>,
}

impl AuthenticatedClient {
    /// Create a new client
    pub fn new(
        session: Arc<SessionContext>,
        base_url: impl Into<String>,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> AnyResult<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .user_agent(auth::user_agent())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(session, base_url, client))
    }

    /// Create a client over a preconfigured transport
    pub fn with_client(
        session: Arc<SessionContext>,
        base_url: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            session,
            refresh_gate: Arc::new(RefreshGate::default()),
        }
    }

    /// Session this client authenticates with
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Log in and store the issued credential pair
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let url = join_url(&self.base_url, LOGIN_PATH);
        let pair = auth::obtain_token_pair(&self.client, &url, username, password).await?;
        self.session.establish(&pair)
    }

    /// Drop both credentials
    pub fn logout(&self) -> Result<()> {
        self.session.logout()
    }

    /// Send a request through the pipeline
    ///
    /// - 2xx: returned as-is
    /// - 401 (first time): refresh once, then replay with the new credential
    /// - 401 (on the replay) or refresh impossible: `ApiError::Status` 401
    /// - other statuses: `ApiError::Status`; network failures: `ApiError::Transport`
    pub async fn execute(&self, request: PendingRequest) -> Result<Response> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = join_url(&self.base_url, request.path());
        let foreign = !same_origin(&self.base_url, &url);
        let mut attempt = Attempt::default();

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %url,
            "Sending HTTP request"
        );

        loop {
            // Pre-send: attach the current credential, never to another origin
            let credential = if foreign {
                None
            } else {
                attempt
                    .credential
                    .clone()
                    .or_else(|| self.session.access_token())
            };
            let builder = request.build(&self.client, &self.base_url, credential.as_deref())?;

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %e,
                        url = %url,
                        replay = attempt.retried,
                        "HTTP request error"
                    );
                    return Err(ApiError::Transport(e));
                }
            };

            let status = response.status();
            tracing::debug!(request_id = %request_id, status = %status, "Received HTTP response");

            // A 401 from another origin says nothing about this session
            if foreign {
                return pass_through(response).await;
            }

            match classify(status, &attempt) {
                Verdict::PassThrough => return pass_through(response).await,
                Verdict::Propagate => {
                    tracing::warn!(
                        request_id = %request_id,
                        url = %url,
                        "Replay was rejected as well, giving up"
                    );
                    return Err(status_error(response).await);
                }
                Verdict::Refresh => {
                    attempt.retried = true;
                    tracing::info!(request_id = %request_id, url = %url, "Received 401, refreshing session");

                    match self.recover(credential.as_deref()).await {
                        Some(token) => {
                            attempt.credential = Some(token);
                            continue;
                        }
                        None => return Err(status_error(response).await),
                    }
                }
            }
        }
    }

    /// Obtain a credential to replay with after a 401 produced by `sent_with`
    async fn recover(&self, sent_with: Option<&str>) -> Option<String> {
        match (self.session.access_token(), sent_with) {
            // A concurrent refresh already replaced the rejected credential
            (Some(current), sent) if sent != Some(current.as_str()) => {
                tracing::debug!("Credential changed while in flight, replaying without refresh");
                return Some(current);
            }
            // A concurrent failure already tore the session down
            (None, Some(_)) if self.session.refresh_token().is_none() => {
                tracing::debug!("Session was terminated while in flight");
                return None;
            }
            _ => {}
        }

        match self.shared_refresh().await {
            RefreshOutcome::Refreshed(token) => Some(token),
            RefreshOutcome::Failed(reason) => {
                tracing::debug!(reason = %reason, "Refresh failed");
                None
            }
        }
    }

    /// Join the in-flight refresh or start one
    async fn shared_refresh(&self) -> RefreshOutcome {
        let (generation, refresh) = {
            let mut inflight = self.refresh_gate.inflight.lock().await;
            match inflight.as_ref() {
                // A finished refresh left behind by a cancelled waiter is stale
                Some((generation, refresh)) if refresh.peek().is_none() => {
                    tracing::debug!(generation = generation, "Joining in-flight refresh");
                    (*generation, refresh.clone())
                }
                _ => {
                    let generation = self.refresh_gate.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let refresh = run_refresh(
                        self.client.clone(),
                        join_url(&self.base_url, REFRESH_PATH),
                        self.session.clone(),
                    )
                    .boxed()
                    .shared();
                    *inflight = Some((generation, refresh.clone()));
                    (generation, refresh)
                }
            }
        };

        let outcome = refresh.await;

        let mut inflight = self.refresh_gate.inflight.lock().await;
        if matches!(inflight.as_ref(), Some((current, _)) if *current == generation) {
            *inflight = None;
        }

        outcome
    }

    /// Send and decode a JSON response
    pub async fn send_json<T: DeserializeOwned>(&self, request: PendingRequest) -> Result<T> {
        let response = self.execute(request).await?;
        Ok(response.json().await?)
    }

    /// `GET` and decode
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(PendingRequest::get(path)).await
    }

    /// `POST` a JSON body and decode
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send_json(PendingRequest::post(path).json(body)?).await
    }

    /// `PATCH` a JSON body and decode
    pub async fn patch_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.send_json(PendingRequest::patch(path).json(body)?).await
    }

    /// `DELETE`, discarding the body
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.execute(PendingRequest::delete(path)).await?;
        Ok(())
    }
}

/// Refresh over the plain transport. Terminates the session on failure.
async fn run_refresh(client: Client, url: String, session: Arc<SessionContext>) -> RefreshOutcome {
    let Some(refresh_token) = session.refresh_token() else {
        let reason = "No refresh credential available".to_string();
        session.terminate(&reason);
        return RefreshOutcome::Failed(reason);
    };

    match auth::refresh_access_token(&client, &url, &refresh_token).await {
        Ok(data) => match session.apply_refresh(&data.access, data.refresh.as_deref()) {
            Ok(()) => RefreshOutcome::Refreshed(data.access),
            Err(e) => {
                let reason = format!("Failed to store refreshed credential: {}", e);
                session.terminate(&reason);
                RefreshOutcome::Failed(reason)
            }
        },
        Err(e) => {
            tracing::error!("Token refresh failed: {:#}", e);
            let reason = format!("{:#}", e);
            session.terminate(&reason);
            RefreshOutcome::Failed(reason)
        }
    }
}

async fn pass_through(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response).await)
    }
}

async fn status_error(response: Response) -> ApiError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    tracing::debug!(status = status, body = %message, "Request failed with error response");
    ApiError::Status { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialKind, CredentialStore, MemoryStore, SessionEvent};
    use mockito::Matcher;
    use proptest::prelude::*;

    fn session_with(access: Option<&str>, refresh: Option<&str>) -> Arc<SessionContext> {
        let store = MemoryStore::new();
        if let Some(access) = access {
            store.set(CredentialKind::Access, access).unwrap();
        }
        if let Some(refresh) = refresh {
            store.set(CredentialKind::Refresh, refresh).unwrap();
        }
        Arc::new(SessionContext::new(Arc::new(store)))
    }

    fn client_for(server: &mockito::Server, session: Arc<SessionContext>) -> AuthenticatedClient {
        AuthenticatedClient::with_client(session, server.url(), Client::new())
    }

    #[test]
    fn test_classify() {
        let fresh = Attempt::default();
        let replay = Attempt {
            retried: true,
            credential: Some("A2".to_string()),
        };

        assert_eq!(classify(StatusCode::OK, &fresh), Verdict::PassThrough);
        assert_eq!(classify(StatusCode::NOT_FOUND, &fresh), Verdict::PassThrough);
        assert_eq!(classify(StatusCode::FORBIDDEN, &fresh), Verdict::PassThrough);
        assert_eq!(classify(StatusCode::UNAUTHORIZED, &fresh), Verdict::Refresh);
        assert_eq!(classify(StatusCode::UNAUTHORIZED, &replay), Verdict::Propagate);
        assert_eq!(classify(StatusCode::OK, &replay), Verdict::PassThrough);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://127.0.0.1:8000/api", "/files/"),
            "http://127.0.0.1:8000/api/files/"
        );
        assert_eq!(
            join_url("http://127.0.0.1:8000/api/", "files/"),
            "http://127.0.0.1:8000/api/files/"
        );
        assert_eq!(
            join_url("http://127.0.0.1:8000/api", "http://other/x/"),
            "http://other/x/"
        );
    }

    #[test]
    fn test_same_origin() {
        let base = "http://127.0.0.1:8000/api";
        assert!(same_origin(base, "http://127.0.0.1:8000/api/files/"));
        assert!(same_origin(base, "http://127.0.0.1:8000/media/a.pdf"));
        assert!(!same_origin(base, "http://127.0.0.1:9000/api/files/"));
        assert!(!same_origin(base, "https://127.0.0.1:8000/api/files/"));
        assert!(!same_origin(base, "http://other.example/api/files/"));
        assert!(!same_origin("not a url", "http://127.0.0.1:8000/api/"));
    }

    #[test]
    fn test_authorization_value_rejects_control_characters() {
        assert!(authorization_value("bad\ntoken").is_err());
    }

    proptest! {
        #[test]
        fn prop_authorization_is_bearer(token in "[A-Za-z0-9._~+/=-]{1,128}") {
            let value = authorization_value(&token).unwrap();
            prop_assert_eq!(value.to_str().unwrap(), format!("Bearer {}", token));
            prop_assert!(value.is_sensitive());
        }
    }

    #[test]
    fn test_multipart_builder_collects_fields() {
        let request = PendingRequest::post("/files/")
            .file_field("file", "a.txt", None, Bytes::from_static(b"hello"))
            .text_field("description", "greeting");

        match request.body() {
            RequestBody::Multipart(fields) => assert_eq!(fields.len(), 2),
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attaches_bearer_credential() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/files/")
            .match_header("authorization", "Bearer A1")
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, session_with(Some("A1"), Some("R1")));
        let files: Vec<serde_json::Value> = client.get("/files/").await.unwrap();

        assert!(files.is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_credential_sends_unauthenticated() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/dashboard/")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, Arc::new(SessionContext::in_memory()));
        let request = PendingRequest::get("/dashboard/").header(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer caller-supplied"),
        );
        let response = client.execute(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_and_replay() {
        let mut server = mockito::Server::new_async().await;
        let expired = server
            .mock("GET", "/files/")
            .match_header("authorization", "Bearer A1")
            .with_status(401)
            .with_body(r#"{"detail": "Given token not valid for any token type"}"#)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .match_header("authorization", Matcher::Missing)
            .match_body(Matcher::Json(serde_json::json!({ "refresh": "R1" })))
            .with_status(200)
            .with_body(r#"{"access": "A2"}"#)
            .expect(1)
            .create_async()
            .await;
        let replay = server
            .mock("GET", "/files/")
            .match_header("authorization", "Bearer A2")
            .with_status(200)
            .with_body(r#"[{"id": 1}]"#)
            .expect(1)
            .create_async()
            .await;

        let session = session_with(Some("A1"), Some("R1"));
        let mut events = session.subscribe();
        let client = client_for(&server, session.clone());

        let files: Vec<serde_json::Value> = client.get("/files/").await.unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(session.access_token().as_deref(), Some("A2"));
        assert_eq!(session.refresh_token().as_deref(), Some("R1"));
        assert_eq!(session.default_authorization().as_deref(), Some("Bearer A2"));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Refreshed);
        expired.assert_async().await;
        refresh.assert_async().await;
        replay.assert_async().await;
    }

    #[tokio::test]
    async fn test_replay_rejected_is_not_retried_again() {
        let mut server = mockito::Server::new_async().await;
        let _expired = server
            .mock("GET", "/profile/")
            .match_header("authorization", "Bearer A1")
            .with_status(401)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .with_status(200)
            .with_body(r#"{"access": "A2"}"#)
            .expect(1)
            .create_async()
            .await;
        let replay = server
            .mock("GET", "/profile/")
            .match_header("authorization", "Bearer A2")
            .with_status(401)
            .with_body("still no")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, session_with(Some("A1"), Some("R1")));
        let err = client.execute(PendingRequest::get("/profile/")).await.unwrap_err();

        assert!(err.is_unauthorized());
        assert!(matches!(err, ApiError::Status { ref message, .. } if message == "still no"));
        refresh.assert_async().await;
        replay.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_refresh_credential_terminates() {
        let mut server = mockito::Server::new_async().await;
        let _rejected = server
            .mock("GET", "/files/")
            .with_status(401)
            .with_body("expired")
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .expect(0)
            .create_async()
            .await;

        let session = session_with(Some("A1"), None);
        assert_eq!(session.refresh_token(), None);
        let mut events = session.subscribe();
        let client = client_for(&server, session.clone());

        let err = client.execute(PendingRequest::get("/files/")).await.unwrap_err();

        assert!(matches!(err, ApiError::Status { status: 401, ref message } if message == "expired"));
        assert_eq!(session.access_token(), None);
        assert!(matches!(events.try_recv().unwrap(), SessionEvent::Terminated { .. }));
        assert!(events.try_recv().is_err());
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_both_and_terminates_once() {
        let mut server = mockito::Server::new_async().await;
        let _rejected = server
            .mock("GET", "/files/")
            .with_status(401)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let session = session_with(Some("A1"), Some("R1"));
        let mut events = session.subscribe();
        let client = client_for(&server, session.clone());

        let err = client.execute(PendingRequest::get("/files/")).await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(session.access_token(), None);
        assert_eq!(session.refresh_token(), None);
        assert_eq!(session.default_authorization(), None);
        assert!(matches!(events.try_recv().unwrap(), SessionEvent::Terminated { .. }));
        assert!(events.try_recv().is_err());
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_without_refresh() {
        let mut server = mockito::Server::new_async().await;
        let _missing = server
            .mock("GET", "/files/99/")
            .with_status(404)
            .with_body(r#"{"detail": "Not found."}"#)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .expect(0)
            .create_async()
            .await;

        let session = session_with(Some("A1"), Some("R1"));
        let client = client_for(&server, session.clone());

        let err = client.execute(PendingRequest::get("/files/99/")).await.unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert_eq!(session.access_token().as_deref(), Some("A1"));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_error_is_surfaced_verbatim() {
        let session = session_with(Some("A1"), Some("R1"));
        let mut events = session.subscribe();
        // Nothing listens on port 1
        let client =
            AuthenticatedClient::with_client(session.clone(), "http://127.0.0.1:1", Client::new());

        let err = client.execute(PendingRequest::get("/files/")).await.unwrap_err();

        assert!(matches!(err, ApiError::Transport(_)));
        assert_eq!(session.access_token().as_deref(), Some("A1"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multipart_upload_is_replayed() {
        let mut server = mockito::Server::new_async().await;
        let expired = server
            .mock("POST", "/files/")
            .match_header("authorization", "Bearer A1")
            .match_header("content-type", Matcher::Regex("multipart/form-data".to_string()))
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let _refresh = server
            .mock("POST", "/token/refresh/")
            .with_status(200)
            .with_body(r#"{"access": "A2"}"#)
            .create_async()
            .await;
        let replay = server
            .mock("POST", "/files/")
            .match_header("authorization", "Bearer A2")
            .match_header("content-type", Matcher::Regex("multipart/form-data".to_string()))
            .match_body(Matcher::Regex("hello world".to_string()))
            .with_status(201)
            .with_body(r#"{"id": 7}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, session_with(Some("A1"), Some("R1")));
        let request = PendingRequest::post("/files/")
            .file_field("file", "notes.txt", Some("text/plain".to_string()), "hello world")
            .text_field("description", "notes");

        let response = client.execute(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        expired.assert_async().await;
        replay.assert_async().await;
    }

    #[tokio::test]
    async fn test_stale_credential_skips_refresh() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .expect(0)
            .create_async()
            .await;

        let session = session_with(Some("A2"), Some("R1"));
        let client = client_for(&server, session);

        // Rejected with A1 while the store already holds A2
        let token = client.recover(Some("A1")).await;

        assert_eq!(token.as_deref(), Some("A2"));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_terminated_session_is_not_torn_down_again() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .expect(0)
            .create_async()
            .await;

        let session = session_with(None, None);
        let mut events = session.subscribe();
        let client = client_for(&server, session);

        // Sent with A1, but another request's failed refresh cleared the store
        let token = client.recover(Some("A1")).await;

        assert_eq!(token, None);
        assert!(events.try_recv().is_err());
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_network_failure_clears_both_and_terminates_once() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        // Answers the first request with 401, then stops listening so the
        // refresh call cannot connect
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let backend = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let session = session_with(Some("A1"), Some("R1"));
        let mut events = session.subscribe();
        let transport = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        let client = AuthenticatedClient::with_client(session.clone(), base_url, transport);

        let err = client.execute(PendingRequest::get("/files/")).await.unwrap_err();
        backend.await.unwrap();

        assert!(err.is_unauthorized(), "unexpected error: {}", err);
        assert_eq!(session.access_token(), None);
        assert_eq!(session.refresh_token(), None);
        assert!(matches!(events.try_recv().unwrap(), SessionEvent::Terminated { .. }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_undecodable_refresh_response_terminates() {
        let mut server = mockito::Server::new_async().await;
        let _rejected = server
            .mock("GET", "/files/")
            .with_status(401)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .with_status(200)
            .with_body("<html>gateway error</html>")
            .expect(1)
            .create_async()
            .await;

        let session = session_with(Some("A1"), Some("R1"));
        let mut events = session.subscribe();
        let client = client_for(&server, session.clone());

        let err = client.execute(PendingRequest::get("/files/")).await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(session.access_token(), None);
        assert_eq!(session.refresh_token(), None);
        assert!(matches!(events.try_recv().unwrap(), SessionEvent::Terminated { .. }));
        assert!(events.try_recv().is_err());
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_finished_refresh_is_not_reused() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .with_status(200)
            .with_body(r#"{"access": "A3"}"#)
            .expect(1)
            .create_async()
            .await;

        let session = session_with(Some("A2"), Some("R1"));
        let client = client_for(&server, session.clone());

        // Result of an earlier refresh whose waiter went away before clearing the slot
        let finished = async { RefreshOutcome::Refreshed("A2".to_string()) }
            .boxed()
            .shared();
        finished.clone().await;
        *client.refresh_gate.inflight.lock().await = Some((1, finished));
        client.refresh_gate.generation.store(1, Ordering::SeqCst);

        let outcome = client.shared_refresh().await;

        assert_eq!(outcome, RefreshOutcome::Refreshed("A3".to_string()));
        assert_eq!(session.access_token().as_deref(), Some("A3"));
        assert!(client.refresh_gate.inflight.lock().await.is_none());
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_pin_refresh() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .with_status(200)
            .with_body(r#"{"access": "A2"}"#)
            .expect(2)
            .create_async()
            .await;

        let session = session_with(Some("A1"), Some("R1"));
        let client = Arc::new(client_for(&server, session.clone()));

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.shared_refresh().await })
        };

        // Hold the gate while the refresh is in flight so the first waiter
        // cannot clear its slot, then cancel it once the refresh completed
        let gate = loop {
            let gate = client.refresh_gate.inflight.lock().await;
            if gate.is_some() {
                break gate;
            }
            drop(gate);
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        while session.access_token().as_deref() != Some("A2") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        first.abort();
        let _ = first.await;
        drop(gate);

        let outcome = client.shared_refresh().await;

        assert_eq!(outcome, RefreshOutcome::Refreshed("A2".to_string()));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_foreign_origin_gets_no_credential() {
        let mut other = mockito::Server::new_async().await;
        let external = other
            .mock("GET", "/shared/report.pdf")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/token/refresh/")
            .expect(0)
            .create_async()
            .await;

        let session = session_with(Some("A1"), Some("R1"));
        let mut events = session.subscribe();
        let client = client_for(&server, session.clone());

        let url = format!("{}/shared/report.pdf", other.url());
        let err = client.execute(PendingRequest::get(url)).await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert_eq!(session.access_token().as_deref(), Some("A1"));
        assert!(events.try_recv().is_err());
        external.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_then_logout() {
        let mut server = mockito::Server::new_async().await;
        let _login = server
            .mock("POST", "/token/")
            .with_status(200)
            .with_body(r#"{"access": "A1", "refresh": "R1"}"#)
            .create_async()
            .await;

        let client = client_for(&server, Arc::new(SessionContext::in_memory()));
        tokio_test::assert_ok!(client.login("alice", "pw").await);
        assert_eq!(client.session().access_token().as_deref(), Some("A1"));
        assert_eq!(client.session().refresh_token().as_deref(), Some("R1"));

        client.logout().unwrap();
        assert!(!client.session().is_authenticated());
    }
}
