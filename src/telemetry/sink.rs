//! Remote object-storage sink
//!
//! The control plane only needs `put` and `close` from remote storage.
//! [`HttpObjectStore`] speaks plain HTTP: objects are `PUT` to
//! `{endpoint}/{identity}/{namespace}/{name}` with a bearer token.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default storage scope requested for uploads
pub const DEFAULT_SCOPE: &str = "devstorage.full_control";

/// Upload timeout
const PUT_TIMEOUT: Duration = Duration::from_secs(15);

/// Remote storage errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Invalid storage credentials: {0}")]
    InvalidCredentials(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Where telemetry goes
#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Store `bytes` as object `name`, replacing any previous version
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), SinkError>;

    /// Release the client; later puts fail
    async fn close(&self);
}

/// Construction parameters of a sink
#[derive(Clone)]
pub struct SinkConfig {
    /// Project or account the bucket belongs to
    pub identity: String,
    /// Access scope requested for uploads
    pub scope: String,
    /// Raw credentials document
    pub credentials: Vec<u8>,
    /// Bucket / prefix objects are written under
    pub namespace: String,
}

impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("identity", &self.identity)
            .field("scope", &self.scope)
            .field("credentials", &"<redacted>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Credentials document: `{"endpoint": "...", "token": "..."}`
#[derive(Deserialize)]
struct Credentials {
    endpoint: String,
    token: String,
}

/// Object store reached over HTTP
pub struct HttpObjectStore {
    client: reqwest::Client,
    base: Url,
    token: String,
    identity: String,
    scope: String,
    namespace: String,
    closed: AtomicBool,
}

impl HttpObjectStore {
    /// Validate credentials and build the client.
    ///
    /// # Errors
    /// Malformed credentials, an unusable endpoint or an empty token.
    pub fn new(config: SinkConfig) -> Result<Self, SinkError> {
        let credentials: Credentials = serde_json::from_slice(&config.credentials)
            .map_err(|e| SinkError::InvalidCredentials(e.to_string()))?;

        if credentials.token.trim().is_empty() {
            return Err(SinkError::InvalidCredentials("empty token".to_string()));
        }
        if config.identity.is_empty() || config.namespace.is_empty() {
            return Err(SinkError::InvalidCredentials(
                "identity and namespace are required".to_string(),
            ));
        }

        let base = Url::parse(&credentials.endpoint)
            .map_err(|e| SinkError::InvalidCredentials(format!("endpoint: {e}")))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(SinkError::InvalidCredentials(format!(
                "endpoint {base} is not an http(s) base URL"
            )));
        }

        let client = reqwest::Client::builder().timeout(PUT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base,
            token: credentials.token,
            identity: config.identity,
            scope: config.scope,
            namespace: config.namespace,
            closed: AtomicBool::new(false),
        })
    }

    /// Full URL of object `name`
    pub fn object_url(&self, name: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&self.identity)
                .push(&self.namespace)
                .push(name);
        }
        url
    }
}

#[async_trait]
impl RemoteSink for HttpObjectStore {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Upload("sink is closed".to_string()));
        }

        let response = self
            .client
            .put(self.object_url(name))
            .bearer_auth(&self.token)
            .header("x-storage-scope", &self.scope)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Upload(format!("{name}: status {status}")));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
