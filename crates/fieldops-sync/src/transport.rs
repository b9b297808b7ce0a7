//! # Sync Transport
//!
//! HTTP client for the pull and push endpoints, with per-request timeout
//! and exponential backoff.
//!
//! ## Request Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   send ──► response ──┬── 2xx ──────────────► decode body ──► Ok        │
//! │    ▲                  ├── 404 ──────────────► NotFound                  │
//! │    │                  ├── 4xx ──────────────► ServerRejection           │
//! │    │                  └── 5xx / network / timeout                       │
//! │    │                            │                                       │
//! │    │                   retries left? ── no ──► ServerFault / Transport  │
//! │    │                            │ yes                                   │
//! │    └──────── sleep(backoff) ◄───┘                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every call resolves: the timeout bounds each attempt and the retry count
//! bounds the loop. The engine depends only on [`SyncTransport`], so tests
//! and embedders can plug in their own.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Session, TransportSettings};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};

/// Header carrying the principal the device acts for.
const PRINCIPAL_HEADER: &str = "X-Principal-Id";

/// Network seam of the engine.
///
/// Implementations must always resolve (never hang) and be safe to call
/// repeatedly with the same request.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches one page of `endpoint`.
    async fn pull(
        &self,
        session: &Session,
        endpoint: &str,
        request: &PullRequest,
    ) -> SyncResult<PullResponse>;

    /// Sends one batch of mutations to `endpoint`.
    async fn push(
        &self,
        session: &Session,
        endpoint: &str,
        request: &PushRequest,
    ) -> SyncResult<PushResponse>;
}

/// [`SyncTransport`] over HTTPS with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: TransportSettings,
}

impl HttpTransport {
    /// Creates a transport with its own connection pool.
    pub fn new(config: TransportSettings) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        Ok(HttpTransport { client, config })
    }

    /// Resolves `endpoint` against the session's base URL.
    ///
    /// A missing trailing slash on the base is added, so
    /// `https://host/v1` + `sync/clients` → `https://host/v1/sync/clients`.
    pub fn endpoint_url(session: &Session, endpoint: &str) -> SyncResult<Url> {
        let mut base = Url::parse(&session.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(endpoint.trim_start_matches('/'))?)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.initial_backoff_ms),
            max_interval: Duration::from_millis(self.config.max_backoff_ms),
            multiplier: 2.0,
            max_elapsed_time: None, // bounded by max_retries instead
            ..Default::default()
        }
    }

    /// Runs `attempt` until it succeeds, fails terminally, or retries run out.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut attempt: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut backoff = self.create_backoff();
        let mut retries = 0u32;

        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.config.max_backoff_ms));
                    warn!(
                        request = what,
                        attempt = retries,
                        ?delay,
                        error = %err,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn map_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Timeout(self.config.timeout_secs)
        } else {
            SyncError::from(err)
        }
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> SyncResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(
                status.as_u16(),
                error_message(status, &body),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn pull(
        &self,
        session: &Session,
        endpoint: &str,
        request: &PullRequest,
    ) -> SyncResult<PullResponse> {
        let url = Self::endpoint_url(session, endpoint)?;
        debug!(%url, limit = request.limit, cursor = ?request.cursor, "Pulling page");

        let url = &url;
        self.with_retry(endpoint, move || async move {
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(&session.token)
                .header(PRINCIPAL_HEADER, &session.principal_id)
                .query(request)
                .send()
                .await
                .map_err(|e| self.map_error(e))?;
            self.decode(response).await
        })
        .await
    }

    async fn push(
        &self,
        session: &Session,
        endpoint: &str,
        request: &PushRequest,
    ) -> SyncResult<PushResponse> {
        let url = Self::endpoint_url(session, endpoint)?;
        debug!(%url, mutations = request.mutations.len(), "Pushing batch");

        let url = &url;
        self.with_retry(endpoint, move || async move {
            let response = self
                .client
                .post(url.clone())
                .bearer_auth(&session.token)
                .header(PRINCIPAL_HEADER, &session.principal_id)
                .json(request)
                .send()
                .await
                .map_err(|e| self.map_error(e))?;
            self.decode(response).await
        })
        .await
    }
}

/// Extracts `message` / `error` from a JSON error body, else the raw body.
fn error_message(status: StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
    });

    match message {
        Some(message) => message,
        None if body.trim().is_empty() => status.to_string(),
        None => body.trim().to_string(),
    }
}
