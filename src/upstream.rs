//! Upstream JSON-RPC client with connection pooling.
//!
//! One [`UpstreamClient`] is built at startup and shared by every session and
//! every rule; reqwest's pool keeps persistent connections per host. Each
//! request gets `Content-Type: application/json`, the session's header
//! snapshot, and the process-wide deadline. Responses advertising
//! `Content-Encoding: gzip` are decoded transparently by the client before
//! the body reaches the caller.
//!
//! # Error Classification
//!
//! Failures from `send()` are classified into [`ForwardError`] variants:
//! timeouts become [`ForwardError::Timeout`], everything else becomes
//! [`ForwardError::Transport`]. Non-200 statuses and body-read failures are
//! handled by the caller, which needs to release its concurrency permit in
//! between.
//!
//! # Security
//!
//! TLS certificate verification is enabled by default. The historical
//! behavior of skipping verification is available only behind the explicit
//! `accept_invalid_certs` switch.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use tracing::warn;

use crate::error::{ForwardError, GatewayError};

/// Idle connections kept per upstream host.
const MAX_IDLE_CONNS_PER_HOST: usize = 128;

/// Configuration for the shared upstream client.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Per-request deadline, covering connect, write, and read.
    pub timeout: Duration,
    /// Maximum idle pooled connections per host.
    pub pool_max_idle_per_host: usize,
    /// Disable TLS certificate verification. Off by default.
    pub accept_invalid_certs: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            pool_max_idle_per_host: MAX_IDLE_CONNS_PER_HOST,
            accept_invalid_certs: false,
        }
    }
}

/// Shared upstream HTTP client.
///
/// `Clone` is cheap: the underlying reqwest client is reference-counted and
/// the pool is shared across clones.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .tcp_nodelay(true)
            .gzip(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self { client })
    }

    /// POST a JSON-RPC body to `dst_url` with the caller's header snapshot.
    ///
    /// Returns the raw response regardless of status so the caller can drop
    /// its concurrency permit before reading the body. Transport failures are
    /// classified and logged here; the returned error carries no upstream
    /// details.
    pub async fn post(
        &self,
        dst_url: &str,
        body: Vec<u8>,
        headers: HeaderMap,
    ) -> Result<reqwest::Response, ForwardError> {
        self.client
            .post(dst_url)
            .header(CONTENT_TYPE, "application/json")
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_error(dst_url, e))
    }
}

/// Classify a reqwest failure, logging the real cause server-side only.
fn classify_error(dst_url: &str, error: reqwest::Error) -> ForwardError {
    if error.is_timeout() {
        warn!(url = %dst_url, "upstream request timed out");
        ForwardError::Timeout
    } else {
        warn!(url = %dst_url, error = %error, "upstream request failed");
        ForwardError::Transport
    }
}

/// Read the response body to completion.
pub async fn read_body(response: reqwest::Response) -> Result<bytes::Bytes, ForwardError> {
    response.bytes().await.map_err(|e| {
        warn!(error = %e, "failed to read upstream response body");
        ForwardError::BodyRead
    })
}
