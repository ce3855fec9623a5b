//! Shared HTTP plumbing for source adapters.
//!
//! - [`build_clients`] creates the pooled clients held by the context
//! - [`send_with_retry`] wraps one request in the network retry policy
//! - [`classify_status`] maps an HTTP status to a [`HarvestError`] kind
//! - [`download_bounded`] streams a body into memory under a byte ceiling

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, RequestBuilder, Response, StatusCode};
use tracing::debug;

use crate::config::HttpConfig;
use crate::harvest::retry::RetryPolicy;
use crate::harvest::traits::HarvestError;

/// The pooled clients shared by every adapter.
///
/// `api` applies `request_timeout_secs` to the whole exchange. `download`
/// only has the connect timeout: archive bodies are bounded by the byte
/// ceiling of [`download_bounded`], not by how long they take to arrive.
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub api: Client,
    pub download: Client,
}

/// Builds the API and download clients.
///
/// # Errors
///
/// Returns [`HarvestError::TransientIo`] if the TLS backend cannot be
/// initialized.
pub fn build_clients(config: &HttpConfig) -> Result<HttpClients, HarvestError> {
    let api = base_builder(config)
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(client_error)?;
    let download = base_builder(config).build().map_err(client_error)?;
    Ok(HttpClients { api, download })
}

fn base_builder(config: &HttpConfig) -> ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .user_agent(config.user_agent.clone())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
}

fn client_error(e: reqwest::Error) -> HarvestError {
    HarvestError::TransientIo(format!("Failed to build HTTP client: {}", e))
}

/// Maps a non-success status to an error kind.
///
/// 401 ⇒ auth, 404/410 ⇒ not found, 408/429/5xx ⇒ transient, anything
/// else ⇒ malformed request or response.
pub fn classify_status(status: StatusCode, context: &str) -> HarvestError {
    let message = format!("{} returned {}", context, status);
    match status {
        StatusCode::UNAUTHORIZED => HarvestError::AuthRequired(message),
        StatusCode::NOT_FOUND | StatusCode::GONE => HarvestError::NotFound(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            HarvestError::TransientIo(message)
        }
        s if s.is_server_error() => HarvestError::TransientIo(message),
        StatusCode::FORBIDDEN => HarvestError::AuthRequired(message),
        _ => HarvestError::MalformedSource(message),
    }
}

/// Whether a 403 is a rate limit rather than a permission error.
fn is_rate_limited(headers: &HeaderMap) -> bool {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);
    exhausted || headers.contains_key(RETRY_AFTER)
}

/// Passes successful responses through and converts the rest to errors.
pub fn check_status(response: Response, context: &str) -> Result<Response, HarvestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::FORBIDDEN && is_rate_limited(response.headers()) {
        return Err(HarvestError::TransientIo(format!(
            "{} rate limit exhausted",
            context
        )));
    }
    Err(classify_status(status, context))
}

/// Sends the request built by `build` under `policy`, retrying transient
/// failures. The status is checked: only 2xx responses are returned.
///
/// `build` is called once per attempt because a [`RequestBuilder`] is
/// consumed by `send`.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    context: &str,
    build: F,
) -> Result<Response, HarvestError>
where
    F: Fn() -> RequestBuilder,
{
    policy
        .run(context, || async {
            let response = build().send().await?;
            check_status(response, context)
        })
        .await
}

/// Reads a response body fully, aborting once it would exceed `ceiling`.
///
/// The declared `Content-Length` is rejected up front; the running total
/// is checked after every chunk so an undeclared or lying length cannot
/// push memory use past the ceiling by more than one chunk.
///
/// # Errors
///
/// Returns [`HarvestError::UnsafeArchive`] when the ceiling is exceeded and
/// [`HarvestError::TransientIo`] if the stream breaks.
pub async fn download_bounded(mut response: Response, ceiling: u64) -> Result<Vec<u8>, HarvestError> {
    if let Some(declared) = response.content_length() {
        if declared > ceiling {
            return Err(HarvestError::UnsafeArchive(format!(
                "declared size {} exceeds ceiling of {} bytes",
                declared, ceiling
            )));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() as u64 + chunk.len() as u64 > ceiling {
            return Err(HarvestError::UnsafeArchive(format!(
                "download exceeds ceiling of {} bytes",
                ceiling
            )));
        }
        body.extend_from_slice(&chunk);
    }

    debug!(bytes = body.len(), "Download completed");
    Ok(body)
}
