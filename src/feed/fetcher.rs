use crate::config::SourceConfig;
use crate::util::validate_source_url;
use futures::StreamExt;
use secrecy::ExposeSecret;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Default limit on a single feed body (10MB)
pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

/// Errors that can occur while retrieving a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request or cycle deadline exceeded
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the configured size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// Source URL failed validation
    #[error("Invalid source URL: {0}")]
    InvalidUrl(String),
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Retrieves raw feed content for one source.
///
/// Implementations must be cancel-safe: the refresh loop drops in-flight
/// fetches when a cycle deadline passes or shutdown is requested.
pub trait Transport: Send + Sync {
    fn fetch(&self, source: &SourceConfig) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// HTTP(S) transport. No retries: a failed source is retried on the next cycle.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    max_size: usize,
    allow_private_hosts: bool,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            max_size: DEFAULT_MAX_FEED_SIZE,
            allow_private_hosts: false,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Permit localhost and private-range hosts (self-hosted CalDAV, tests).
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }
}

impl Transport for HttpTransport {
    async fn fetch(&self, source: &SourceConfig) -> Result<Vec<u8>, FetchError> {
        let url = validate_source_url(source.url.expose_secret(), self.allow_private_hosts)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        // One budget covers the request and the body read together
        let deadline = tokio::time::Instant::now() + self.timeout;

        let response = tokio::time::timeout_at(deadline, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        tokio::time::timeout_at(deadline, read_limited_bytes(response, self.max_size))
            .await
            .map_err(|_| FetchError::Timeout)?
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
