//! Network access for the offline cache.
//!
//! ### Network seam
//! - Every outbound fetch goes through the [`Network`] trait so the policy
//!   engine, scheduler and lifecycle controller can run against any transport.
//! - [`HttpNetwork`] is the reqwest implementation.
//!
//! ### Response handling
//! - Any HTTP status is returned as a response; only transport failures are errors.
//! - Max redirects: 5
//! - Max body bytes: 5MB (configurable)
//! - Every call can be bounded with [`fetch_with_timeout`]; expiry is a network failure.

pub mod request;

pub use request::{RequestKind, ResourceRequest};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, header};
use std::time::{Duration, Instant};
use url::Url;

use offgrid_core::{AppConfig, Error};

/// Configuration for the HTTP network.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "offgrid/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "offgrid/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
        }
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            ..Default::default()
        }
    }
}

/// Response from a fetch operation.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// The original URL requested
    pub url: Url,
    /// The final URL after redirects
    pub final_url: Url,
    /// HTTP status code
    pub status: StatusCode,
    /// Content-Type header
    pub content_type: Option<String>,
    /// Response body bytes
    pub bytes: Bytes,
    /// Response headers
    pub headers: header::HeaderMap,
    /// Time taken to fetch in milliseconds
    pub fetch_ms: u64,
}

impl FetchResponse {
    fn header_str(&self, name: header::HeaderName) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    pub fn etag(&self) -> Option<String> {
        self.header_str(header::ETAG)
    }

    pub fn last_modified(&self) -> Option<String> {
        self.header_str(header::LAST_MODIFIED)
    }
}

/// Transport used for every outbound resource fetch.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform the request. Non-success statuses are responses, not errors.
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchResponse, Error>;
}

/// Run `network.fetch` bounded by `timeout`; expiry becomes [`Error::FetchTimeout`].
pub async fn fetch_with_timeout(
    network: &dyn Network, request: &ResourceRequest, timeout: Duration,
) -> Result<FetchResponse, Error> {
    match tokio::time::timeout(timeout, network.fetch(request)).await {
        Ok(result) => result,
        Err(_) => Err(Error::FetchTimeout(format!(
            "{} did not respond within {}ms",
            request.url,
            timeout.as_millis()
        ))),
    }
}

/// reqwest-backed [`Network`].
pub struct HttpNetwork {
    http: Client,
    config: FetchConfig,
}

impl HttpNetwork {
    /// Create a new HTTP network with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::NetworkFailure(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

fn transport_error(url: &Url, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::FetchTimeout(format!("{url}: {err}"))
    } else {
        Error::NetworkFailure(format!("{url}: {err}"))
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchResponse, Error> {
        let start = Instant::now();
        let url = request.url.clone();

        let mut builder = self
            .http
            .request(request.method.clone(), url.as_str())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| transport_error(&url, e))?;

        let status = response.status();

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let bytes = response.bytes().await.map_err(|e| transport_error(&url, e))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!(
                "{} bytes exceeds {}",
                bytes.len(),
                self.config.max_bytes
            )));
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            "{} {} -> {} {} in {}ms ({} bytes)",
            request.method,
            url,
            final_url,
            status.as_u16(),
            fetch_ms,
            bytes.len()
        );

        Ok(FetchResponse { url, final_url, status, content_type, bytes, headers, fetch_ms })
    }
}
