//! HTTP transport for image fetches.
//!
//! ### Transport seam
//! - The loader talks to the network only through [`HttpTransport`], so the
//!   fetch pipeline can run against a scripted transport in tests.
//! - [`ReqwestTransport`] is the production implementation.
//!
//! ### URL Canonicalization
//! - Trim whitespace, ensure scheme (default: `https`)
//! - Lowercase host, remove fragments
//! - Preserve query string
//!
//! ### Safety limits
//! - Max redirects: 5 (configurable)
//! - Max body bytes: 10MB (configurable)

pub mod auth;
pub mod trust;
pub mod url;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use self::auth::basic_authorization;
pub use self::trust::{PlatformTrust, TrustAnyCertificate, TrustPolicy};
pub use self::url::{UrlError, canonicalize};

use pixcache_core::AppConfig;

/// Transport-level failures: the server never produced a usable response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("response of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: u64, limit: usize },

    #[error("failed to build HTTP client: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() { TransportError::Timeout(err.to_string()) } else { TransportError::Network(err.to_string()) }
    }
}

/// A request ready to go on the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: ::url::Url,
    pub headers: HeaderMap,
}

/// Response from a transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body bytes (empty for 304)
    pub body: Bytes,
    /// Time taken to fetch in milliseconds
    pub fetch_ms: u64,
}

/// Something that can perform one HTTP exchange.
///
/// Implementations must not follow cache semantics of their own: a
/// conditional request has to surface a 304 as-is.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Configuration for the reqwest transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// User agent string (default: "pixcache/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 10MB)
    pub max_body_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,

    /// Certificate trust decision
    pub trust: Arc<dyn TrustPolicy>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for TransportConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_body_bytes: config.max_body_bytes,
            timeout: config.timeout(),
            max_redirects: config.max_redirects,
            trust: Arc::from(trust::policy_for(config.trust_any_ssl_certificate)),
        }
    }
}

/// reqwest-backed transport.
pub struct ReqwestTransport {
    http: Client,
    config: TransportConfig,
}

impl ReqwestTransport {
    /// Create a new transport with the given configuration.
    ///
    /// reqwest exposes only an all-or-nothing certificate switch, so the
    /// trust policy is asked once with an empty chain.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let accept_invalid = config.trust.should_trust(&[]);
        if accept_invalid {
            tracing::warn!("TLS certificate verification is disabled");
        }

        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .danger_accept_invalid_certs(accept_invalid)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;

        Ok(Self { http, config })
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let start = Instant::now();
        let url = request.url.clone();

        let mut headers = request.headers;
        headers
            .entry(header::ACCEPT)
            .or_insert(HeaderValue::from_static("image/*;q=0.9,*/*;q=0.5"));

        let response = self.http.request(request.method, request.url).headers(headers).send().await?;

        let status = response.status();

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_body_bytes
        {
            return Err(TransportError::TooLarge { size: len, limit: self.config.max_body_bytes });
        }

        let headers = response.headers().clone();
        let body = response.bytes().await?;

        if body.len() > self.config.max_body_bytes {
            return Err(TransportError::TooLarge { size: body.len() as u64, limit: self.config.max_body_bytes });
        }

        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!("fetched {} -> {} in {}ms ({} bytes)", url, status.as_u16(), fetch_ms, body.len());

        Ok(TransportResponse { status, headers, body, fetch_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.user_agent, "pixcache/0.1");
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.timeout, Duration::from_millis(20000));
        assert_eq!(config.max_redirects, 5);
        assert!(!config.trust.should_trust(&[]));
    }

    #[test]
    fn test_transport_config_trust_any() {
        let app = AppConfig { trust_any_ssl_certificate: true, ..Default::default() };
        let config = TransportConfig::from(&app);
        assert!(config.trust.should_trust(&[]));
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::TooLarge { size: 20, limit: 10 };
        assert_eq!(err.to_string(), "response of 20 bytes exceeds limit of 10");
    }

    #[tokio::test]
    async fn test_reqwest_transport_new() {
        let transport = ReqwestTransport::new(TransportConfig::default());
        assert!(transport.is_ok());
    }
}
