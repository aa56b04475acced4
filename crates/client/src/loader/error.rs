//! Loader error types.

use crate::fetch::{TransportError, UrlError};
use pixcache_core::config::ConfigError;

/// Why a load finished without an image.
///
/// Cloned to every caller that joined the same network operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The request had no usable URL. Nothing was read or sent.
    #[error("missing or invalid URL: {0}")]
    NilUrl(String),

    /// The server answered with a status other than 200 or 304.
    #[error("unexpected response code: {0}")]
    ResponseCode(u16),

    /// The response was not one of the accepted image types.
    #[error("unaccepted content type: {0}")]
    ContentType(String),

    /// The transport failed before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The initiating caller cancelled the network operation.
    #[error("request cancelled")]
    Cancelled,

    /// The body was an accepted type but not a decodable image.
    #[error("image decode failed: {0}")]
    Decode(String),
}

impl LoadError {
    pub const CODE_RESPONSE_CODE: i64 = 1;
    pub const CODE_CONTENT_TYPE: i64 = 2;
    pub const CODE_NIL_URL: i64 = 3;

    /// Stable numeric code for the kinds that have one.
    pub fn code(&self) -> Option<i64> {
        match self {
            LoadError::ResponseCode(_) => Some(Self::CODE_RESPONSE_CODE),
            LoadError::ContentType(_) => Some(Self::CODE_CONTENT_TYPE),
            LoadError::NilUrl(_) => Some(Self::CODE_NIL_URL),
            _ => None,
        }
    }

    /// Cancellation surfaces through the network-error path.
    pub fn is_network(&self) -> bool {
        matches!(self, LoadError::Network(_) | LoadError::Cancelled)
    }
}

impl From<TransportError> for LoadError {
    fn from(err: TransportError) -> Self {
        LoadError::Network(err.to_string())
    }
}

impl From<UrlError> for LoadError {
    fn from(err: UrlError) -> Self {
        LoadError::NilUrl(err.to_string())
    }
}

/// Failures while constructing an [`ImageLoader`](super::ImageLoader).
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cache directory: {0}")]
    Cache(#[from] pixcache_core::Error),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
