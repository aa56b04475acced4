//! Image request descriptors.

use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// What to load: a URL plus any request attributes that select a variant.
///
/// Headers other than `Authorization` take part in the cache key, so two
/// requests for one URL with different `Accept` values are cached apart.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
}

impl ImageRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into(), method: Method::GET, headers: HeaderMap::new() }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

impl From<&str> for ImageRequest {
    fn from(url: &str) -> Self {
        Self::get(url)
    }
}

impl From<String> for ImageRequest {
    fn from(url: String) -> Self {
        Self::get(url)
    }
}
