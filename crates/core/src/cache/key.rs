//! Content-addressed cache key generation.

use std::fmt;

use http::{HeaderMap, Method, header};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic identifier for a cacheable request.
///
/// A SHA-256 hex digest, so it doubles as a safe file stem on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Compute the key for a request.
    ///
    /// `url` must already be canonical. `Authorization` is excluded so that
    /// rotating credentials does not orphan cached images.
    pub fn compute(method: &Method, url: &str, headers: &HeaderMap) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(vary_string(headers).as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Key for a plain GET of `url`.
    pub fn for_url(url: &str) -> Self {
        Self::compute(&Method::GET, url, &HeaderMap::new())
    }

    /// Reinterpret a file stem found on disk.
    ///
    /// Returns `None` unless the stem is 64 lowercase hex characters.
    pub fn from_hex(stem: &str) -> Option<Self> {
        let valid = stem.len() == 64 && stem.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sorted `name:value` lines of the headers that distinguish a request.
fn vary_string(headers: &HeaderMap) -> String {
    let mut pairs: Vec<String> = headers
        .iter()
        .filter(|(name, _)| *name != header::AUTHORIZATION)
        .filter_map(|(name, value)| value.to_str().ok().map(|v| format!("{}:{}", name.as_str(), v.trim())))
        .collect();
    pairs.sort();
    pairs.join("\n")
}
