//! Per-entry metadata persisted next to each cached payload.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::ResourceKey;

/// Values that let the server answer "has this changed?".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Validator {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Freshness directives taken from `Cache-Control` / `Expires`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    /// Explicit lifetime; `Expires` is folded in here when `max-age` is absent.
    pub max_age: Option<Duration>,
    pub no_store: bool,
    pub no_cache: bool,
}

impl CacheControl {
    /// Whether the response said anything at all about freshness.
    pub fn has_signal(&self) -> bool {
        self.max_age.is_some() || self.no_store || self.no_cache
    }
}

/// Everything the cache knows about one stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub key: ResourceKey,
    pub url: String,
    pub validator: Validator,
    pub cache_control: CacheControl,
    /// Lifetime applied when the only signal is an ETag, captured from
    /// configuration when the response arrived.
    pub etag_only_ttl: Duration,
    pub stored_at: DateTime<Utc>,
    pub content_type: String,
}

impl CacheEntryMetadata {
    /// Metadata for a response that carried no caching headers.
    pub fn bare(key: ResourceKey, url: impl Into<String>, content_type: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            url: url.into(),
            validator: Validator::default(),
            cache_control: CacheControl::default(),
            etag_only_ttl: Duration::ZERO,
            stored_at: now,
            content_type: content_type.into(),
        }
    }
}
