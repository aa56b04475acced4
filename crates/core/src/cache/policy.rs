//! HTTP freshness and validation decisions.
//!
//! Pure functions: no I/O and no shared state. The coordinator asks three
//! questions of this module:
//!
//! - is a stored entry still fresh ([`CachePolicy::needs_revalidation`])
//! - which validators to send ([`CachePolicy::conditional_headers`])
//! - what to record for a new response ([`CachePolicy::derive_metadata`])
//!
//! Lifetime resolution, first match wins:
//! 1. `no-store` / `no-cache` → always revalidate
//! 2. `max-age`, else `Expires` (relative to `Date`, or receipt time)
//! 3. ETag alone → configured ETag-only lifetime (0 = always revalidate)
//! 4. nothing → always revalidate

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use http::{HeaderMap, HeaderValue, header};

use super::key::ResourceKey;
use super::metadata::{CacheControl, CacheEntryMetadata, Validator};
use crate::Error;

/// Caching behavior switches, usually built with `AppConfig::policy`.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// When false, stored entries never expire and no validators are sent.
    pub use_server_cache_policy: bool,
    pub etag_only_ttl: Duration,
    /// Lowercase media types without parameters.
    pub accepted_content_types: HashSet<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        crate::config::AppConfig::default().policy()
    }
}

impl CachePolicy {
    /// Whether a stored entry must be confirmed with the server before use.
    pub fn needs_revalidation(&self, meta: &CacheEntryMetadata, now: DateTime<Utc>) -> bool {
        if !self.use_server_cache_policy {
            return false;
        }
        if meta.cache_control.no_store || meta.cache_control.no_cache {
            return true;
        }

        let ttl = effective_ttl(meta);
        let age = now.signed_duration_since(meta.stored_at);
        age >= TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX)
    }

    /// Validator headers for a conditional request.
    ///
    /// Empty when the entry has no validators, which forces a full fetch.
    pub fn conditional_headers(&self, meta: &CacheEntryMetadata) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !self.use_server_cache_policy {
            return headers;
        }

        if let Some(etag) = &meta.validator.etag
            && let Ok(value) = HeaderValue::from_str(etag)
        {
            headers.insert(header::IF_NONE_MATCH, value);
        }
        if let Some(modified) = meta.validator.last_modified
            && let Ok(value) = HeaderValue::from_str(&format_http_date(modified))
        {
            headers.insert(header::IF_MODIFIED_SINCE, value);
        }
        headers
    }

    /// Check `Content-Type` against the accepted set.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContentType` with the offending value (or "missing").
    pub fn check_content_type(&self, headers: &HeaderMap) -> Result<String, Error> {
        let raw = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::ContentType("missing".to_string()))?;

        let media_type = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        if self.accepted_content_types.contains(&media_type) {
            Ok(media_type)
        } else {
            Err(Error::ContentType(raw.to_string()))
        }
    }

    /// Build metadata for a successful response received at `now`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContentType` when the response is not an accepted image type.
    pub fn derive_metadata(
        &self, key: ResourceKey, url: &str, headers: &HeaderMap, now: DateTime<Utc>,
    ) -> Result<CacheEntryMetadata, Error> {
        let content_type = self.check_content_type(headers)?;

        Ok(CacheEntryMetadata {
            key,
            url: url.to_string(),
            validator: parse_validator(headers),
            cache_control: parse_cache_control(headers, now),
            etag_only_ttl: self.etag_only_ttl,
            stored_at: now,
            content_type,
        })
    }

    /// Metadata after a 304 confirmed `previous`.
    ///
    /// Validators and freshness directives present on the 304 replace the
    /// stored ones; everything else carries over.
    pub fn refresh_metadata(
        &self, previous: &CacheEntryMetadata, headers: &HeaderMap, now: DateTime<Utc>,
    ) -> CacheEntryMetadata {
        let mut refreshed = previous.clone();
        refreshed.stored_at = now;

        let validator = parse_validator(headers);
        if validator.etag.is_some() {
            refreshed.validator.etag = validator.etag;
        }
        if validator.last_modified.is_some() {
            refreshed.validator.last_modified = validator.last_modified;
        }

        let cache_control = parse_cache_control(headers, now);
        if cache_control.has_signal() {
            refreshed.cache_control = cache_control;
        }
        refreshed.etag_only_ttl = self.etag_only_ttl;
        refreshed
    }
}

/// The lifetime a stored entry is granted.
pub fn effective_ttl(meta: &CacheEntryMetadata) -> Duration {
    if let Some(max_age) = meta.cache_control.max_age {
        max_age
    } else if meta.validator.etag.is_some() {
        meta.etag_only_ttl
    } else {
        Duration::ZERO
    }
}

/// Human-readable complaints about a response's caching headers.
pub fn response_warnings(headers: &HeaderMap) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    let validator = parse_validator(headers);
    let has_freshness = headers.contains_key(header::CACHE_CONTROL) || headers.contains_key(header::EXPIRES);

    if validator.is_empty() {
        warnings.push("response has no ETag or Last-Modified; it can never be revalidated");
    }
    if !has_freshness {
        if validator.etag.is_some() && validator.last_modified.is_none() {
            warnings.push("response has only an ETag; the ETag-only lifetime applies");
        } else {
            warnings.push("response has no Cache-Control or Expires; it is revalidated on every load");
        }
    }
    warnings
}

fn parse_validator(headers: &HeaderMap) -> Validator {
    let etag = header_str(headers, header::ETAG).map(str::to_string);
    let last_modified = header_str(headers, header::LAST_MODIFIED).and_then(parse_http_date);
    Validator { etag, last_modified }
}

fn parse_cache_control(headers: &HeaderMap, now: DateTime<Utc>) -> CacheControl {
    let mut control = CacheControl::default();

    for value in headers.get_all(header::CACHE_CONTROL).iter().filter_map(|v| v.to_str().ok()) {
        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "max-age" => {
                    if let Some(secs) = arg.and_then(|a| a.parse::<u64>().ok()) {
                        control.max_age = Some(Duration::from_secs(secs));
                    }
                }
                "no-store" => control.no_store = true,
                "no-cache" => control.no_cache = true,
                _ => {}
            }
        }
    }

    if control.max_age.is_none()
        && let Some(expires) = header_str(headers, header::EXPIRES)
    {
        // Unparseable Expires values (e.g. "0") mean already expired.
        let base = header_str(headers, header::DATE).and_then(parse_http_date).unwrap_or(now);
        let lifetime = parse_http_date(expires)
            .and_then(|at| at.signed_duration_since(base).to_std().ok())
            .unwrap_or(Duration::ZERO);
        control.max_age = Some(lifetime);
    }

    control
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|s| !s.is_empty())
}

/// Parse an HTTP date (IMF-fixdate / RFC 2822 form).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim()).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Format as IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> CachePolicy {
        CachePolicy::default()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn derive(pairs: &[(&'static str, &'static str)]) -> CacheEntryMetadata {
        let url = "https://x/img.png";
        policy().derive_metadata(ResourceKey::for_url(url), url, &headers(pairs), now()).unwrap()
    }

    #[test]
    fn test_max_age_freshness_window() {
        let meta = derive(&[("content-type", "image/png"), ("cache-control", "public, max-age=3600")]);
        assert_eq!(meta.cache_control.max_age, Some(Duration::from_secs(3600)));

        let p = policy();
        assert!(!p.needs_revalidation(&meta, now()));
        assert!(!p.needs_revalidation(&meta, now() + TimeDelta::seconds(3599)));
        assert!(p.needs_revalidation(&meta, now() + TimeDelta::seconds(3600)));
    }

    #[test]
    fn test_no_store_always_revalidates() {
        let meta = derive(&[("content-type", "image/png"), ("cache-control", "no-store, max-age=3600")]);
        assert!(meta.cache_control.no_store);
        assert!(policy().needs_revalidation(&meta, now()));
    }

    #[test]
    fn test_no_signal_always_revalidates() {
        let meta = derive(&[("content-type", "image/png")]);
        assert!(meta.validator.is_empty());
        assert_eq!(meta.stored_at, now());
        assert!(policy().needs_revalidation(&meta, now()));
    }

    #[test]
    fn test_etag_only_uses_configured_ttl() {
        let p = CachePolicy { etag_only_ttl: Duration::from_secs(60), ..policy() };
        let url = "https://x/img.png";
        let meta = p
            .derive_metadata(
                ResourceKey::for_url(url),
                url,
                &headers(&[("content-type", "image/png"), ("etag", "\"abc\"")]),
                now(),
            )
            .unwrap();

        assert_eq!(effective_ttl(&meta), Duration::from_secs(60));
        assert!(!p.needs_revalidation(&meta, now() + TimeDelta::seconds(59)));
        assert!(p.needs_revalidation(&meta, now() + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_etag_only_zero_ttl_revalidates() {
        let meta = derive(&[("content-type", "image/png"), ("etag", "\"abc\"")]);
        assert!(policy().needs_revalidation(&meta, now()));
    }

    #[test]
    fn test_expires_relative_to_date() {
        let meta = derive(&[
            ("content-type", "image/png"),
            ("date", "Wed, 01 May 2024 11:00:00 GMT"),
            ("expires", "Wed, 01 May 2024 11:10:00 GMT"),
        ]);
        assert_eq!(meta.cache_control.max_age, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_invalid_expires_is_expired() {
        let meta = derive(&[("content-type", "image/png"), ("expires", "0")]);
        assert_eq!(meta.cache_control.max_age, Some(Duration::ZERO));
    }

    #[test]
    fn test_max_age_wins_over_expires() {
        let meta = derive(&[
            ("content-type", "image/png"),
            ("cache-control", "max-age=5"),
            ("expires", "Wed, 01 May 2024 13:00:00 GMT"),
        ]);
        assert_eq!(meta.cache_control.max_age, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_server_policy_disabled_is_always_fresh() {
        let p = CachePolicy { use_server_cache_policy: false, ..policy() };
        let meta = derive(&[("content-type", "image/png"), ("etag", "\"abc\""), ("cache-control", "no-store")]);
        assert!(!p.needs_revalidation(&meta, now() + TimeDelta::days(365)));
        assert!(p.conditional_headers(&meta).is_empty());
    }

    #[test]
    fn test_conditional_headers() {
        let meta = derive(&[
            ("content-type", "image/png"),
            ("etag", "\"abc\""),
            ("last-modified", "Tue, 30 Apr 2024 08:00:00 GMT"),
        ]);
        let conditional = policy().conditional_headers(&meta);
        assert_eq!(conditional.get(header::IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert_eq!(conditional.get(header::IF_MODIFIED_SINCE).unwrap(), "Tue, 30 Apr 2024 08:00:00 GMT");
    }

    #[test]
    fn test_conditional_headers_empty_without_validators() {
        let meta = derive(&[("content-type", "image/png"), ("cache-control", "max-age=60")]);
        assert!(policy().conditional_headers(&meta).is_empty());
    }

    #[test]
    fn test_content_type_rejected() {
        let url = "https://x/img.png";
        let result = policy().derive_metadata(
            ResourceKey::for_url(url),
            url,
            &headers(&[("content-type", "text/html; charset=utf-8")]),
            now(),
        );
        assert!(matches!(result, Err(Error::ContentType(ct)) if ct.contains("text/html")));
    }

    #[test]
    fn test_content_type_parameters_and_case() {
        let meta = derive(&[("content-type", "Image/JPEG; q=1")]);
        assert_eq!(meta.content_type, "image/jpeg");
    }

    #[test]
    fn test_missing_content_type_rejected() {
        let result = policy().check_content_type(&HeaderMap::new());
        assert!(matches!(result, Err(Error::ContentType(_))));
    }

    #[test]
    fn test_refresh_keeps_validators_and_resets_stored_at() {
        let meta = derive(&[("content-type", "image/png"), ("etag", "\"abc\""), ("cache-control", "max-age=60")]);
        let later = now() + TimeDelta::seconds(120);
        let refreshed = policy().refresh_metadata(&meta, &HeaderMap::new(), later);

        assert_eq!(refreshed.stored_at, later);
        assert_eq!(refreshed.validator.etag.as_deref(), Some("\"abc\""));
        assert_eq!(refreshed.cache_control.max_age, Some(Duration::from_secs(60)));
        assert!(!policy().needs_revalidation(&refreshed, later));
    }

    #[test]
    fn test_refresh_takes_new_directives() {
        let meta = derive(&[("content-type", "image/png"), ("etag", "\"abc\""), ("cache-control", "max-age=60")]);
        let refreshed =
            policy().refresh_metadata(&meta, &headers(&[("etag", "\"def\""), ("cache-control", "max-age=10")]), now());
        assert_eq!(refreshed.validator.etag.as_deref(), Some("\"def\""));
        assert_eq!(refreshed.cache_control.max_age, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_http_date_round_trip() {
        let at = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        let text = format_http_date(at);
        assert_eq!(text, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(parse_http_date(&text), Some(at));
    }

    #[test]
    fn test_response_warnings() {
        assert_eq!(response_warnings(&headers(&[("etag", "\"a\""), ("cache-control", "max-age=1")])).len(), 0);
        assert_eq!(response_warnings(&HeaderMap::new()).len(), 2);
        let etag_only = response_warnings(&headers(&[("etag", "\"a\"")]));
        assert_eq!(etag_only.len(), 1);
        assert!(etag_only[0].contains("ETag-only"));
    }
}
