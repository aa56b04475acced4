//! URL canonicalization for consistent cache keys.

/// Error type for URL canonicalization failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host: {0}")]
    MissingHost(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Canonicalize an image URL so equivalent spellings share one cache entry.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Default scheme to https:// if missing
/// 3. Lowercase the host (the `url` crate also drops default ports)
/// 4. Remove fragment (#...), which never reaches the server
/// 5. Keep query string intact (do not reorder)
pub fn canonicalize(input: &str) -> Result<url::Url, UrlError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let url_str = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };

    let mut parsed = url::Url::parse(&url_str).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_lowercase)
        .ok_or_else(|| UrlError::MissingHost(trimmed.to_string()))?;
    parsed.set_host(Some(&host)).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    parsed.set_fragment(None);

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_basic() {
        let url = canonicalize("https://x/img.png").unwrap();
        assert_eq!(url.as_str(), "https://x/img.png");
    }

    #[test]
    fn test_canonicalize_default_scheme() {
        let url = canonicalize("cdn.example.com/a.jpg").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("cdn.example.com"));
    }

    #[test]
    fn test_canonicalize_lowercase_host_keeps_path_case() {
        let url = canonicalize("https://CDN.Example.COM/Photos/A.PNG").unwrap();
        assert_eq!(url.host_str(), Some("cdn.example.com"));
        assert_eq!(url.path(), "/Photos/A.PNG");
    }

    #[test]
    fn test_canonicalize_drops_default_port_and_fragment() {
        let url = canonicalize("https://example.com:443/a.png#thumb").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a.png");
    }

    #[test]
    fn test_canonicalize_preserve_query() {
        let url = canonicalize("https://example.com/a.png?w=2&h=1").unwrap();
        assert_eq!(url.query(), Some("w=2&h=1"));
    }

    #[test]
    fn test_canonicalize_unsupported_scheme() {
        let result = canonicalize("file:///etc/passwd");
        assert!(matches!(result, Err(UrlError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_canonicalize_empty() {
        assert_eq!(canonicalize(""), Err(UrlError::Empty));
        assert_eq!(canonicalize("   "), Err(UrlError::Empty));
    }

    #[test]
    fn test_canonicalize_garbage() {
        assert!(canonicalize("https://exa mple.com/a.png").is_err());
    }
}
