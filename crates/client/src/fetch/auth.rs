//! `Authorization` header construction.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::HeaderValue;

/// Basic credentials header for `username:password`.
///
/// Returns `None` unless both halves are given, which is how callers clear
/// previously configured credentials.
pub fn basic_authorization(username: Option<&str>, password: Option<&str>) -> Option<HeaderValue> {
    let (username, password) = (username?, password?);
    let encoded = STANDARD.encode(format!("{username}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}")).ok()?;
    value.set_sensitive(true);
    Some(value)
}
