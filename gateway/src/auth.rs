use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::Engine;

/// Reads the write key from HTTP Basic credentials: the username is the write key and the
/// password is ignored. Returns None when the header is missing, malformed, or carries an
/// empty username.
pub fn write_key_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    write_key_from_authorization(value)
}

pub fn write_key_from_authorization(value: &str) -> Option<String> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let credentials = String::from_utf8(decoded).ok()?;

    // "user" alone is accepted as well as "user:password"
    let username = match credentials.split_once(':') {
        Some((username, _)) => username,
        None => credentials.as_str(),
    };

    if username.is_empty() {
        None
    } else {
        Some(username.to_string())
    }
}
