//! HTTP Basic authentication for the stream endpoint.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::config::Credentials;
use crate::error::{AppError, Result};
use crate::state::AppState;

impl Credentials {
    /// Check a user/password pair without short-circuiting on the first
    /// differing byte.
    pub fn matches(&self, user: &str, password: &str) -> bool {
        let user_ok = constant_time_eq(self.user.as_bytes(), user.as_bytes());
        let password_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        user_ok & password_ok
    }

    /// Value of an `Authorization` header carrying these credentials.
    pub fn to_header_value(&self) -> String {
        encode_basic(&self.user, &self.password)
    }
}

/// Encode a Basic `Authorization` header value.
pub fn encode_basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}

/// Decode a Basic `Authorization` header value into user and password.
pub fn decode_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Reject requests without valid Basic credentials.
pub async fn require_basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic)
        .map(|(user, password)| state.credentials.matches(&user, &password))
        .unwrap_or(false);

    if !authorized {
        tracing::debug!(uri = %request.uri(), "rejected unauthenticated request");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_basic() {
        // admin:admin
        assert_eq!(
            decode_basic("Basic YWRtaW46YWRtaW4="),
            Some(("admin".to_string(), "admin".to_string()))
        );
        assert_eq!(
            decode_basic(&encode_basic("ops", "pa:ss")),
            Some(("ops".to_string(), "pa:ss".to_string()))
        );
        assert_eq!(
            decode_basic("basic YWRtaW46YWRtaW4="),
            Some(("admin".to_string(), "admin".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_malformed_headers() {
        assert_eq!(decode_basic("Bearer YWRtaW46YWRtaW4="), None);
        assert_eq!(decode_basic("Basic !!!"), None);
        assert_eq!(decode_basic("Basic"), None);
        // "admin" without a colon
        assert_eq!(decode_basic("Basic YWRtaW4="), None);
    }

    #[test]
    fn test_credentials_match() {
        let credentials = Credentials::default();
        assert!(credentials.matches("admin", "admin"));
        assert!(!credentials.matches("admin", "admin2"));
        assert!(!credentials.matches("root", "admin"));
        assert!(!credentials.matches("", ""));
        assert_eq!(credentials.to_header_value(), "Basic YWRtaW46YWRtaW4=");
    }
}
