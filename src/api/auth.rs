//! Inbound bearer authentication.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;

use super::error_response;

/// Constant-time string comparison for password checks.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

/// The bearer token from the Authorization header, if any.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Require a bearer token matching the configured password.
///
/// 401 when the header is missing, 403 when the password is wrong.
pub(crate) fn verify_bearer(headers: &HeaderMap, password: &str) -> Result<(), Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Missing bearer authorization".to_string(),
            "authentication_error",
        ));
    };
    if !constant_time_eq(token, password) {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "Invalid password".to_string(),
            "authentication_error",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "Secret"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(header::AUTHORIZATION, "Bearer pwd".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("pwd"));

        headers.insert(header::AUTHORIZATION, "Basic pwd".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
