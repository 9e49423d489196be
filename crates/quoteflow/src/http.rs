//! Shared HTTP client construction for the remote collaborators.

use std::time::Duration;

use reqwest::Client;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum length for error bodies copied into errors and logs.
const MAX_ERROR_BODY_LENGTH: usize = 200;

pub(crate) fn create_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()
}

/// Truncates a response body so provider payloads never flood the logs.
pub(crate) fn sanitize_error_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

/// Joins a base URL and a path without doubling the slash.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_short_body() {
        assert_eq!(sanitize_error_body("bad gateway"), "bad gateway");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let body = "é".repeat(150);
        let sanitized = sanitize_error_body(&body);
        assert!(sanitized.ends_with("... (truncated)"));
        assert!(sanitized.len() < body.len());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://x/", "/v1/sessions"), "http://x/v1/sessions");
        assert_eq!(join_url("http://x", "v1"), "http://x/v1");
    }

    #[test]
    fn test_create_http_client() {
        assert!(create_http_client().is_ok());
    }
}
