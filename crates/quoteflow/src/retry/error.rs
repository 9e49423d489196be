//! Error taxonomy for carrier executions.
//!
//! Every failure an automation backend can produce is folded into one of six
//! kinds, each with a fixed recoverability decision.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The six failure kinds a carrier execution can end with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    CredentialsInvalid,
    CaptchaFailed,
    PortalUnavailable,
    FormChanged,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Whether the retry policy may re-run the execution automatically.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::PortalUnavailable | ErrorKind::FormChanged | ErrorKind::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CredentialsInvalid => "CREDENTIALS_INVALID",
            ErrorKind::CaptchaFailed => "CAPTCHA_FAILED",
            ErrorKind::PortalUnavailable => "PORTAL_UNAVAILABLE",
            ErrorKind::FormChanged => "FORM_CHANGED",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREDENTIALS_INVALID" => Some(ErrorKind::CredentialsInvalid),
            "CAPTCHA_FAILED" => Some(ErrorKind::CaptchaFailed),
            "PORTAL_UNAVAILABLE" => Some(ErrorKind::PortalUnavailable),
            "FORM_CHANGED" => Some(ErrorKind::FormChanged),
            "TIMEOUT" => Some(ErrorKind::Timeout),
            "UNKNOWN" => Some(ErrorKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one carrier execution attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct QuoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl QuoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn credentials_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CredentialsInvalid, message)
    }

    pub fn captcha_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CaptchaFailed, message)
    }

    pub fn portal_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PortalUnavailable, message)
    }

    pub fn form_changed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FormChanged, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

const CREDENTIAL_TERMS: &[&str] = &[
    "login",
    "credential",
    "authentication",
    "password",
    "unauthorized",
];
const CAPTCHA_TERMS: &[&str] = &["captcha", "challenge", "recaptcha", "hcaptcha"];
const FORM_TERMS: &[&str] = &[
    "element not found",
    "selector",
    "form changed",
    "navigation failed",
];
const TIMEOUT_TERMS: &[&str] = &["timeout", "timed out"];
const UNAVAILABLE_TERMS: &[&str] = &["connection", "network", "unavailable", "503", "502"];

/// Maps a provider failure message onto the taxonomy.
///
/// Checks run in a fixed order, so a message mentioning both a login
/// failure and a timeout is treated as a credentials problem.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let mentions = |terms: &[&str]| terms.iter().any(|t| lower.contains(t));

    if mentions(CREDENTIAL_TERMS) {
        ErrorKind::CredentialsInvalid
    } else if mentions(CAPTCHA_TERMS) {
        ErrorKind::CaptchaFailed
    } else if mentions(FORM_TERMS) {
        ErrorKind::FormChanged
    } else if mentions(TIMEOUT_TERMS) {
        ErrorKind::Timeout
    } else if mentions(UNAVAILABLE_TERMS) {
        ErrorKind::PortalUnavailable
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_table() {
        assert!(!ErrorKind::CredentialsInvalid.is_recoverable());
        assert!(!ErrorKind::CaptchaFailed.is_recoverable());
        assert!(ErrorKind::PortalUnavailable.is_recoverable());
        assert!(ErrorKind::FormChanged.is_recoverable());
        assert!(ErrorKind::Timeout.is_recoverable());
        assert!(!ErrorKind::Unknown.is_recoverable());
    }

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in [
            ErrorKind::CredentialsInvalid,
            ErrorKind::CaptchaFailed,
            ErrorKind::PortalUnavailable,
            ErrorKind::FormChanged,
            ErrorKind::Timeout,
            ErrorKind::Unknown,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("nope"), None);
    }

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::PortalUnavailable).unwrap();
        assert_eq!(json, "\"PORTAL_UNAVAILABLE\"");
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message("Login failed: bad password"),
            ErrorKind::CredentialsInvalid
        );
        assert_eq!(
            classify_message("reCAPTCHA detected on page"),
            ErrorKind::CaptchaFailed
        );
        assert_eq!(
            classify_message("Element not found: #zip"),
            ErrorKind::FormChanged
        );
        assert_eq!(
            classify_message("Page load timed out after 30s"),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify_message("upstream returned 503"),
            ErrorKind::PortalUnavailable
        );
        assert_eq!(classify_message("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn test_display_includes_kind() {
        let err = QuoteError::timeout("portal slow");
        assert_eq!(err.to_string(), "TIMEOUT: portal slow");
    }
}
