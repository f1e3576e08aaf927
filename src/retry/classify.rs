//! Error classification for retry decisions.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// How a failure should be treated by the retry engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ErrorKind {
    /// Expected to resolve on its own (timeout, reset, 429/5xx, lock contention).
    Transient,
    /// Needs out-of-band correction (bad credentials, malformed request, missing config).
    Permanent,
    /// The data itself is unacceptable; retrying cannot help.
    Validation,
}

impl ErrorKind {
    /// Only transient failures consume another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Default classification heuristic for an error type.
///
/// Callers can always override it per call with [`Retrier::run_with`].
///
/// [`Retrier::run_with`]: crate::retry::Retrier::run_with
pub trait Classify {
    /// Classify this error.
    fn classify(&self) -> ErrorKind;
}

impl Classify for std::io::Error {
    fn classify(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;

        match self.kind() {
            Io::NotFound | Io::InvalidInput | Io::InvalidData | Io::Unsupported => {
                ErrorKind::Permanent
            }
            _ => ErrorKind::Transient,
        }
    }
}

impl Classify for reqwest::Error {
    fn classify(&self) -> ErrorKind {
        classify_reqwest(self)
    }
}

/// Classify an HTTP status code.
///
/// 408, 429 and every 5xx are transient; any other client error is permanent.
/// Success and redirect codes never reach the classifier in practice and are
/// reported as permanent so they are not retried blindly.
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        408 | 429 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

/// Classify a `reqwest` transport error.
pub fn classify_reqwest(err: &reqwest::Error) -> ErrorKind {
    if let Some(status) = err.status() {
        return classify_http_status(status.as_u16());
    }
    if err.is_builder() || err.is_decode() || err.is_redirect() {
        return ErrorKind::Permanent;
    }
    // Timeouts, refused/reset connections and truncated bodies.
    ErrorKind::Transient
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert_eq!(classify_http_status(429), ErrorKind::Transient);
        assert_eq!(classify_http_status(408), ErrorKind::Transient);
        assert_eq!(classify_http_status(500), ErrorKind::Transient);
        assert_eq!(classify_http_status(503), ErrorKind::Transient);
        assert_eq!(classify_http_status(400), ErrorKind::Permanent);
        assert_eq!(classify_http_status(401), ErrorKind::Permanent);
        assert_eq!(classify_http_status(404), ErrorKind::Permanent);
    }

    #[test]
    fn test_io_error_classification() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(missing.classify(), ErrorKind::Permanent);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        assert_eq!(denied.classify(), ErrorKind::Transient);

        let other = std::io::Error::other("disk hiccup");
        assert_eq!(other.classify(), ErrorKind::Transient);
    }

    #[test]
    fn test_error_kind_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert_eq!(ErrorKind::Transient.to_string(), "transient");
        assert_eq!("PERMANENT".parse::<ErrorKind>().ok(), Some(ErrorKind::Permanent));
    }
}
