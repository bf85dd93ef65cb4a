use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Shared error taxonomy for broker operations.
///
/// Backend adapters translate vendor failures into these variants so callers
/// see one vocabulary regardless of which store served the request. The enum
/// is `Clone` because in-flight fetch results are broadcast to coalesced
/// waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("{field} must not be empty")]
    EmptyComponent { field: &'static str },
    #[error("{field} contains invalid characters: {value}")]
    InvalidCharacters { field: &'static str, value: String },
    #[error("secret path must contain at least one segment")]
    EmptyPath,
    #[error("secret not found: {path}")]
    NotFound { path: String },
    #[error("access denied: {reason}")]
    Unauthorized { reason: String },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend rate limited: {0}")]
    RateLimited(String),
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Coarse classification used for audit records and HTTP mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmptyComponent { .. } | Error::InvalidCharacters { .. } | Error::EmptyPath => {
                ErrorKind::InvalidPath
            }
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::Config(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a read may be retried after this failure.
    ///
    /// Policy denials and not-found are final; only transient backend
    /// conditions qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::RateLimited(_))
    }
}

/// Stable error labels recorded in audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidPath,
    NotFound,
    Unauthorized,
    Unavailable,
    RateLimited,
    Conflict,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Unavailable("down".into()).is_retryable());
        assert!(Error::RateLimited("slow down".into()).is_retryable());
        assert!(!Error::NotFound { path: "secret/db".into() }.is_retryable());
        assert!(
            !Error::Unauthorized {
                reason: "no rule".into()
            }
            .is_retryable()
        );
        assert!(
            !Error::Conflict {
                expected: 1,
                actual: 2
            }
            .is_retryable()
        );
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let kind = serde_json::to_string(&ErrorKind::RateLimited).unwrap();
        assert_eq!(kind, "\"rate_limited\"");
        assert_eq!(
            Error::Unavailable("x".into()).kind(),
            ErrorKind::Unavailable
        );
    }
}
