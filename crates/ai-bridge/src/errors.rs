use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

/// Coarse classification of a [`BridgeError`], used by the engine to decide
/// between retrying and failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Protocol,
    Adapter,
    Timeout,
    UnknownProvider,
    DuplicateProvider,
    Cancelled,
    Config,
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum BridgeError {
    /// Malformed canonical data. A caller bug, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backend rejected the request or returned something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transient backend failure (network, rate limit, server error, attempt timeout).
    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Invocation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider already registered: {0}")]
    DuplicateProvider(String),

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Validation(_) => ErrorKind::Validation,
            BridgeError::Protocol(_) => ErrorKind::Protocol,
            BridgeError::Adapter(_) => ErrorKind::Adapter,
            BridgeError::Timeout { .. } => ErrorKind::Timeout,
            BridgeError::UnknownProvider(_) => ErrorKind::UnknownProvider,
            BridgeError::DuplicateProvider(_) => ErrorKind::DuplicateProvider,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only transient adapter failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Adapter
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(err: url::ParseError) -> Self {
        BridgeError::Config(format!("invalid base url: {}", err))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_adapter_errors_are_retryable() {
        assert!(BridgeError::Adapter("503".into()).is_retryable());
        assert!(!BridgeError::Protocol("400".into()).is_retryable());
        assert!(!BridgeError::Validation("empty".into()).is_retryable());
        assert!(!BridgeError::Timeout { elapsed_ms: 10 }.is_retryable());
        assert!(!BridgeError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = BridgeError::UnknownProvider("direct".to_string());
        assert_eq!(err.to_string(), "Unknown provider: direct");
        assert_eq!(err.kind().to_string(), "unknown_provider");

        let err = BridgeError::Timeout { elapsed_ms: 1500 };
        assert_eq!(err.to_string(), "Invocation timed out after 1500ms");
    }
}
