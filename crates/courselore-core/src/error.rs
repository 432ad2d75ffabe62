//! Error types for Courselore.

use thiserror::Error;

/// Result type alias using Courselore's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Courselore operations.
///
/// Authorization failures are reported as [`Error::NotFound`] so that callers
/// without access cannot learn whether a resource exists.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found, or not visible to the caller
    #[error("Not found: {0}")]
    NotFound(String),

    /// Client-supplied data or state violates a precondition
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Outbound mail delivery failed
    #[error("Mail error: {0}")]
    Mail(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a validation rejection.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Shorthand for a not-found (or not-authorized) rejection.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Whether this error is a validation rejection.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }

    /// Whether this error is a not-found rejection.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("message 3".to_string());
        assert_eq!(err.to_string(), "Not found: message 3");
    }

    #[test]
    fn test_error_display_invalid_input() {
        let err = Error::invalid("content must not be empty");
        assert_eq!(err.to_string(), "Invalid input: content must not be empty");
        assert!(err.is_validation());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_error_display_job() {
        let err = Error::Job("message vanished".to_string());
        assert_eq!(err.to_string(), "Job error: message vanished");
    }

    #[test]
    fn test_error_display_mail() {
        let err = Error::Mail("connection refused".to_string());
        assert_eq!(err.to_string(), "Mail error: connection refused");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_not_found_helper() {
        let err = Error::not_found("conversation 7");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
