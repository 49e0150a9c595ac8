use thiserror::Error;

use crate::app::security::signer::SignerError;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    // ========================
    // Infrastructure / Config
    // ========================

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging initialization failed: {0}")]
    Logging(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Signing key unreadable: {0}")]
    KeyUnreadable(String),

    #[error("Bind failure: {0}")]
    Bind(std::io::Error),

    // ========================
    // Runtime / Async
    // ========================

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    // ========================
    // Fallback
    // ========================

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Process exit code for the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::KeyUnreadable(_) => 3,
            AppError::Bind(_) => 4,
            _ => 1,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<SignerError> for AppError {
    fn from(e: SignerError) -> Self {
        match e {
            SignerError::KeyUnreadable(msg) => AppError::KeyUnreadable(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Wire-level error taxonomy carried in ERROR frame bodies and logged
/// per rejected frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Parse,
    Frame,
    Checksum,
    Blocked,
    Internal,
    Timeout,
    ResourceExhausted,
    ShuttingDown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Parse => "PARSE",
            ErrorCode::Frame => "FRAME",
            ErrorCode::Checksum => "CHECKSUM",
            ErrorCode::Blocked => "BLOCKED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::Config("x".into()).exit_code(), 2);
        assert_eq!(AppError::KeyUnreadable("x".into()).exit_code(), 3);
        assert_eq!(
            AppError::Bind(std::io::Error::other("in use")).exit_code(),
            4
        );
        assert_eq!(AppError::Internal("x".into()).exit_code(), 1);
    }
}
