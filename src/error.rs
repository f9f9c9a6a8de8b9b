//! Error types for the Authguard service.

use thiserror::Error;

use crate::ratelimit::IdentifierError;

/// Main error type for Authguard operations.
#[derive(Error, Debug)]
pub enum AuthGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied an email or network address that cannot be used as a key
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for AuthGuardError {
    fn from(err: ::config::ConfigError) -> Self {
        AuthGuardError::Config(err.to_string())
    }
}

/// Result type alias for Authguard operations.
pub type Result<T> = std::result::Result<T, AuthGuardError>;
