//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
///
/// A denied admission is not an error; it is reported through
/// [`Verdict::Denied`](crate::ratelimit::Verdict::Denied) or a `false` from
/// [`Limiter::allow`](crate::ratelimit::Limiter::allow).
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be loaded
    #[error("Configuration error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Identity key could not be used for rate limiting
    #[error("Invalid identity key: {0}")]
    InvalidKey(String),

    /// Background task could not be started
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Response encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
