//! Error types for s3gate.

use thiserror::Error;

/// Main error type for s3gate operations.
///
/// None of these reach request handling: configuration problems leave the
/// breaker in its previous (or disabled) state and are only logged.
#[derive(Error, Debug)]
pub enum GateError {
    /// Process configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration store could not be read
    #[error("Config store error: {0}")]
    Store(String),

    /// The breaker document could not be decoded
    #[error("Failed to decode circuit breaker config: {0}")]
    Decode(String),

    /// An action key had an empty action name
    #[error("Invalid action spec '{0}': action name is empty")]
    InvalidAction(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for s3gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
