//! Error types for `pipemesh` core library.

use thiserror::Error;

/// Result type alias using `pipemesh` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `pipemesh` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
