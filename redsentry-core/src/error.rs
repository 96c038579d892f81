//! Error types shared by the redsentry crates

use thiserror::Error;

/// Failover error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// No instance self-reported as primary during bootstrap election.
    /// Fatal: the coordinator never invents a primary from nothing.
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    /// Programming errors such as publishing a cluster status without a
    /// primary, or publishing without holding leadership.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Connection(e.to_string())
    }
}

/// Result type for failover operations
pub type Result<T> = std::result::Result<T, Error>;
