//! Error types shared by the tutor data model and stores

use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the session model, configuration and stores
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid voice loop configuration: {0}")]
    InvalidConfig(String),

    #[error("Turn order violation: {0}")]
    TurnOrder(String),

    #[error("Session already finalized")]
    SessionFinalized,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::InvalidConfig(err.to_string())
    }
}

impl From<toml::ser::Error> for CoreError {
    fn from(err: toml::ser::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}
