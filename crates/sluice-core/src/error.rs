//! Error types for the sluice serving engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Tokenization error: {0}")]
    TokenizationError(String),

    #[error("Request validation failed: {0:?}")]
    ValidationError(Vec<String>),

    #[error("Request `{0}` is already active")]
    DuplicateRequest(String),

    #[error("Executor error: {0}")]
    ExecutorError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
