//! Error types for nuwa core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    #[error("Invalid app ID: {0}")]
    InvalidAppId(String),

    #[error("Incompatible schema version: {0}")]
    IncompatibleSchema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias for nuwa core operations
pub type Result<T> = std::result::Result<T, Error>;
