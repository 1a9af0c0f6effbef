//! Transport error types

use nuwa_protocol::ProtocolError;
use nuwa_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Connection closed")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<TransportError> for StorageError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Storage(inner) => inner,
            other => StorageError::Connection(other.to_string()),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
