//! nuwa storage - the persistence adapter
//!
//! Everything the engine needs from its environment:
//! - Local key-value store (memory, SQLite)
//! - Same-process broadcast of raw update records
//! - Optional remote document store with optional transactions
//!   (memory, PostgreSQL, or a network client from `nuwa-transport`)
//! - Optional fire-and-forget compile worker hook

pub mod adapter;
pub mod broadcast;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod remote;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod worker;

/// Synchronous local key-value store holding serialized documents
pub trait LocalStore: Send + Sync {
    /// Load the serialized document stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store a serialized document under `key`
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Remote error: {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Compile worker error: {0}")]
    Worker(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub use adapter::{Capabilities, PersistenceAdapter};
pub use broadcast::{BroadcastHub, BroadcastMessage};
pub use memory::{MemoryLocalStore, MemoryRemoteStore};
#[cfg(feature = "postgres")]
pub use postgres::PostgresRemoteStore;
pub use remote::{
    transaction_fn, RemoteData, RemoteSnapshot, RemoteStore, SnapshotStream, Transaction,
    TransactionFn,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLocalStore;
pub use worker::{ChannelCompileWorker, CompileRequest, CompileWorker};
