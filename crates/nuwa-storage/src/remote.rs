//! Remote document store interface

use crate::StorageError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream of snapshots delivered by [`RemoteStore::subscribe`].
/// Dropping the receiver ends the subscription.
pub type SnapshotStream = mpsc::UnboundedReceiver<RemoteSnapshot>;

/// Body of a remote transaction
pub type TransactionFn = Box<
    dyn for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<(), StorageError>> + Send,
>;

/// Box a transaction body, pinning down its higher-ranked signature
pub fn transaction_fn<F>(body: F) -> TransactionFn
where
    F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<(), StorageError>>
        + Send
        + 'static,
{
    Box::new(body)
}

/// Document payload, either already materialized or produced on demand
#[derive(Clone)]
pub enum RemoteData {
    Value(Value),
    Lazy(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl std::fmt::Debug for RemoteData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteData::Value(v) => f.debug_tuple("Value").field(v).finish(),
            RemoteData::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// A document as seen by a remote store
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub exists: Option<bool>,
    pub data: Option<RemoteData>,
}

impl RemoteSnapshot {
    pub fn present(value: Value) -> Self {
        Self {
            exists: Some(true),
            data: Some(RemoteData::Value(value)),
        }
    }

    pub fn lazy<F>(producer: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            exists: Some(true),
            data: Some(RemoteData::Lazy(Arc::new(producer))),
        }
    }

    pub fn missing() -> Self {
        Self {
            exists: Some(false),
            data: None,
        }
    }

    /// An explicit `exists` flag wins; otherwise presence of data decides
    pub fn exists(&self) -> bool {
        self.exists.unwrap_or(self.data.is_some())
    }

    /// The payload normalized to a plain value
    pub fn value(&self) -> Option<Value> {
        if !self.exists() {
            return None;
        }
        match self.data.as_ref()? {
            RemoteData::Value(v) => Some(v.clone()),
            RemoteData::Lazy(producer) => Some(producer()),
        }
    }
}

/// Read/write handle passed to a transaction body
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &str) -> Result<Option<RemoteSnapshot>, StorageError>;

    /// Stage a write, applied when the body completes successfully
    fn set(&mut self, key: &str, value: Value);
}

/// Optional remote document store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RemoteSnapshot>, StorageError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Watch a document. Every later write to `key` is delivered.
    async fn subscribe(&self, key: &str) -> Result<SnapshotStream, StorageError>;

    /// Whether [`RemoteStore::run_transaction`] is implemented
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Run `body` atomically. Writes staged by the body become visible
    /// together, or not at all if it fails.
    async fn run_transaction(&self, body: TransactionFn) -> Result<(), StorageError> {
        drop(body);
        Err(StorageError::Unsupported("transactions"))
    }
}
