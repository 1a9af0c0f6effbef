//! In-memory local and remote stores

use crate::remote::{RemoteSnapshot, RemoteStore, SnapshotStream, Transaction, TransactionFn};
use crate::{LocalStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

/// In-memory local store
///
/// Fast, volatile storage suitable for tests and ephemeral participants.
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    data: DashMap<String, String>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// In-memory remote document store
///
/// Stands in for a shared backend when every participant lives in one
/// process. Writes are serialized, so transactions are linearizable.
pub struct MemoryRemoteStore {
    documents: Mutex<HashMap<String, Value>>,
    watchers: DashMap<String, Vec<mpsc::UnboundedSender<RemoteSnapshot>>>,
    write_lock: tokio::sync::Mutex<()>,
    transactions: bool,
}

impl MemoryRemoteStore {
    /// A store with transaction support
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            watchers: DashMap::new(),
            write_lock: tokio::sync::Mutex::new(()),
            transactions: true,
        }
    }

    /// A store that only offers plain get/set
    pub fn without_transactions() -> Self {
        Self {
            transactions: false,
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    fn read(&self, key: &str) -> Option<RemoteSnapshot> {
        self.documents
            .lock()
            .get(key)
            .cloned()
            .map(RemoteSnapshot::present)
    }

    fn commit(&self, key: String, value: Value) {
        self.documents.lock().insert(key.clone(), value.clone());

        if let Some(mut senders) = self.watchers.get_mut(&key) {
            senders.retain(|tx| tx.send(RemoteSnapshot::present(value.clone())).is_ok());
            trace!(key = %key, watchers = senders.len(), "Notified watchers");
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryRemoteStore,
    writes: Vec<(String, Value)>,
}

#[async_trait]
impl<'a> Transaction for MemoryTransaction<'a> {
    async fn get(&mut self, key: &str) -> Result<Option<RemoteSnapshot>, StorageError> {
        // Reads observe the transaction's own staged writes
        if let Some((_, value)) = self.writes.iter().rev().find(|(k, _)| k == key) {
            return Ok(Some(RemoteSnapshot::present(value.clone())));
        }
        Ok(self.store.read(key))
    }

    fn set(&mut self, key: &str, value: Value) {
        self.writes.push((key.to_string(), value));
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteSnapshot>, StorageError> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.commit(key.to_string(), value);
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<SnapshotStream, StorageError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.entry(key.to_string()).or_default().push(tx);
        Ok(rx)
    }

    fn supports_transactions(&self) -> bool {
        self.transactions
    }

    async fn run_transaction(&self, body: TransactionFn) -> Result<(), StorageError> {
        if !self.transactions {
            return Err(StorageError::Unsupported("transactions"));
        }

        let _guard = self.write_lock.lock().await;
        let mut txn = MemoryTransaction {
            store: self,
            writes: Vec::new(),
        };

        let handle: &mut dyn Transaction = &mut txn;
        body(handle).await?;

        for (key, value) in txn.writes {
            self.commit(key, value);
        }
        Ok(())
    }
}
