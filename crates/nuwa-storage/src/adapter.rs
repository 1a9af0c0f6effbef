//! Persistence adapter bundling every storage facility a participant uses

use crate::broadcast::{BroadcastHub, BroadcastMessage};
use crate::memory::MemoryLocalStore;
use crate::remote::{transaction_fn, RemoteStore};
use crate::worker::CompileWorker;
use crate::{LocalStore, StorageError};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Optional facilities available to a participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub remote: bool,
    pub transactions: bool,
    pub compile_worker: bool,
}

/// Local store, broadcast hub, and the optional remote store and
/// compile worker. Cloning shares the underlying facilities.
#[derive(Clone)]
pub struct PersistenceAdapter {
    local: Arc<dyn LocalStore>,
    hub: BroadcastHub,
    remote: Option<Arc<dyn RemoteStore>>,
    worker: Option<Arc<dyn CompileWorker>>,
    capabilities: Capabilities,
}

impl PersistenceAdapter {
    pub fn new(local: Arc<dyn LocalStore>, hub: BroadcastHub) -> Self {
        Self {
            local,
            hub,
            remote: None,
            worker: None,
            capabilities: Capabilities::default(),
        }
    }

    /// Memory local store on a fresh hub
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryLocalStore::new()), BroadcastHub::default())
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.capabilities.remote = true;
        self.capabilities.transactions = remote.supports_transactions();
        self.remote = Some(remote);
        self
    }

    pub fn with_compile_worker(mut self, worker: Arc<dyn CompileWorker>) -> Self {
        self.capabilities.compile_worker = true;
        self.worker = Some(worker);
        self
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteStore>> {
        self.remote.as_ref()
    }

    pub fn compile_worker(&self) -> Option<&Arc<dyn CompileWorker>> {
        self.worker.as_ref()
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn local_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.local.get(key)
    }

    pub fn local_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.local.set(key, value)
    }

    /// Fan a serialized record out to co-located participants
    pub fn broadcast(&self, key: &str, sender: &str, payload: String) -> usize {
        self.hub.publish(BroadcastMessage {
            key: key.to_string(),
            sender: sender.to_string(),
            payload,
        })
    }

    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.hub.subscribe()
    }

    /// Write `value` to the remote store unless the stored document wins
    ///
    /// `supersedes` receives the current remote value and decides whether
    /// `value` replaces it. The check and the write run in one transaction
    /// when the store supports it. Returns whether the write happened;
    /// always `false` without a remote store.
    pub async fn write_remote_if<F>(
        &self,
        key: &str,
        value: Value,
        supersedes: F,
    ) -> Result<bool, StorageError>
    where
        F: Fn(Option<&Value>) -> bool + Send + Sync + 'static,
    {
        let Some(remote) = self.remote.as_ref() else {
            return Ok(false);
        };

        let supersedes = Arc::new(supersedes);

        if self.capabilities.transactions {
            let written = Arc::new(AtomicBool::new(false));
            let flag = written.clone();
            let check = supersedes.clone();
            let txn_key = key.to_string();
            let txn_value = value.clone();

            let outcome = remote
                .run_transaction(transaction_fn(move |txn| {
                    Box::pin(async move {
                        let current = txn.get(&txn_key).await?.and_then(|s| s.value());
                        if (*check)(current.as_ref()) {
                            txn.set(&txn_key, txn_value);
                            flag.store(true, Ordering::SeqCst);
                        }
                        Ok(())
                    })
                }))
                .await;

            match outcome {
                Ok(()) => return Ok(written.load(Ordering::SeqCst)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Remote transaction failed, retrying without");
                }
            }
        }

        let current = remote.get(key).await?.and_then(|s| s.value());
        if !(*supersedes)(current.as_ref()) {
            debug!(key = %key, "Remote document is newer, skipping write");
            return Ok(false);
        }
        remote.set(key, value).await?;
        Ok(true)
    }
}
