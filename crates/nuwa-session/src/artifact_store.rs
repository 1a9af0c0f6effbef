//! Replicated store for one artifact document (draft or compiled)
//!
//! Uses the same pipeline as the session engine: persist locally,
//! broadcast to co-located participants, mirror to the remote store.
//! Artifacts carry no revision counter, so staleness is decided on the
//! document's own timestamp.

use crate::error::Result;
use crate::event::{ArtifactEvent, Origin};
use crate::observer::{Observers, Subscription};
use nuwa_core::{decode, decode_str, Artifact, ConflictResolver, DocumentKey};
use nuwa_storage::{BroadcastMessage, PersistenceAdapter, StorageError};
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How far an accepted document travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Propagation {
    /// Local store only
    Local,
    /// Local store and broadcast hub
    Broadcast,
    /// Local store, broadcast hub and remote store
    Full,
}

struct Held<T> {
    document: Option<Arc<T>>,
    key: Option<String>,
}

/// Holds the latest accepted version of one artifact
pub struct ArtifactStore<T: Artifact> {
    app_id: String,
    local_id: String,
    adapter: PersistenceAdapter,
    held: Mutex<Held<T>>,
    /// Held through persist, broadcast and notify of an accepted document
    commit: ReentrantMutex<()>,
    observers: Observers<ArtifactEvent<T>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    watch: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Self>,
}

impl<T: Artifact> ArtifactStore<T> {
    /// A store whose key is set by the first accepted document
    pub fn new(
        adapter: PersistenceAdapter,
        app_id: impl Into<String>,
        local_id: impl Into<String>,
    ) -> Arc<Self> {
        Self::build(adapter, app_id.into(), local_id.into(), None)
    }

    /// A store bound to a known document id, so `connect` can load it
    pub fn for_document(
        adapter: PersistenceAdapter,
        app_id: impl Into<String>,
        local_id: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let app_id = app_id.into();
        let key = DocumentKey::for_kind(app_id.clone(), T::KIND, document_id)?.path();
        Ok(Self::build(adapter, app_id, local_id.into(), Some(key)))
    }

    fn build(
        adapter: PersistenceAdapter,
        app_id: String,
        local_id: String,
        key: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            app_id,
            local_id,
            adapter,
            held: Mutex::new(Held {
                document: None,
                key,
            }),
            commit: ReentrantMutex::new(()),
            observers: Observers::new(),
            listener: Mutex::new(None),
            watch: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn read(&self) -> Option<Arc<T>> {
        self.held.lock().document.clone()
    }

    /// Storage key of the held document
    pub fn key(&self) -> Option<String> {
        self.held.lock().key.clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ArtifactEvent<T>) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    /// Accept `document` unless its schema is unknown or it is older than
    /// the held one. Local writes are broadcast and mirrored remotely.
    pub fn write(&self, document: T, origin: Origin) -> bool {
        let propagation = match origin {
            Origin::Local => Propagation::Full,
            Origin::Remote => Propagation::Local,
        };
        self.accept(document, origin, propagation)
    }

    pub(crate) fn accept(&self, document: T, origin: Origin, propagation: Propagation) -> bool {
        if !document.is_compatible() {
            debug!(kind = %T::KIND, version = %document.schema_version(), "Ignoring incompatible artifact");
            return false;
        }
        if document.app_id() != self.app_id {
            debug!(kind = %T::KIND, app = %document.app_id(), "Ignoring artifact of another app");
            return false;
        }
        let key = match document.key() {
            Ok(key) => key.path(),
            Err(e) => {
                debug!(kind = %T::KIND, error = %e, "Ignoring artifact with invalid id");
                return false;
            }
        };

        let _commit = self.commit.lock();
        let (document, moved) = {
            let mut held = self.held.lock();
            if let Some(current) = &held.document {
                if ConflictResolver::is_stale(&document, &**current) {
                    debug!(
                        kind = %T::KIND,
                        key = %key,
                        incoming = document.timestamp(),
                        current = current.timestamp(),
                        "Dropping stale artifact"
                    );
                    return false;
                }
                if **current == document && held.key.as_deref() == Some(key.as_str()) {
                    return true;
                }
            }
            let moved = held.key.as_deref() != Some(key.as_str());
            let document = Arc::new(document);
            held.document = Some(document.clone());
            held.key = Some(key.clone());
            (document, moved)
        };

        debug!(kind = %T::KIND, key = %key, %origin, "Accepted artifact");
        self.persist_local(&key, &document);

        if propagation != Propagation::Local {
            self.broadcast(&key, &document);
        }
        if propagation == Propagation::Full {
            self.spawn_mirror(key.clone(), document.clone());
        }
        if moved && self.is_connected() {
            self.spawn_rewatch(key);
        }

        self.observers.notify(&ArtifactEvent { document, origin });
        true
    }

    /// Load persisted state, then start listening to other participants
    pub async fn connect(&self) -> Result<()> {
        self.disconnect();
        let inbox = self.adapter.subscribe_broadcast();

        if let Some(key) = self.key() {
            match self.adapter.local_get(&key) {
                Ok(Some(raw)) => match decode_str::<T>(&raw) {
                    Some(document) => {
                        self.accept(document, Origin::Local, Propagation::Local);
                    }
                    None => debug!(key = %key, "Ignoring incompatible local artifact"),
                },
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to read local artifact"),
            }
        }

        if let (Some(remote), Some(key)) = (self.adapter.remote().cloned(), self.key()) {
            match remote.get(&key).await {
                Ok(found) => match found.and_then(|s| s.value()) {
                    Some(value) => match decode::<T>(&value) {
                        Some(document) => {
                            self.accept(document, Origin::Remote, Propagation::Local);
                        }
                        None => debug!(key = %key, "Ignoring incompatible remote artifact"),
                    },
                    None => {
                        if let Some(document) = self.read() {
                            info!(key = %key, "Seeding remote artifact");
                            write_remote(&self.adapter, &key, document).await;
                        }
                    }
                },
                Err(e) => warn!(key = %key, error = %e, "Failed to read remote artifact"),
            }
        }

        *self.listener.lock() = Some(self.spawn_broadcast_listener(inbox));
        if let Some(key) = self.key() {
            self.watch(key).await?;
        }

        info!(kind = %T::KIND, key = ?self.key(), "Artifact store connected");
        Ok(())
    }

    pub fn disconnect(&self) {
        let listener = self.listener.lock().take();
        let watch = self.watch.lock().take();
        if let Some(task) = &watch {
            task.abort();
        }
        if let Some(task) = listener {
            task.abort();
            info!(kind = %T::KIND, "Artifact store disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.listener.lock().is_some()
    }

    fn persist_local(&self, key: &str, document: &T) {
        let result = serde_json::to_string(document)
            .map_err(StorageError::from)
            .and_then(|raw| self.adapter.local_set(key, &raw));
        if let Err(e) = result {
            warn!(key = %key, error = %e, "Failed to persist artifact locally");
        }
    }

    fn broadcast(&self, key: &str, document: &T) {
        match serde_json::to_string(document) {
            Ok(payload) => {
                self.adapter.broadcast(key, &self.local_id, payload);
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to encode artifact"),
        }
    }

    fn spawn_mirror(&self, key: String, document: Arc<T>) {
        if !self.adapter.capabilities().remote {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!(key = %key, "No runtime, skipping remote mirror");
            return;
        };
        let adapter = self.adapter.clone();
        runtime.spawn(async move {
            write_remote(&adapter, &key, document).await;
        });
    }

    /// Follow the held document to a new key
    fn spawn_rewatch(&self, key: String) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let this = self.this.clone();
        runtime.spawn(async move {
            if let Some(store) = this.upgrade() {
                if let Err(e) = store.watch(key).await {
                    warn!(error = %e, "Failed to watch remote artifact");
                }
            }
        });
    }

    async fn watch(&self, key: String) -> Result<()> {
        let Some(remote) = self.adapter.remote().cloned() else {
            return Ok(());
        };
        let mut stream = remote.subscribe(&key).await?;

        let this = self.this.clone();
        let task = tokio::spawn(async move {
            while let Some(snapshot) = stream.recv().await {
                let Some(store) = this.upgrade() else {
                    break;
                };
                if let Some(document) = snapshot.value().and_then(|v| decode::<T>(&v)) {
                    store.accept(document, Origin::Remote, Propagation::Local);
                }
            }
        });

        debug!(key = %key, "Watching remote artifact");
        if let Some(previous) = self.watch.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn spawn_broadcast_listener(
        &self,
        mut inbox: broadcast::Receiver<BroadcastMessage>,
    ) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            loop {
                match inbox.recv().await {
                    Ok(message) => {
                        let Some(store) = this.upgrade() else {
                            break;
                        };
                        store.receive(message);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Artifact broadcast listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn receive(&self, message: BroadcastMessage) {
        if message.sender == self.local_id {
            return;
        }
        if let Some(key) = self.key() {
            if message.key != key {
                return;
            }
        }
        let Some(document) = decode_str::<T>(&message.payload) else {
            return;
        };
        // An unbound store only follows documents of its own kind
        if document.key().map(|k| k.path()).ok().as_deref() != Some(message.key.as_str()) {
            return;
        }
        self.accept(document, Origin::Remote, Propagation::Local);
    }
}

impl<T: Artifact> Drop for ArtifactStore<T> {
    fn drop(&mut self) {
        for slot in [self.listener.get_mut(), self.watch.get_mut()] {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn write_remote<T: Artifact>(adapter: &PersistenceAdapter, key: &str, document: Arc<T>) {
    let value = match serde_json::to_value(&*document) {
        Ok(value) => value,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to encode artifact");
            return;
        }
    };

    let outcome = adapter
        .write_remote_if(key, value, move |current| supersedes_remote(&*document, current))
        .await;
    match outcome {
        Ok(true) => debug!(key = %key, "Mirrored artifact to remote"),
        Ok(false) => debug!(key = %key, "Remote artifact wins, mirror skipped"),
        Err(e) => warn!(key = %key, error = %e, "Failed to mirror artifact to remote"),
    }
}

/// Whether `document` should replace the remote document `current`
pub(crate) fn supersedes_remote<T: Artifact>(document: &T, current: Option<&Value>) -> bool {
    match current {
        None => true,
        Some(value) => match decode::<T>(value) {
            Some(existing) => ConflictResolver::should_apply(document, &existing),
            None => false,
        },
    }
}
