//! The shared session engine
//!
//! Holds one immutable [`SessionSnapshot`] per participant and keeps it
//! converged with every other participant of the same app. Local edits bump
//! the revision and fan out through the persistence adapter; records from
//! other participants go through the conflict resolver.

use crate::error::Result;
use crate::event::{ChangeSet, Origin, SessionEvent};
use crate::observer::{Observers, Subscription};
use nuwa_core::presence::DEFAULT_PRESENCE_TTL;
use nuwa_core::schema::SESSION_SCHEMA_VERSION;
use nuwa_core::session::resolve_pointers;
use nuwa_core::{
    decode, decode_str, Clock, ConflictResolver, DocumentKey, PresenceTracker, SessionPatch,
    SessionSnapshot, SessionUpdate, SystemClock, Versioned, ViewState,
};
use nuwa_storage::{BroadcastMessage, PersistenceAdapter, SnapshotStream, StorageError};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

fn default_presence_ttl_ms() -> u64 {
    DEFAULT_PRESENCE_TTL.as_millis() as u64
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub app_id: String,
    #[serde(default = "default_presence_ttl_ms")]
    pub presence_ttl_ms: u64,
    /// Participant id; a random one is generated when unset
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SessionConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            presence_ttl_ms: default_presence_ttl_ms(),
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_presence_ttl(mut self, ttl: Duration) -> Self {
        self.presence_ttl_ms = ttl.as_millis() as u64;
        self
    }
}

/// A local update computed against a known snapshot but not yet applied
#[derive(Debug, Clone)]
pub struct StagedUpdate {
    base: Arc<SessionSnapshot>,
    next: Arc<SessionSnapshot>,
    patch: SessionPatch,
}

impl StagedUpdate {
    /// The snapshot that committing would install
    pub fn snapshot(&self) -> &Arc<SessionSnapshot> {
        &self.next
    }
}

/// Keeps one session record converged across participants
pub struct SharedSessionEngine {
    app_id: String,
    local_id: String,
    key: String,
    adapter: PersistenceAdapter,
    clock: Arc<dyn Clock>,
    presence: PresenceTracker,
    state: Mutex<Arc<SessionSnapshot>>,
    /// Held from a state swap until its persist, broadcast and notify are
    /// done, so transitions leave the engine in the order they were applied.
    /// Reentrant: listeners may call back into the engine.
    commit: ReentrantMutex<()>,
    observers: Observers<SessionEvent>,
    outbox: mpsc::UnboundedSender<Arc<SessionSnapshot>>,
    outbox_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<SessionSnapshot>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<Self>,
}

impl SharedSessionEngine {
    pub fn new(config: SessionConfig, adapter: PersistenceAdapter) -> Result<Arc<Self>> {
        Self::with_clock(config, adapter, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SessionConfig,
        adapter: PersistenceAdapter,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let key = DocumentKey::global_session(config.app_id.clone())?.path();
        let local_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let seed = SessionSnapshot::seed(local_id.clone(), ViewState::default(), clock.now_millis());
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        debug!(session = %local_id, key = %key, "Created session engine");

        Ok(Arc::new_cyclic(|this| Self {
            app_id: config.app_id,
            local_id,
            key,
            adapter,
            clock,
            presence: PresenceTracker::new(Duration::from_millis(config.presence_ttl_ms)),
            state: Mutex::new(Arc::new(seed)),
            commit: ReentrantMutex::new(()),
            observers: Observers::new(),
            outbox,
            outbox_rx: Arc::new(tokio::sync::Mutex::new(outbox_rx)),
            tasks: Mutex::new(Vec::new()),
            this: this.clone(),
        }))
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Id of the local participant
    pub fn session_id(&self) -> &str {
        &self.local_id
    }

    /// Storage key of the session document
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn adapter(&self) -> &PersistenceAdapter {
        &self.adapter
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The current snapshot
    pub fn read(&self) -> Arc<SessionSnapshot> {
        self.state.lock().clone()
    }

    /// Register a listener for accepted changes
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    /// Apply a local edit. Returns `None` if the patch changes nothing.
    pub fn update(&self, patch: SessionPatch) -> Option<Arc<SessionSnapshot>> {
        self.update_with(move |_| Some(patch))
    }

    /// Build a patch from the current snapshot and apply it atomically.
    /// `build` runs under the state lock and must not call back into the
    /// engine.
    pub fn update_with<F>(&self, build: F) -> Option<Arc<SessionSnapshot>>
    where
        F: FnOnce(&SessionSnapshot) -> Option<SessionPatch>,
    {
        let _commit = self.commit.lock();
        let now = self.clock.now_millis();
        let (snapshot, changes) = {
            let mut state = self.state.lock();
            let patch = build(&**state)?;
            let next = self.next_snapshot(&state, &patch, now)?;
            let changes = ChangeSet::between(&state.record, &next.record);
            *state = next.clone();
            (next, changes)
        };

        debug!(revision = snapshot.revision(), "Applied local session update");
        self.publish_local(&snapshot, true);
        self.notify(&snapshot, Origin::Local, changes);
        Some(snapshot)
    }

    /// Compute the result of `patch` without applying it
    pub fn stage(&self, patch: SessionPatch) -> Option<StagedUpdate> {
        let now = self.clock.now_millis();
        let base = self.read();
        let next = self.next_snapshot(&base, &patch, now)?;
        Some(StagedUpdate { base, next, patch })
    }

    /// Install a staged update whose record already reached the remote
    /// store. If the session moved since staging, the patch is re-applied
    /// as a regular update instead. Either way nothing is applied unless
    /// `still_valid` accepts the snapshot the patch would land on.
    pub fn commit_staged<F>(&self, staged: StagedUpdate, still_valid: F) -> Option<Arc<SessionSnapshot>>
    where
        F: FnOnce(&SessionSnapshot) -> bool,
    {
        let _commit = self.commit.lock();
        let mut state = self.state.lock();
        if !Arc::ptr_eq(&state, &staged.base) {
            drop(state);
            debug!("Session moved while staged, re-applying patch");
            let patch = staged.patch;
            return self.update_with(move |current| still_valid(current).then_some(patch));
        }
        if !still_valid(&**state) {
            return None;
        }
        let changes = ChangeSet::between(&state.record, &staged.next.record);
        *state = staged.next.clone();
        drop(state);

        let snapshot = staged.next;
        self.publish_local(&snapshot, false);
        self.notify(&snapshot, Origin::Local, changes);
        Some(snapshot)
    }

    /// Feed a record from another participant through the resolver.
    /// Returns whether it was accepted.
    pub fn apply_update(&self, update: SessionUpdate, origin: Origin) -> bool {
        if !update.is_compatible() {
            debug!(version = %update.schema_version, "Ignoring incompatible session update");
            return false;
        }

        let _commit = self.commit.lock();
        let now = self.clock.now_millis();
        let applied = {
            let mut state = self.state.lock();
            if update.session_id == self.local_id && ConflictResolver::is_stale(&update, &state.record) {
                trace!(revision = update.revision, "Dropping echo of own session update");
                return false;
            }
            let presence =
                self.presence
                    .observe(&state.presence, &update, &self.local_id, &state.record, now);

            if ConflictResolver::is_stale(&update, &state.record) {
                debug!(
                    revision = update.revision,
                    current = state.revision(),
                    from = %update.session_id,
                    "Dropping stale session update"
                );
                if presence != state.presence {
                    *state = Arc::new(SessionSnapshot {
                        record: state.record.clone(),
                        presence,
                    });
                }
                None
            } else {
                let pointers = resolve_pointers(
                    update.draft_id.as_deref(),
                    update.compiled_id.as_deref(),
                    update.compiled_shadow.as_ref(),
                    &state.record,
                );
                let record = SessionUpdate {
                    draft_id: pointers.draft_id,
                    compiled_id: pointers.compiled_id,
                    compiled_shadow: pointers.compiled_shadow,
                    ..update
                };
                let changes = ChangeSet::between(&state.record, &record);
                let next = Arc::new(SessionSnapshot { record, presence });
                *state = next.clone();
                Some((next, changes))
            }
        };

        let Some((snapshot, changes)) = applied else {
            return false;
        };

        debug!(revision = snapshot.revision(), from = %snapshot.session_id(), %origin, "Accepted session update");
        self.persist_local(&snapshot);
        self.notify(&snapshot, origin, changes);
        true
    }

    /// Decode a serialized record and apply it. Payloads with an unknown
    /// schema version or malformed content are ignored.
    pub fn apply_payload(&self, raw: &str, origin: Origin) -> bool {
        match decode_str::<SessionUpdate>(raw) {
            Some(update) => self.apply_update(update, origin),
            None => false,
        }
    }

    pub fn apply_value(&self, value: &Value, origin: Origin) -> bool {
        match decode::<SessionUpdate>(value) {
            Some(update) => self.apply_update(update, origin),
            None => false,
        }
    }

    /// Load persisted state, then start listening to other participants.
    /// Calling it again restarts the listeners.
    pub async fn connect(&self) -> Result<()> {
        self.disconnect();
        let inbox = self.adapter.subscribe_broadcast();

        let persisted = match self.adapter.local_get(&self.key) {
            Ok(raw) => raw.and_then(|raw| decode_str::<SessionSnapshot>(&raw)),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to read local session");
                None
            }
        };
        match persisted {
            Some(snapshot) => {
                self.adopt(snapshot, Origin::Local);
            }
            None => self.persist_local(&self.read()),
        }

        let mut tasks = Vec::new();
        if let Some(remote) = self.adapter.remote().cloned() {
            match remote.get(&self.key).await {
                Ok(found) => match found.and_then(|s| s.value()) {
                    Some(value) => match decode::<SessionSnapshot>(&value) {
                        Some(snapshot) => {
                            if !self.adopt(snapshot, Origin::Remote) {
                                self.seed_remote().await;
                            }
                        }
                        None => debug!(key = %self.key, "Ignoring incompatible remote session"),
                    },
                    None => self.seed_remote().await,
                },
                Err(e) => warn!(key = %self.key, error = %e, "Failed to read remote session"),
            }

            let stream = remote.subscribe(&self.key).await?;
            tasks.push(self.spawn_remote_watch(stream));
            tasks.push(self.spawn_remote_mirror());
        }
        tasks.push(self.spawn_broadcast_listener(inbox));
        self.tasks.lock().extend(tasks);

        info!(
            session = %self.local_id,
            key = %self.key,
            revision = self.read().revision(),
            "Session engine connected"
        );
        Ok(())
    }

    /// Stop listening. Local updates keep working.
    pub fn disconnect(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!(session = %self.local_id, "Session engine disconnected");
    }

    pub fn is_connected(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    fn next_snapshot(
        &self,
        current: &SessionSnapshot,
        patch: &SessionPatch,
        now: u64,
    ) -> Option<Arc<SessionSnapshot>> {
        let base = &current.record;
        let pointers = resolve_pointers(
            patch.draft_id.as_deref(),
            patch.compiled_id.as_deref(),
            patch.compiled_shadow.as_ref(),
            base,
        );

        let record = SessionUpdate {
            schema_version: SESSION_SCHEMA_VERSION.to_string(),
            session_id: self.local_id.clone(),
            revision: base.revision + 1,
            updated_at: now,
            view: patch.apply_view(&base.view),
            draft_id: pointers.draft_id,
            compiled_id: pointers.compiled_id,
            compiled_shadow: pointers.compiled_shadow,
            pipeline: patch.pipeline.clone().unwrap_or_else(|| base.pipeline.clone()),
            draft_lock: patch
                .draft_lock
                .clone()
                .unwrap_or_else(|| base.draft_lock.clone()),
        };

        if !ChangeSet::between(base, &record).any() {
            return None;
        }

        let presence = self
            .presence
            .observe(&current.presence, &record, &self.local_id, base, now);
        Some(Arc::new(SessionSnapshot { record, presence }))
    }

    /// Replace the held snapshot with a persisted one if it wins
    fn adopt(&self, incoming: SessionSnapshot, origin: Origin) -> bool {
        if !incoming.is_compatible() {
            return false;
        }

        let _commit = self.commit.lock();
        let now = self.clock.now_millis();
        let adopted = {
            let mut state = self.state.lock();
            if !ConflictResolver::should_apply(&incoming, &**state) {
                None
            } else {
                let presence =
                    self.presence
                        .normalize(&incoming.presence, &self.local_id, &state.record, now);
                let changes = ChangeSet::between(&state.record, &incoming.record);
                let next = Arc::new(SessionSnapshot {
                    record: incoming.record,
                    presence,
                });
                *state = next.clone();
                Some((next, changes))
            }
        };

        let Some((snapshot, changes)) = adopted else {
            return false;
        };

        info!(revision = snapshot.revision(), %origin, "Adopted persisted session");
        self.persist_local(&snapshot);
        self.notify(&snapshot, origin, changes);
        true
    }

    fn notify(&self, snapshot: &Arc<SessionSnapshot>, origin: Origin, changes: ChangeSet) {
        self.observers.notify(&SessionEvent {
            snapshot: snapshot.clone(),
            origin,
            changes,
        });
    }

    fn publish_local(&self, snapshot: &Arc<SessionSnapshot>, mirror: bool) {
        self.persist_local(snapshot);

        match serde_json::to_string(&snapshot.record) {
            Ok(payload) => {
                self.adapter.broadcast(&self.key, &self.local_id, payload);
            }
            Err(e) => warn!(error = %e, "Failed to encode session update"),
        }

        // Only a connected engine drains the outbox
        if mirror
            && self.adapter.capabilities().remote
            && self.is_connected()
            && self.outbox.send(snapshot.clone()).is_err()
        {
            debug!("Remote outbox closed");
        }
    }

    fn persist_local(&self, snapshot: &SessionSnapshot) {
        let result = serde_json::to_string(snapshot)
            .map_err(StorageError::from)
            .and_then(|raw| self.adapter.local_set(&self.key, &raw));
        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "Failed to persist session locally");
        }
    }

    async fn seed_remote(&self) {
        let snapshot = self.read();
        self.write_remote(&snapshot).await;
    }

    async fn write_remote(&self, snapshot: &SessionSnapshot) {
        let value = match serde_json::to_value(snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode session snapshot");
                return;
            }
        };

        let record = snapshot.record.clone();
        let revision = record.revision;
        let outcome = self
            .adapter
            .write_remote_if(&self.key, value, move |current| {
                supersedes_remote(&record, current)
            })
            .await;

        match outcome {
            Ok(true) => debug!(revision, "Mirrored session to remote"),
            Ok(false) => debug!(revision, "Remote session wins, mirror skipped"),
            Err(e) => warn!(revision, error = %e, "Failed to mirror session to remote"),
        }
    }

    fn spawn_remote_watch(&self, mut stream: SnapshotStream) -> JoinHandle<()> {
        let this = self.this.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = stream.recv().await {
                let Some(engine) = this.upgrade() else {
                    break;
                };
                if let Some(value) = snapshot.value() {
                    engine.apply_value(&value, Origin::Remote);
                }
            }
        })
    }

    /// Drain the outbox in order, one remote write at a time
    fn spawn_remote_mirror(&self) -> JoinHandle<()> {
        let this = self.this.clone();
        let outbox = self.outbox_rx.clone();
        tokio::spawn(async move {
            let mut outbox = outbox.lock().await;
            while let Some(snapshot) = outbox.recv().await {
                let Some(engine) = this.upgrade() else {
                    break;
                };
                engine.write_remote(&snapshot).await;
            }
        })
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
                        let Some(engine) = this.upgrade() else {
                            break;
                        };
                        if message.key == engine.key && message.sender != engine.local_id {
                            engine.apply_payload(&message.payload, Origin::Remote);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session broadcast listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for SharedSessionEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Whether `record` should replace the remote document `current`.
/// Documents with an unknown schema are left alone.
pub(crate) fn supersedes_remote(record: &SessionUpdate, current: Option<&Value>) -> bool {
    match current {
        None => true,
        Some(value) => match decode::<SessionUpdate>(value) {
            Some(existing) => ConflictResolver::should_apply(record, &existing),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuwa_core::session::{CompiledShadow, PresenceEntry};
    use nuwa_core::{Frame, ManualClock, Surface};
    use nuwa_storage::{BroadcastHub, LocalStore, MemoryLocalStore, MemoryRemoteStore, RemoteStore};
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    struct FailingLocalStore;

    impl LocalStore for FailingLocalStore {
        fn get(&self, _key: &str) -> std::result::Result<Option<String>, StorageError> {
            Err(StorageError::Io("storage unavailable".into()))
        }

        fn set(&self, _key: &str, _value: &str) -> std::result::Result<(), StorageError> {
            Err(StorageError::Io("storage unavailable".into()))
        }
    }

    fn engine(id: &str, adapter: PersistenceAdapter, clock: Arc<ManualClock>) -> Arc<SharedSessionEngine> {
        SharedSessionEngine::with_clock(SessionConfig::new("app").with_session_id(id), adapter, clock)
            .unwrap()
    }

    fn record(session_id: &str, revision: u64, updated_at: u64) -> SessionUpdate {
        let mut record = SessionSnapshot::seed(session_id, ViewState::default(), updated_at).record;
        record.revision = revision;
        record
    }

    fn events(engine: &SharedSessionEngine) -> (Subscription, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = engine.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (sub, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_for_remote_revision(store: &MemoryRemoteStore, key: &str, revision: u64) {
        for _ in 0..200 {
            let current = store
                .get(key)
                .await
                .unwrap()
                .and_then(|s| s.value())
                .and_then(|v| v["revision"].as_u64());
            if current == Some(revision) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("remote never reached revision {}", revision);
    }

    #[test]
    fn test_update_bumps_revision() {
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = engine("a", PersistenceAdapter::memory(), clock.clone());
        let (_sub, mut rx) = events(&engine);

        clock.advance(5);
        let snapshot = engine.update(SessionPatch::new().frame(Frame::Tablet)).unwrap();
        assert_eq!(snapshot.revision(), 1);
        assert_eq!(snapshot.updated_at(), 1_005);
        assert_eq!(snapshot.session_id(), "a");
        assert_eq!(snapshot.view().active_frame, Frame::Tablet);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, Origin::Local);
        assert!(event.changes.session);
        assert!(!event.changes.surface);

        // Same value again changes nothing
        assert!(engine.update(SessionPatch::new().frame(Frame::Tablet)).is_none());
        assert_eq!(engine.read().revision(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_update_persists_locally() {
        let local = Arc::new(MemoryLocalStore::new());
        let adapter = PersistenceAdapter::new(local.clone(), BroadcastHub::default());
        let engine = engine("a", adapter, Arc::new(ManualClock::new(1)));

        engine.update(SessionPatch::new().surface(Surface::Metadata));

        let raw = nuwa_storage::LocalStore::get(&*local, engine.key())
            .unwrap()
            .unwrap();
        let persisted: SessionSnapshot = decode_str(&raw).unwrap();
        assert_eq!(persisted.revision(), 1);
        assert_eq!(persisted.view().active_surface, Surface::Metadata);
    }

    #[test]
    fn test_duplicate_update_is_rejected() {
        let engine = engine("local", PersistenceAdapter::memory(), Arc::new(ManualClock::new(1_000)));
        let (_sub, mut rx) = events(&engine);
        let mut incoming = record("remote", 1, 1_000);
        incoming.view.active_frame = Frame::Mobile;

        assert!(engine.apply_update(incoming.clone(), Origin::Remote));
        let after_first = engine.read();
        assert!(rx.try_recv().is_ok());

        assert!(!engine.apply_update(incoming, Origin::Remote));
        assert_eq!(*engine.read(), *after_first);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_update_still_refreshes_presence() {
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = engine("local", PersistenceAdapter::memory(), clock.clone());
        engine.update(SessionPatch::new().frame(Frame::Mobile));
        engine.update(SessionPatch::new().frame(Frame::Tablet));

        assert!(!engine.apply_update(record("late", 1, 900), Origin::Remote));
        let snapshot = engine.read();
        assert_eq!(snapshot.revision(), 2);
        assert!(snapshot.presence.contains_key("late"));
    }

    #[test]
    fn test_expired_presence_is_pruned() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = engine("local", PersistenceAdapter::memory(), clock.clone());

        assert!(engine.apply_update(record("b", 1, 0), Origin::Remote));
        assert!(engine.read().presence.contains_key("b"));

        clock.set(61_000);
        assert!(engine.apply_update(record("c", 2, 61_000), Origin::Remote));

        let presence = &engine.read().presence;
        assert!(!presence.contains_key("b"));
        assert!(presence.contains_key("c"));
        let local: &PresenceEntry = presence.get("local").unwrap();
        assert!(local.is_local);
    }

    #[test]
    fn test_equal_revision_converges_regardless_of_order() {
        let clock = Arc::new(ManualClock::new(0));
        let first = engine("c1", PersistenceAdapter::memory(), clock.clone());
        let second = engine("c2", PersistenceAdapter::memory(), clock.clone());

        let mut early = record("a", 3, 1_000);
        early.view.active_frame = Frame::Tablet;
        let mut late = record("b", 3, 1_001);
        late.view.active_frame = Frame::Mobile;

        first.apply_update(early.clone(), Origin::Remote);
        first.apply_update(late.clone(), Origin::Remote);
        second.apply_update(late, Origin::Remote);
        second.apply_update(early, Origin::Remote);

        assert_eq!(first.read().record, second.read().record);
        assert_eq!(first.read().view().active_frame, Frame::Mobile);
        assert_eq!(first.read().updated_at(), 1_001);
    }

    #[test]
    fn test_incompatible_payload_is_ignored() {
        let engine = engine("a", PersistenceAdapter::memory(), Arc::new(ManualClock::new(0)));
        let mut value = serde_json::to_value(record("b", 5, 10)).unwrap();
        value["schemaVersion"] = "global-session.v0".into();

        assert!(!engine.apply_payload(&value.to_string(), Origin::Remote));
        assert!(!engine.apply_payload("not json", Origin::Remote));
        assert_eq!(engine.read().revision(), 0);

        value["schemaVersion"] = SESSION_SCHEMA_VERSION.into();
        assert!(engine.apply_payload(&value.to_string(), Origin::Remote));
        assert_eq!(engine.read().revision(), 5);
    }

    #[test]
    fn test_remote_pointers_resolve_against_current() {
        let engine = engine("a", PersistenceAdapter::memory(), Arc::new(ManualClock::new(0)));
        engine.update(SessionPatch::new().draft("d0").compiled("c0"));

        let mut incoming = record("b", 2, 10);
        incoming.compiled_shadow = Some(CompiledShadow {
            draft_id: "d1".into(),
            compiled_id: "c1".into(),
            published_at: Some(10),
        });
        let (_sub, mut rx) = events(&engine);
        assert!(engine.apply_update(incoming, Origin::Remote));

        let snapshot = engine.read();
        assert_eq!(snapshot.record.draft_id.as_deref(), Some("d1"));
        assert_eq!(snapshot.record.compiled_id.as_deref(), Some("c1"));
        assert!(rx.try_recv().unwrap().changes.draft_pointers);

        let mut incoming = record("b", 3, 11);
        incoming.compiled_shadow = None;
        assert!(engine.apply_update(incoming, Origin::Remote));
        assert_eq!(engine.read().record.draft_id.as_deref(), Some("d1"));
    }

    #[test]
    fn test_commit_staged_falls_back_when_session_moved() {
        let engine = engine("a", PersistenceAdapter::memory(), Arc::new(ManualClock::new(0)));
        let staged = engine.stage(SessionPatch::new().frame(Frame::Mobile)).unwrap();
        assert_eq!(staged.snapshot().revision(), 1);
        assert_eq!(engine.read().revision(), 0);

        engine.update(SessionPatch::new().surface(Surface::Frames));
        let committed = engine.commit_staged(staged, |_| true).unwrap();
        assert_eq!(committed.revision(), 2);
        assert_eq!(committed.view().active_frame, Frame::Mobile);
        assert_eq!(committed.view().active_surface, Surface::Frames);
    }

    #[test]
    fn test_commit_staged_respects_guard() {
        let engine = engine("a", PersistenceAdapter::memory(), Arc::new(ManualClock::new(0)));
        let staged = engine.stage(SessionPatch::new().frame(Frame::Mobile)).unwrap();
        assert!(engine.commit_staged(staged, |_| false).is_none());
        assert_eq!(engine.read().revision(), 0);

        let staged = engine.stage(SessionPatch::new().frame(Frame::Mobile)).unwrap();
        engine.update(SessionPatch::new().surface(Surface::Frames));
        assert!(engine
            .commit_staged(staged, |current| current.view().active_surface != Surface::Frames)
            .is_none());
        assert_eq!(engine.read().revision(), 1);
        assert_eq!(engine.read().view().active_frame, Frame::Desktop);
    }

    #[test]
    fn test_own_echo_does_not_roll_back_presence() {
        let engine = engine("a", PersistenceAdapter::memory(), Arc::new(ManualClock::new(1_000)));
        let echo = engine.update(SessionPatch::new().frame(Frame::Mobile)).unwrap();
        engine.update(SessionPatch::new().frame(Frame::Tablet));

        let value = serde_json::to_value(&echo.record).unwrap();
        assert!(!engine.apply_value(&value, Origin::Remote));

        let snapshot = engine.read();
        assert_eq!(snapshot.revision(), 2);
        assert_eq!(snapshot.view().active_frame, Frame::Tablet);
        let local = &snapshot.presence["a"];
        assert!(local.is_local);
        assert_eq!(local.active_frame, Frame::Tablet);
    }

    #[test]
    fn test_concurrent_updates_leave_in_order() {
        let local = Arc::new(MemoryLocalStore::new());
        let adapter = PersistenceAdapter::new(local.clone(), BroadcastHub::default());
        let engine = engine("local", adapter, Arc::new(ManualClock::new(0)));

        let last = Arc::new(AtomicU64::new(0));
        let inversions = Arc::new(AtomicU64::new(0));
        let _sub = {
            let last = last.clone();
            let inversions = inversions.clone();
            engine.subscribe(move |event| {
                let revision = event.snapshot.revision();
                if last.swap(revision, AtomicOrdering::SeqCst) > revision {
                    inversions.fetch_add(1, AtomicOrdering::SeqCst);
                }
            })
        };

        let threads: Vec<_> = (0..4u64)
            .map(|t| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for revision in (1..=2_000u64).filter(|r| r % 4 == t) {
                        engine.apply_update(record("peer", revision, revision), Origin::Remote);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(inversions.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(last.load(AtomicOrdering::SeqCst), 2_000);
        assert_eq!(engine.read().revision(), 2_000);

        let raw = nuwa_storage::LocalStore::get(&*local, engine.key())
            .unwrap()
            .unwrap();
        let persisted: SessionSnapshot = decode_str(&raw).unwrap();
        assert_eq!(persisted.revision(), 2_000);
    }

    #[tokio::test]
    async fn test_local_store_failures_are_not_fatal() {
        let adapter = PersistenceAdapter::new(Arc::new(FailingLocalStore), BroadcastHub::default());
        let engine = engine("a", adapter, Arc::new(ManualClock::new(1_000)));
        engine.connect().await.unwrap();

        let snapshot = engine.update(SessionPatch::new().frame(Frame::Mobile)).unwrap();
        assert_eq!(snapshot.revision(), 1);
        assert!(engine.apply_update(record("b", 2, 1_000), Origin::Remote));

        let snapshot = engine.read();
        assert_eq!(snapshot.revision(), 2);
        assert_eq!(snapshot.session_id(), "b");
        assert!(snapshot.presence.contains_key("b"));
    }

    #[tokio::test]
    async fn test_disconnected_updates_are_not_queued() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let a = engine("a", PersistenceAdapter::memory().with_remote(remote.clone()), clock.clone());

        for scale in [0.25, 0.5, 0.75] {
            clock.advance(1);
            a.update(SessionPatch::new().scale(scale));
        }
        assert!(remote.is_empty());
        assert!(a.outbox_rx.lock().await.try_recv().is_err());

        // Offline edits reach the remote once on connect
        a.connect().await.unwrap();
        wait_for_remote_revision(&remote, a.key(), 3).await;
    }

    #[tokio::test]
    async fn test_connect_pushes_newer_local_over_older_remote() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let key = DocumentKey::global_session("app").unwrap().path();
        let mut older = SessionSnapshot::seed("z", ViewState::default(), 500);
        older.record.revision = 1;
        remote.set(&key, serde_json::to_value(&older).unwrap()).await.unwrap();

        let clock = Arc::new(ManualClock::new(1_000));
        let a = engine("a", PersistenceAdapter::memory().with_remote(remote.clone()), clock.clone());
        a.update(SessionPatch::new().frame(Frame::Mobile));
        clock.advance(1);
        a.update(SessionPatch::new().frame(Frame::Tablet));

        a.connect().await.unwrap();
        assert_eq!(a.read().revision(), 2);
        wait_for_remote_revision(&remote, &key, 2).await;
    }

    #[tokio::test]
    async fn test_broadcast_between_participants() {
        let hub = BroadcastHub::default();
        let clock = Arc::new(ManualClock::new(1_000));
        let a = engine("a", PersistenceAdapter::new(Arc::new(MemoryLocalStore::new()), hub.clone()), clock.clone());
        let b = engine("b", PersistenceAdapter::new(Arc::new(MemoryLocalStore::new()), hub.clone()), clock.clone());
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        assert!(a.is_connected());

        let (_sub, mut rx) = events(&b);
        a.update(SessionPatch::new().frame(Frame::Mobile).select("root/hero"));

        let event = next_event(&mut rx).await;
        assert_eq!(event.origin, Origin::Remote);
        assert!(event.changes.session);
        assert_eq!(event.snapshot.view().selection_path.as_deref(), Some("root/hero"));
        assert!(!event.snapshot.presence["a"].is_local);
        assert!(event.snapshot.presence["b"].is_local);

        b.disconnect();
        assert!(!b.is_connected());
    }

    #[tokio::test]
    async fn test_connect_adopts_persisted_local_snapshot() {
        let local = Arc::new(MemoryLocalStore::new());
        let clock = Arc::new(ManualClock::new(1_000));

        let first = engine("a", PersistenceAdapter::new(local.clone(), BroadcastHub::default()), clock.clone());
        first.update(SessionPatch::new().frame(Frame::Tablet));
        first.update(SessionPatch::new().scale(0.5));

        let second = engine("b", PersistenceAdapter::new(local, BroadcastHub::default()), clock);
        second.connect().await.unwrap();

        let snapshot = second.read();
        assert_eq!(snapshot.revision(), 2);
        assert_eq!(snapshot.view().scale, 0.5);
        assert!(snapshot.presence["b"].is_local);
        assert!(!snapshot.presence["a"].is_local);
    }

    #[tokio::test]
    async fn test_remote_mirror_and_watch() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let clock = Arc::new(ManualClock::new(1_000));

        let a = engine("a", PersistenceAdapter::memory().with_remote(remote.clone()), clock.clone());
        a.connect().await.unwrap();
        wait_for_remote_revision(&remote, a.key(), 0).await;

        clock.advance(1);
        a.update(SessionPatch::new().frame(Frame::Mobile));
        wait_for_remote_revision(&remote, a.key(), 1).await;

        // Separate hub: only the remote store links the two
        let b = engine("b", PersistenceAdapter::memory().with_remote(remote.clone()), clock.clone());
        b.connect().await.unwrap();
        assert_eq!(b.read().revision(), 1);
        assert_eq!(b.read().view().active_frame, Frame::Mobile);

        let (_sub, mut rx) = events(&b);
        clock.advance(1);
        a.update(SessionPatch::new().surface(Surface::Telemetry));

        let event = next_event(&mut rx).await;
        assert_eq!(event.origin, Origin::Remote);
        assert_eq!(event.snapshot.revision(), 2);
        assert!(event.changes.surface);
    }

    #[tokio::test]
    async fn test_connect_adopts_newer_remote() {
        let remote = Arc::new(MemoryRemoteStore::without_transactions());
        let key = DocumentKey::global_session("app").unwrap().path();
        let mut newer = SessionSnapshot::seed("z", ViewState::default(), 5_000);
        newer.record.revision = 10;
        remote.set(&key, serde_json::to_value(&newer).unwrap()).await.unwrap();

        let a = engine("a", PersistenceAdapter::memory().with_remote(remote.clone()), Arc::new(ManualClock::new(1_000)));
        a.connect().await.unwrap();
        assert_eq!(a.read().revision(), 10);

        a.update(SessionPatch::new().frame(Frame::Tablet));
        wait_for_remote_revision(&remote, &key, 11).await;
    }

    #[test]
    fn test_supersedes_remote() {
        let mine = record("a", 2, 100);
        assert!(supersedes_remote(&mine, None));
        let older = serde_json::to_value(record("b", 1, 500)).unwrap();
        assert!(supersedes_remote(&mine, Some(&older)));
        let newer = serde_json::to_value(record("b", 3, 50)).unwrap();
        assert!(!supersedes_remote(&mine, Some(&newer)));
        let foreign = serde_json::json!({"schemaVersion": "global-session.v9"});
        assert!(!supersedes_remote(&mine, Some(&foreign)));
    }

    #[test]
    fn test_config_defaults() {
        let config: SessionConfig = serde_json::from_str("{\"app_id\":\"app\"}").unwrap();
        assert_eq!(config.presence_ttl_ms, 60_000);
        assert!(config.session_id.is_none());

        let engine = SharedSessionEngine::new(config, PersistenceAdapter::memory()).unwrap();
        assert!(!engine.session_id().is_empty());
        assert_eq!(engine.key(), "/artifacts/app/public/data/globalSession");

        assert!(SharedSessionEngine::new(SessionConfig::new("bad app"), PersistenceAdapter::memory()).is_err());
    }
}
