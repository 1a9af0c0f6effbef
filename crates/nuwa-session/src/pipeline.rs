//! Compile/publish pipeline state machine
//!
//! ```text
//! idle|success|error --trigger--> compiling
//! compiling --abort--> idle
//! compiling --publish--> success
//! any --report_failure--> error
//! ```
//!
//! The draft lock is taken on trigger and released on every exit from
//! `compiling`. Transitions are plain session updates, so every
//! participant observes them through the normal change notifications.

use crate::artifact_store::{self, ArtifactStore, Propagation};
use crate::engine::{self, SharedSessionEngine};
use crate::event::Origin;
use nuwa_core::session::PIPELINE_ABORTED;
use nuwa_core::{
    Artifact, CompiledArtifact, CompiledShadow, DocumentKey, DraftLock, PipelineError,
    PipelineState, PipelineStatus, SessionPatch, SessionSnapshot,
};
use nuwa_storage::{transaction_fn, CompileRequest, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Optional release information recorded on publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMetadata {
    pub tag: Option<String>,
    pub notes: Option<String>,
}

/// Drives the pipeline fields of the shared session
pub struct PipelineCoordinator {
    engine: Arc<SharedSessionEngine>,
    compiled: Arc<ArtifactStore<CompiledArtifact>>,
}

impl PipelineCoordinator {
    pub fn new(
        engine: Arc<SharedSessionEngine>,
        compiled: Arc<ArtifactStore<CompiledArtifact>>,
    ) -> Self {
        Self { engine, compiled }
    }

    pub fn compiled(&self) -> &Arc<ArtifactStore<CompiledArtifact>> {
        &self.compiled
    }

    pub fn status(&self) -> PipelineStatus {
        self.engine.read().pipeline().status
    }

    /// Whether draft edits should currently be refused
    pub fn draft_locked(&self) -> bool {
        self.engine.read().draft_lock().locked
    }

    /// Start a build of `draft_id`. Returns the allocated compiled id, or
    /// `None` if a build is already running.
    pub fn trigger(&self, draft_id: &str) -> Option<String> {
        if let Err(e) = DocumentKey::draft(self.engine.app_id(), draft_id) {
            warn!(draft = %draft_id, error = %e, "Refusing to trigger pipeline");
            return None;
        }

        let now = self.engine.now();
        let compiled_id = allocate_compiled_id(draft_id, now);

        let applied = self.engine.update_with(|current| {
            if current.pipeline().status == PipelineStatus::Compiling {
                return None;
            }
            let pipeline = PipelineState {
                status: PipelineStatus::Compiling,
                triggered_at: Some(now),
                draft_id: Some(draft_id.to_string()),
                compiled_id: Some(compiled_id.clone()),
                ..PipelineState::default()
            };
            let lock = DraftLock {
                locked: true,
                draft_id: Some(draft_id.to_string()),
                locked_at: Some(now),
                released_at: None,
            };
            Some(SessionPatch::new().pipeline(pipeline).draft_lock(lock))
        });

        if applied.is_none() {
            debug!(draft = %draft_id, "Pipeline already compiling, trigger ignored");
            return None;
        }

        info!(draft = %draft_id, compiled = %compiled_id, "Pipeline triggered");
        self.invoke_worker(CompileRequest {
            app_id: self.engine.app_id().to_string(),
            draft_id: draft_id.to_string(),
            compiled_id: compiled_id.clone(),
            triggered_at: now,
        });
        Some(compiled_id)
    }

    /// Cancel a running build. With a reason, the pipeline records a
    /// `PIPELINE_ABORTED` error.
    pub fn abort(&self, reason: Option<&str>) -> bool {
        let now = self.engine.now();
        let applied = self.engine.update_with(|current| {
            let pipeline = current.pipeline();
            if pipeline.status != PipelineStatus::Compiling {
                return None;
            }
            let next = PipelineState {
                status: PipelineStatus::Idle,
                triggered_at: pipeline.triggered_at,
                aborted_at: Some(now),
                draft_id: pipeline.draft_id.clone(),
                compiled_id: pipeline.compiled_id.clone(),
                error: reason.map(|message| PipelineError {
                    code: PIPELINE_ABORTED.to_string(),
                    message: message.to_string(),
                }),
                ..PipelineState::default()
            };
            Some(
                SessionPatch::new()
                    .pipeline(next)
                    .draft_lock(released(current.draft_lock(), now)),
            )
        });

        match applied {
            Some(_) => {
                info!(reason = ?reason, "Pipeline aborted");
                true
            }
            None => {
                debug!("Pipeline not compiling, abort ignored");
                false
            }
        }
    }

    /// Publish a compiled artifact and point the session at it
    ///
    /// With a transactional remote store, the compiled document and the
    /// session are written together and both staleness checks run inside
    /// the transaction. Losing either check writes nothing and returns
    /// `false`.
    pub async fn publish(&self, artifact: CompiledArtifact, metadata: PublishMetadata) -> bool {
        let now = self.engine.now();
        let current = self.engine.read();
        let pipeline = current.pipeline();
        if pipeline.status != PipelineStatus::Compiling {
            debug!(status = %pipeline.status, "Pipeline not compiling, publish ignored");
            return false;
        }

        let draft_id = pipeline
            .draft_id
            .clone()
            .unwrap_or_else(|| artifact.draft_id.clone());
        let next = PipelineState {
            status: PipelineStatus::Success,
            triggered_at: pipeline.triggered_at,
            published_at: Some(now),
            tag: metadata.tag,
            notes: metadata.notes,
            draft_id: Some(draft_id.clone()),
            compiled_id: Some(artifact.compiled_id.clone()),
            ..PipelineState::default()
        };
        let patch = SessionPatch::new()
            .pipeline(next)
            .shadow(CompiledShadow {
                draft_id,
                compiled_id: artifact.compiled_id.clone(),
                published_at: Some(now),
            })
            .compiled(artifact.compiled_id.clone())
            .draft_lock(released(current.draft_lock(), now));

        if self.engine.adapter().capabilities().transactions {
            match self.publish_atomically(&artifact, patch.clone()).await {
                Ok(published) => return published,
                Err(e) => warn!(error = %e, "Transactional publish failed, publishing without"),
            }
        }

        let compiled_id = artifact.compiled_id.clone();
        if !self.compiled.write(artifact, Origin::Local) {
            debug!(compiled = %compiled_id, "Compiled artifact is stale, publish skipped");
            return false;
        }

        let applied = self
            .engine
            .update_with(move |current| compiling(current).then_some(patch));
        if applied.is_some() {
            info!(compiled = %compiled_id, "Pipeline published");
        }
        applied.is_some()
    }

    /// Record a failed build. Published pointers are left untouched.
    pub fn report_failure(&self, code: &str, message: &str) -> bool {
        let now = self.engine.now();
        let applied = self.engine.update_with(|current| {
            let pipeline = current.pipeline();
            let lock = current.draft_lock();
            let next = PipelineState {
                status: PipelineStatus::Error,
                triggered_at: pipeline.triggered_at,
                draft_id: pipeline.draft_id.clone(),
                compiled_id: pipeline.compiled_id.clone(),
                error: Some(PipelineError {
                    code: code.to_string(),
                    message: message.to_string(),
                }),
                ..PipelineState::default()
            };
            let lock = if lock.locked {
                released(lock, now)
            } else {
                lock.clone()
            };
            Some(SessionPatch::new().pipeline(next).draft_lock(lock))
        });

        if applied.is_some() {
            warn!(code, message, "Pipeline failed");
        }
        applied.is_some()
    }

    async fn publish_atomically(
        &self,
        artifact: &CompiledArtifact,
        patch: SessionPatch,
    ) -> Result<bool, StorageError> {
        let Some(remote) = self.engine.adapter().remote().cloned() else {
            return Err(StorageError::Unsupported("remote store"));
        };
        let Ok(compiled_key) = artifact.key().map(|k| k.path()) else {
            debug!(compiled = %artifact.compiled_id, "Invalid compiled id, publish skipped");
            return Ok(false);
        };
        let Some(staged) = self.engine.stage(patch) else {
            return Ok(false);
        };

        let session_key = self.engine.key().to_string();
        let session_value = serde_json::to_value(&**staged.snapshot())?;
        let compiled_value = serde_json::to_value(artifact)?;
        let record = staged.snapshot().record.clone();
        let candidate = artifact.clone();

        let written = Arc::new(AtomicBool::new(false));
        let flag = written.clone();
        remote
            .run_transaction(transaction_fn(move |txn| {
                Box::pin(async move {
                    let existing = txn.get(&compiled_key).await?.and_then(|s| s.value());
                    if !artifact_store::supersedes_remote(&candidate, existing.as_ref()) {
                        return Ok(());
                    }
                    let existing = txn.get(&session_key).await?.and_then(|s| s.value());
                    if !engine::supersedes_remote(&record, existing.as_ref()) {
                        return Ok(());
                    }
                    txn.set(&compiled_key, compiled_value);
                    txn.set(&session_key, session_value);
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await?;

        if !written.load(Ordering::SeqCst) {
            debug!(compiled = %artifact.compiled_id, "Remote documents are newer, publish skipped");
            return Ok(false);
        }

        self.compiled
            .accept(artifact.clone(), Origin::Local, Propagation::Broadcast);
        let committed = self.engine.commit_staged(staged, compiling).is_some();
        if committed {
            info!(compiled = %artifact.compiled_id, "Pipeline published atomically");
        } else {
            debug!(compiled = %artifact.compiled_id, "Pipeline left compiling before commit, publish dropped");
        }
        Ok(committed)
    }

    fn invoke_worker(&self, request: CompileRequest) {
        let Some(worker) = self.engine.adapter().compile_worker().cloned() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(compiled = %request.compiled_id, "No runtime, compile worker not invoked");
            return;
        };

        runtime.spawn(async move {
            let compiled_id = request.compiled_id.clone();
            if let Err(e) = worker.invoke(request).await {
                warn!(compiled = %compiled_id, error = %e, "Compile worker invocation failed");
            }
        });
    }
}

/// Whether a publish may still land on `current`
fn compiling(current: &SessionSnapshot) -> bool {
    current.pipeline().status == PipelineStatus::Compiling
}

fn released(lock: &DraftLock, now: u64) -> DraftLock {
    DraftLock {
        locked: false,
        draft_id: lock.draft_id.clone(),
        locked_at: lock.locked_at,
        released_at: Some(now),
    }
}

/// `compiled-{draftId}-{millis}-{6 hex}`
fn allocate_compiled_id(draft_id: &str, now: u64) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(6)
        .collect();
    format!("compiled-{}-{}-{}", draft_id, now, suffix)
}
