//! Two participants sharing one session through the same persistence
//! adapter, the way two browser tabs share storage and a broadcast channel.
//!
//! Run with `cargo run --example two_tabs`.

use std::sync::Arc;
use std::time::Duration;

use nuwa_core::{compile_draft, Clock, DraftArtifact, Frame, SessionPatch, SystemClock};
use nuwa_session::{
    ArtifactStore, Origin, PipelineCoordinator, PublishMetadata, SessionConfig,
    SharedSessionEngine,
};
use nuwa_storage::{ChannelCompileWorker, MemoryRemoteStore, PersistenceAdapter};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const APP: &str = "demo-app";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let (worker, mut requests) = ChannelCompileWorker::new();
    let adapter = PersistenceAdapter::memory()
        .with_remote(Arc::new(MemoryRemoteStore::new()))
        .with_compile_worker(Arc::new(worker));

    let left = SharedSessionEngine::new(SessionConfig::new(APP).with_session_id("left"), adapter.clone())?;
    let right = SharedSessionEngine::new(SessionConfig::new(APP).with_session_id("right"), adapter.clone())?;
    left.connect().await?;
    right.connect().await?;

    let _watch = right.subscribe(|event| {
        info!(
            revision = event.snapshot.revision(),
            origin = %event.origin,
            frame = ?event.snapshot.view().active_frame,
            "right tab saw a change"
        );
    });

    left.update(SessionPatch::new().frame(Frame::Mobile));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let clock = SystemClock;
    let drafts = ArtifactStore::<DraftArtifact>::new(adapter.clone(), APP, "left");
    drafts.write(DraftArtifact::new(APP, "draft-1", clock.now_millis()), Origin::Local);
    left.update(SessionPatch::new().draft("draft-1"));

    let compiled = ArtifactStore::new(adapter.clone(), APP, "left");
    let pipeline = PipelineCoordinator::new(left.clone(), compiled);

    if let Some(compiled_id) = pipeline.trigger("draft-1") {
        info!(compiled_id = %compiled_id, locked = pipeline.draft_locked(), "compile triggered");

        if let Some(request) = requests.recv().await {
            if let Some(draft) = drafts.read() {
                let artifact = compile_draft(&draft, request.compiled_id, clock.now_millis());
                let published = pipeline.publish(artifact, PublishMetadata::default()).await;
                info!(published, status = ?pipeline.status(), "publish finished");
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = right.read();
    info!(
        revision = seen.revision(),
        compiled = ?seen.record.compiled_id,
        "right tab final state"
    );

    Ok(())
}
