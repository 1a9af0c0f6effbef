//! nuwa session - the shared-session synchronization engine
//!
//! Keeps one editing-session record consistent across concurrent writers
//! without a coordinator:
//! - [`SharedSessionEngine`]: the session snapshot, local updates and
//!   last-writer-wins merging of everybody else's
//! - [`ArtifactStore`]: the same discipline for draft and compiled documents
//! - [`PipelineCoordinator`]: the compile/publish state machine and draft lock
//!
//! # Example
//!
//! ```no_run
//! use nuwa_core::{Frame, SessionPatch};
//! use nuwa_session::{SessionConfig, SharedSessionEngine};
//! use nuwa_storage::PersistenceAdapter;
//!
//! # async fn example() -> nuwa_session::Result<()> {
//! let engine = SharedSessionEngine::new(SessionConfig::new("my-app"), PersistenceAdapter::memory())?;
//! engine.connect().await?;
//!
//! let _sub = engine.subscribe(|event| println!("revision {}", event.snapshot.revision()));
//! engine.update(SessionPatch::new().frame(Frame::Mobile));
//! # Ok(())
//! # }
//! ```

pub mod artifact_store;
pub mod engine;
pub mod error;
pub mod event;
pub mod observer;
pub mod pipeline;

pub use artifact_store::ArtifactStore;
pub use engine::{SessionConfig, SharedSessionEngine, StagedUpdate};
pub use error::{Result, SessionError};
pub use event::{ArtifactEvent, ChangeSet, Origin, SessionEvent};
pub use observer::{Observers, Subscription};
pub use pipeline::{PipelineCoordinator, PublishMetadata};
