//! nuwa core - session model, conflict resolution and presence
//!
//! This crate provides the pure building blocks of the shared-session engine:
//! - The session snapshot, update records and artifact documents
//! - Last-writer-wins conflict resolution over whole records
//! - TTL-based presence tracking
//! - The document key scheme and schema-version whitelist

pub mod artifact;
pub mod clock;
pub mod error;
pub mod paths;
pub mod presence;
pub mod resolver;
pub mod schema;
pub mod session;

pub use artifact::{compile_draft, Artifact, CompiledArtifact, DraftArtifact};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use paths::{DocumentKey, DocumentKind};
pub use presence::PresenceTracker;
pub use resolver::{ConflictResolver, Precedence, Stamp, Stamped};
pub use schema::{decode, decode_str, Versioned};
pub use session::{
    CompiledShadow, DraftLock, Frame, PipelineError, PipelineState, PipelineStatus, PresenceEntry,
    SessionPatch, SessionSnapshot, SessionUpdate, Surface, ViewState,
};
