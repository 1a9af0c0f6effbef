//! Change notifications

use nuwa_core::{SessionSnapshot, SessionUpdate};
use std::sync::Arc;

/// Where an applied change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by this participant
    Local,
    /// Received from another participant (broadcast, remote store, relay)
    Remote,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Remote => write!(f, "remote"),
        }
    }
}

/// Which groups of fields differ between two session records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Active frame or selection
    pub session: bool,
    /// Active surface, scale or drawers
    pub surface: bool,
    /// Pipeline state or draft lock
    pub pipeline: bool,
    /// Draft id, compiled id or compiled shadow
    pub draft_pointers: bool,
}

impl ChangeSet {
    pub fn between(prev: &SessionUpdate, next: &SessionUpdate) -> Self {
        let (a, b) = (&prev.view, &next.view);
        Self {
            session: a.active_frame != b.active_frame || a.selection_path != b.selection_path,
            surface: a.active_surface != b.active_surface
                || a.scale != b.scale
                || a.drawers != b.drawers,
            pipeline: prev.pipeline != next.pipeline || prev.draft_lock != next.draft_lock,
            draft_pointers: prev.draft_id != next.draft_id
                || prev.compiled_id != next.compiled_id
                || prev.compiled_shadow != next.compiled_shadow,
        }
    }

    pub fn any(&self) -> bool {
        self.session || self.surface || self.pipeline || self.draft_pointers
    }
}

/// Emitted after the session snapshot is replaced
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub snapshot: Arc<SessionSnapshot>,
    pub origin: Origin,
    pub changes: ChangeSet,
}

/// Emitted after an artifact store accepts a document
#[derive(Debug)]
pub struct ArtifactEvent<T> {
    pub document: Arc<T>,
    pub origin: Origin,
}

impl<T> Clone for ArtifactEvent<T> {
    fn clone(&self) -> Self {
        Self {
            document: self.document.clone(),
            origin: self.origin,
        }
    }
}
