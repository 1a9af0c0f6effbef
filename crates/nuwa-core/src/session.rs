//! The shared session record, its update records and presence entries

use crate::resolver::{Precedence, Stamp, Stamped};
use crate::schema::{Versioned, SESSION_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error code recorded when a build is aborted with a reason
pub const PIPELINE_ABORTED: &str = "PIPELINE_ABORTED";

/// Responsive frame currently shown on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

/// The surface that currently has focus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    #[default]
    Canvas,
    Frames,
    Metadata,
    Telemetry,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawerName {
    Top,
    Left,
    Right,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawerState {
    pub open: bool,
    pub size: u32,
}

/// Drawer layout around the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drawers {
    pub top: DrawerState,
    pub left: DrawerState,
    pub right: DrawerState,
    pub bottom: DrawerState,
}

impl Default for Drawers {
    fn default() -> Self {
        Self {
            top: DrawerState { open: true, size: 56 },
            left: DrawerState { open: true, size: 240 },
            right: DrawerState { open: true, size: 320 },
            bottom: DrawerState { open: false, size: 48 },
        }
    }
}

impl Drawers {
    pub fn get(&self, name: DrawerName) -> DrawerState {
        match name {
            DrawerName::Top => self.top,
            DrawerName::Left => self.left,
            DrawerName::Right => self.right,
            DrawerName::Bottom => self.bottom,
        }
    }

    /// A copy with one drawer replaced
    pub fn with(mut self, name: DrawerName, state: DrawerState) -> Self {
        match name {
            DrawerName::Top => self.top = state,
            DrawerName::Left => self.left = state,
            DrawerName::Right => self.right = state,
            DrawerName::Bottom => self.bottom = state,
        }
        self
    }

    pub fn open(self, name: DrawerName, size: Option<u32>) -> Self {
        let current = self.get(name);
        self.with(
            name,
            DrawerState {
                open: true,
                size: size.unwrap_or(current.size),
            },
        )
    }

    pub fn close(self, name: DrawerName) -> Self {
        let current = self.get(name);
        self.with(name, DrawerState { open: false, ..current })
    }

    pub fn toggle(self, name: DrawerName, size: Option<u32>) -> Self {
        if self.get(name).open {
            self.close(name)
        } else {
            self.open(name, size)
        }
    }

    pub fn reset() -> Self {
        Self::default()
    }
}

fn default_scale() -> f64 {
    1.0
}

/// View fields shared by every participant of the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub active_frame: Frame,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_path: Option<String>,
    pub active_surface: Surface,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub drawers: Drawers,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            active_frame: Frame::default(),
            selection_path: None,
            active_surface: Surface::default(),
            scale: default_scale(),
            drawers: Drawers::default(),
        }
    }
}

/// Pointer to the last published draft/compiled pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledShadow {
    pub draft_id: String,
    pub compiled_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Idle,
    Compiling,
    Success,
    Error,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Idle => write!(f, "idle"),
            PipelineStatus::Compiling => write!(f, "compiling"),
            PipelineStatus::Success => write!(f, "success"),
            PipelineStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub code: String,
    pub message: String,
}

/// State of the compile/publish pipeline
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
}

/// Advisory lock gating draft edits while a build is running
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftLock {
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<u64>,
}

/// A full session record as produced by one participant.
///
/// This is both what gets broadcast and the body of a [`SessionSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub schema_version: String,
    pub session_id: String,
    pub revision: u64,
    pub updated_at: u64,
    #[serde(flatten)]
    pub view: ViewState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_shadow: Option<CompiledShadow>,
    #[serde(default)]
    pub pipeline: PipelineState,
    #[serde(default)]
    pub draft_lock: DraftLock,
}

impl Versioned for SessionUpdate {
    const COMPATIBLE_VERSIONS: &'static [&'static str] = &[SESSION_SCHEMA_VERSION];

    fn schema_version(&self) -> &str {
        &self.schema_version
    }
}

impl Stamped for SessionUpdate {
    fn precedence(&self) -> Precedence<'_> {
        Precedence::Lineage(Stamp {
            revision: self.revision,
            updated_at: self.updated_at,
            session_id: &self.session_id,
        })
    }
}

/// Ephemeral visibility record of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub session_id: String,
    pub active_frame: Frame,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_path: Option<String>,
    pub active_surface: Surface,
    pub last_seen_at: u64,
    pub is_local: bool,
}

impl PresenceEntry {
    pub fn from_update(update: &SessionUpdate, is_local: bool) -> Self {
        Self {
            session_id: update.session_id.clone(),
            active_frame: update.view.active_frame,
            selection_path: update.view.selection_path.clone(),
            active_surface: update.view.active_surface,
            last_seen_at: update.updated_at,
            is_local,
        }
    }
}

pub type PresenceMap = BTreeMap<String, PresenceEntry>;

/// The single shared session record plus presence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub record: SessionUpdate,
    #[serde(default)]
    pub presence: PresenceMap,
}

impl SessionSnapshot {
    /// Initial snapshot of a freshly started participant (revision 0)
    pub fn seed(session_id: impl Into<String>, view: ViewState, now: u64) -> Self {
        let record = SessionUpdate {
            schema_version: SESSION_SCHEMA_VERSION.to_string(),
            session_id: session_id.into(),
            revision: 0,
            updated_at: now,
            view,
            draft_id: None,
            compiled_id: None,
            compiled_shadow: None,
            pipeline: PipelineState::default(),
            draft_lock: DraftLock::default(),
        };
        let mut presence = PresenceMap::new();
        presence.insert(
            record.session_id.clone(),
            PresenceEntry::from_update(&record, true),
        );
        Self { record, presence }
    }

    pub fn revision(&self) -> u64 {
        self.record.revision
    }

    pub fn updated_at(&self) -> u64 {
        self.record.updated_at
    }

    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    pub fn view(&self) -> &ViewState {
        &self.record.view
    }

    pub fn pipeline(&self) -> &PipelineState {
        &self.record.pipeline
    }

    pub fn draft_lock(&self) -> &DraftLock {
        &self.record.draft_lock
    }
}

impl Versioned for SessionSnapshot {
    const COMPATIBLE_VERSIONS: &'static [&'static str] = &[SESSION_SCHEMA_VERSION];

    fn schema_version(&self) -> &str {
        &self.record.schema_version
    }
}

impl Stamped for SessionSnapshot {
    fn precedence(&self) -> Precedence<'_> {
        self.record.precedence()
    }
}

/// Draft and compiled pointers after precedence resolution
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pointers {
    pub draft_id: Option<String>,
    pub compiled_id: Option<String>,
    pub compiled_shadow: Option<CompiledShadow>,
}

/// Resolve the draft/compiled pointers of a new record.
///
/// Explicit scalar ids win over the ids carried by a shadow pointer, which in
/// turn win over the currently held values.
pub fn resolve_pointers(
    draft_id: Option<&str>,
    compiled_id: Option<&str>,
    shadow: Option<&CompiledShadow>,
    current: &SessionUpdate,
) -> Pointers {
    Pointers {
        draft_id: draft_id
            .map(str::to_owned)
            .or_else(|| shadow.map(|s| s.draft_id.clone()))
            .or_else(|| current.draft_id.clone()),
        compiled_id: compiled_id
            .map(str::to_owned)
            .or_else(|| shadow.map(|s| s.compiled_id.clone()))
            .or_else(|| current.compiled_id.clone()),
        compiled_shadow: shadow
            .cloned()
            .or_else(|| current.compiled_shadow.clone()),
    }
}

/// A partial local update. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub active_frame: Option<Frame>,
    /// `Some(None)` clears the selection
    pub selection_path: Option<Option<String>>,
    pub active_surface: Option<Surface>,
    pub scale: Option<f64>,
    pub drawers: Option<Drawers>,
    pub draft_id: Option<String>,
    pub compiled_id: Option<String>,
    pub compiled_shadow: Option<CompiledShadow>,
    pub pipeline: Option<PipelineState>,
    pub draft_lock: Option<DraftLock>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(mut self, frame: Frame) -> Self {
        self.active_frame = Some(frame);
        self
    }

    pub fn select(mut self, path: impl Into<String>) -> Self {
        self.selection_path = Some(Some(path.into()));
        self
    }

    pub fn clear_selection(mut self) -> Self {
        self.selection_path = Some(None);
        self
    }

    pub fn surface(mut self, surface: Surface) -> Self {
        self.active_surface = Some(surface);
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn drawers(mut self, drawers: Drawers) -> Self {
        self.drawers = Some(drawers);
        self
    }

    pub fn draft(mut self, draft_id: impl Into<String>) -> Self {
        self.draft_id = Some(draft_id.into());
        self
    }

    pub fn compiled(mut self, compiled_id: impl Into<String>) -> Self {
        self.compiled_id = Some(compiled_id.into());
        self
    }

    pub fn shadow(mut self, shadow: CompiledShadow) -> Self {
        self.compiled_shadow = Some(shadow);
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineState) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn draft_lock(mut self, lock: DraftLock) -> Self {
        self.draft_lock = Some(lock);
        self
    }

    /// Merge the view fields of this patch over `current`
    pub fn apply_view(&self, current: &ViewState) -> ViewState {
        ViewState {
            active_frame: self.active_frame.unwrap_or(current.active_frame),
            selection_path: match &self.selection_path {
                Some(path) => path.clone(),
                None => current.selection_path.clone(),
            },
            active_surface: self.active_surface.unwrap_or(current.active_surface),
            scale: self.scale.unwrap_or(current.scale),
            drawers: self.drawers.unwrap_or(current.drawers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::decode;
    use serde_json::json;

    fn record() -> SessionUpdate {
        SessionSnapshot::seed("s1", ViewState::default(), 1_000).record
    }

    #[test]
    fn test_seed_has_local_presence() {
        let snapshot = SessionSnapshot::seed("s1", ViewState::default(), 1_000);
        assert_eq!(snapshot.revision(), 0);
        let entry = snapshot.presence.get("s1").unwrap();
        assert!(entry.is_local);
        assert_eq!(entry.last_seen_at, 1_000);
    }

    #[test]
    fn test_scalar_ids_win_over_shadow() {
        let shadow = CompiledShadow {
            draft_id: "shadow-draft".into(),
            compiled_id: "shadow-compiled".into(),
            published_at: None,
        };
        let pointers = resolve_pointers(None, Some("explicit"), Some(&shadow), &record());
        assert_eq!(pointers.draft_id.as_deref(), Some("shadow-draft"));
        assert_eq!(pointers.compiled_id.as_deref(), Some("explicit"));
        assert_eq!(pointers.compiled_shadow, Some(shadow));
    }

    #[test]
    fn test_pointers_fall_back_to_current() {
        let mut current = record();
        current.draft_id = Some("d0".into());
        let pointers = resolve_pointers(None, None, None, &current);
        assert_eq!(pointers.draft_id.as_deref(), Some("d0"));
        assert!(pointers.compiled_id.is_none());
    }

    #[test]
    fn test_patch_can_clear_selection() {
        let mut view = ViewState::default();
        view.selection_path = Some("elements.hero".into());

        let kept = SessionPatch::new().frame(Frame::Mobile).apply_view(&view);
        assert_eq!(kept.selection_path.as_deref(), Some("elements.hero"));
        assert_eq!(kept.active_frame, Frame::Mobile);

        let cleared = SessionPatch::new().clear_selection().apply_view(&view);
        assert!(cleared.selection_path.is_none());
    }

    #[test]
    fn test_drawer_helpers() {
        let drawers = Drawers::default()
            .toggle(DrawerName::Bottom, Some(120))
            .close(DrawerName::Left);
        assert_eq!(drawers.bottom, DrawerState { open: true, size: 120 });
        assert!(!drawers.left.open);
        assert_eq!(drawers.left.size, 240);
        assert_eq!(Drawers::reset(), Drawers::default());
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let mut snapshot = SessionSnapshot::seed("s1", ViewState::default(), 5);
        snapshot.record.pipeline.status = PipelineStatus::Compiling;

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["schemaVersion"], json!("global-session.v1"));
        assert_eq!(value["activeFrame"], json!("desktop"));
        assert_eq!(value["pipeline"]["status"], json!("compiling"));
        assert_eq!(value["presence"]["s1"]["isLocal"], json!(true));

        let decoded: SessionSnapshot = decode(&value).unwrap();
        assert_eq!(decoded, snapshot);

        // A bare update record decodes with an empty presence map
        let update: SessionSnapshot = decode(&serde_json::to_value(&snapshot.record).unwrap()).unwrap();
        assert!(update.presence.is_empty());
    }
}
