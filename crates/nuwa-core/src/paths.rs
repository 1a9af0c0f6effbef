//! Document keys and the backend-agnostic path scheme

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum length of an app or document id in bytes
pub const MAX_ID_LENGTH: usize = 512;

/// The kinds of documents replicated by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentKind {
    GlobalSession,
    Draft,
    Compiled,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentKind::GlobalSession => write!(f, "globalSession"),
            DocumentKind::Draft => write!(f, "draft"),
            DocumentKind::Compiled => write!(f, "compiled"),
        }
    }
}

/// Deterministic key for a persisted document, derived from
/// `(app_id, kind, document_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    app_id: String,
    kind: DocumentKind,
    document_id: Option<String>,
}

impl DocumentKey {
    /// Key of the single shared session record of an app
    pub fn global_session(app_id: impl Into<String>) -> Result<Self> {
        let app_id = app_id.into();
        validate_id(&app_id).map_err(Error::InvalidAppId)?;
        Ok(Self {
            app_id,
            kind: DocumentKind::GlobalSession,
            document_id: None,
        })
    }

    pub fn draft(app_id: impl Into<String>, draft_id: impl Into<String>) -> Result<Self> {
        Self::document(app_id.into(), DocumentKind::Draft, draft_id.into())
    }

    pub fn compiled(app_id: impl Into<String>, compiled_id: impl Into<String>) -> Result<Self> {
        Self::document(app_id.into(), DocumentKind::Compiled, compiled_id.into())
    }

    /// Build the key of an artifact document of the given kind
    pub fn for_kind(
        app_id: impl Into<String>,
        kind: DocumentKind,
        document_id: impl Into<String>,
    ) -> Result<Self> {
        match kind {
            DocumentKind::GlobalSession => Self::global_session(app_id),
            _ => Self::document(app_id.into(), kind, document_id.into()),
        }
    }

    fn document(app_id: String, kind: DocumentKind, document_id: String) -> Result<Self> {
        validate_id(&app_id).map_err(Error::InvalidAppId)?;
        validate_id(&document_id).map_err(Error::InvalidDocumentId)?;
        Ok(Self {
            app_id,
            kind,
            document_id: Some(document_id),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    /// The storage path for this key.
    ///
    /// Compiled documents live outside the app namespace so that runtimes can
    /// resolve them by id alone.
    pub fn path(&self) -> String {
        let id = self.document_id.as_deref().unwrap_or_default();
        match self.kind {
            DocumentKind::GlobalSession => {
                format!("/artifacts/{}/public/data/globalSession", self.app_id)
            }
            DocumentKind::Draft => format!("/artifacts/{}/public/data/drafts/{}", self.app_id, id),
            DocumentKind::Compiled => format!("/compiled/{}", id),
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// Validate an id segment: non-empty, at most 512 bytes, `[a-zA-Z0-9:_-]+`
fn validate_id(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() {
        return Err("ID cannot be empty".into());
    }

    if id.len() > MAX_ID_LENGTH {
        return Err(format!("ID exceeds {} bytes", MAX_ID_LENGTH));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-')
    {
        return Err(format!("ID must match pattern [a-zA-Z0-9:_-]+: {}", id));
    }

    Ok(())
}
