//! Draft and compiled artifact documents

use crate::error::Result;
use crate::paths::{DocumentKey, DocumentKind};
use crate::resolver::{Precedence, Stamped};
use crate::schema::{Versioned, COMPILED_SCHEMA_VERSION, DRAFT_SCHEMA_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Version string stamped into artifacts built by [`compile_draft`]
pub const LOCAL_COMPILER_VERSION: &str = "local-compiler";

/// A replicated document without a revision counter.
///
/// Staleness is decided by the document's own timestamp only.
pub trait Artifact:
    Versioned + Stamped + Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
    const KIND: DocumentKind;

    fn app_id(&self) -> &str;

    fn document_id(&self) -> &str;

    fn timestamp(&self) -> u64;

    fn key(&self) -> Result<DocumentKey> {
        DocumentKey::for_kind(self.app_id(), Self::KIND, self.document_id())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DraftProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styler: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DraftNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<DraftProps>,
}

/// The editable design draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftArtifact {
    pub schema_version: String,
    pub draft_id: String,
    pub app_id: String,
    pub updated_at: u64,
    #[serde(default)]
    pub elements: BTreeMap<String, DraftNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ghost_map: Option<Value>,
}

impl DraftArtifact {
    pub fn new(app_id: impl Into<String>, draft_id: impl Into<String>, updated_at: u64) -> Self {
        Self {
            schema_version: DRAFT_SCHEMA_VERSION.to_string(),
            draft_id: draft_id.into(),
            app_id: app_id.into(),
            updated_at,
            elements: BTreeMap::new(),
            ghost_map: None,
        }
    }
}

impl Versioned for DraftArtifact {
    const COMPATIBLE_VERSIONS: &'static [&'static str] = &[DRAFT_SCHEMA_VERSION];

    fn schema_version(&self) -> &str {
        &self.schema_version
    }
}

impl Stamped for DraftArtifact {
    fn precedence(&self) -> Precedence<'_> {
        Precedence::Timestamp(self.updated_at)
    }
}

impl Artifact for DraftArtifact {
    const KIND: DocumentKind = DocumentKind::Draft;

    fn app_id(&self) -> &str {
        &self.app_id
    }

    fn document_id(&self) -> &str {
        &self.draft_id
    }

    fn timestamp(&self) -> u64 {
        self.updated_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integrity {
    pub source_hash: String,
    pub compiler_version: String,
}

/// Output of compiling a draft. `runtime` is consumed by renderers and is
/// opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledArtifact {
    pub schema_version: String,
    pub compiled_id: String,
    pub draft_id: String,
    pub app_id: String,
    pub compiled_at: u64,
    #[serde(default)]
    pub css: String,
    pub runtime: Value,
    pub integrity: Integrity,
}

impl Versioned for CompiledArtifact {
    const COMPATIBLE_VERSIONS: &'static [&'static str] = &[COMPILED_SCHEMA_VERSION];

    fn schema_version(&self) -> &str {
        &self.schema_version
    }
}

impl Stamped for CompiledArtifact {
    fn precedence(&self) -> Precedence<'_> {
        Precedence::Timestamp(self.compiled_at)
    }
}

impl Artifact for CompiledArtifact {
    const KIND: DocumentKind = DocumentKind::Compiled;

    fn app_id(&self) -> &str {
        &self.app_id
    }

    fn document_id(&self) -> &str {
        &self.compiled_id
    }

    fn timestamp(&self) -> u64 {
        self.compiled_at
    }
}

/// Compile a draft into a single-column layout, one box node per element.
pub fn compile_draft(draft: &DraftArtifact, compiled_id: impl Into<String>, now: u64) -> CompiledArtifact {
    let ids: Vec<&String> = draft.elements.keys().collect();

    let nodes: Map<String, Value> = draft
        .elements
        .iter()
        .map(|(id, node)| {
            let styler = node
                .props
                .as_ref()
                .and_then(|p| p.styler.clone())
                .unwrap_or_default();
            (id.clone(), json!({ "type": "box", "props": { "styler": styler } }))
        })
        .collect();

    let areas: Vec<String> = if ids.is_empty() {
        vec!["\"root\"".to_string()]
    } else {
        ids.iter().map(|id| format!("\"{}\"", id)).collect()
    };
    let placements: Map<String, Value> = ids.iter().map(|id| ((*id).clone(), json!({}))).collect();

    let frame = json!({
        "grid": {
            "columns": "minmax(0, 1fr)",
            "rows": format!("repeat({}, auto)", ids.len().max(1)),
            "areas": areas,
        },
        "order": ids,
        "placements": placements,
    });

    let mut runtime = json!({
        "nodes": nodes,
        "layout": {
            "frames": { "desktop": frame.clone(), "tablet": frame.clone(), "mobile": frame },
        },
    });
    if let (Some(ghost_map), Some(obj)) = (&draft.ghost_map, runtime.as_object_mut()) {
        obj.insert("ghostMap".to_string(), ghost_map.clone());
    }

    CompiledArtifact {
        schema_version: COMPILED_SCHEMA_VERSION.to_string(),
        compiled_id: compiled_id.into(),
        draft_id: draft.draft_id.clone(),
        app_id: draft.app_id.clone(),
        compiled_at: now,
        css: String::new(),
        runtime,
        integrity: Integrity {
            source_hash: format!("{}:{}", draft.draft_id, draft.updated_at),
            compiler_version: LOCAL_COMPILER_VERSION.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::decode;

    fn draft_with_hero() -> DraftArtifact {
        let mut draft = DraftArtifact::new("app", "d1", 1_700);
        let mut styler = Map::new();
        styler.insert("color".into(), json!("red"));
        draft.elements.insert(
            "hero".into(),
            DraftNode {
                props: Some(DraftProps {
                    styler: Some(styler),
                    bindings: None,
                }),
            },
        );
        draft
    }

    #[test]
    fn test_artifact_keys() {
        let draft = DraftArtifact::new("app", "d1", 0);
        assert_eq!(draft.key().unwrap().path(), "/artifacts/app/public/data/drafts/d1");

        let compiled = compile_draft(&draft, "c1", 10);
        assert_eq!(compiled.key().unwrap().path(), "/compiled/c1");
    }

    #[test]
    fn test_compile_draft() {
        let compiled = compile_draft(&draft_with_hero(), "c1", 2_000);

        assert_eq!(compiled.draft_id, "d1");
        assert_eq!(compiled.compiled_at, 2_000);
        assert_eq!(compiled.integrity.source_hash, "d1:1700");
        assert_eq!(compiled.runtime["nodes"]["hero"]["props"]["styler"]["color"], json!("red"));
        assert_eq!(
            compiled.runtime["layout"]["frames"]["mobile"]["grid"]["areas"],
            json!(["\"hero\""])
        );
    }

    #[test]
    fn test_compile_empty_draft_uses_root_area() {
        let compiled = compile_draft(&DraftArtifact::new("app", "d2", 0), "c2", 1);
        let grid = &compiled.runtime["layout"]["frames"]["desktop"]["grid"];
        assert_eq!(grid["rows"], json!("repeat(1, auto)"));
        assert_eq!(grid["areas"], json!(["\"root\""]));
    }

    #[test]
    fn test_draft_schema_whitelist() {
        let mut value = serde_json::to_value(draft_with_hero()).unwrap();
        assert!(decode::<DraftArtifact>(&value).is_some());

        value["schemaVersion"] = json!("draft.v0");
        assert!(decode::<DraftArtifact>(&value).is_none());
    }
}
