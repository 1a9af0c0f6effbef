//! Schema versions and the compatibility whitelist
//!
//! Every persisted or wire payload carries a `schemaVersion` string. Only
//! versions on a type's whitelist are decoded; anything else is treated as
//! absent so the caller keeps its previous state.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

pub const SESSION_SCHEMA_VERSION: &str = "global-session.v1";
pub const DRAFT_SCHEMA_VERSION: &str = "draft.v1";
pub const COMPILED_SCHEMA_VERSION: &str = "compiled.v1";

/// A payload type carrying a `schemaVersion` field
pub trait Versioned {
    /// Versions this build can read
    const COMPATIBLE_VERSIONS: &'static [&'static str];

    fn schema_version(&self) -> &str;

    fn is_compatible(&self) -> bool {
        Self::COMPATIBLE_VERSIONS.contains(&self.schema_version())
    }
}

/// Decode a JSON value, returning `None` for unknown versions or malformed data
pub fn decode<T>(value: &Value) -> Option<T>
where
    T: Versioned + DeserializeOwned,
{
    let version = value.get("schemaVersion").and_then(Value::as_str)?;
    if !T::COMPATIBLE_VERSIONS.contains(&version) {
        debug!(version, "Ignoring payload with incompatible schema version");
        return None;
    }

    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!(error = %e, "Ignoring malformed payload");
            None
        }
    }
}

/// Decode a serialized payload
pub fn decode_str<T>(raw: &str) -> Option<T>
where
    T: Versioned + DeserializeOwned,
{
    let value: Value = serde_json::from_str(raw).ok()?;
    decode(&value)
}
