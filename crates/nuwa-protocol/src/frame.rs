//! Request and response frames

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Request {
    /// Read the document stored under `key`
    Get { id: u64, key: String },

    /// Replace the document stored under `key`
    Set { id: u64, key: String, value: Value },

    /// Receive a `changed` frame for every later write to `key`
    Watch { id: u64, key: String },

    Ping { id: u64 },
}

impl Request {
    pub fn get(id: u64, key: impl Into<String>) -> Self {
        Request::Get { id, key: key.into() }
    }

    pub fn set(id: u64, key: impl Into<String>, value: Value) -> Self {
        Request::Set {
            id,
            key: key.into(),
            value,
        }
    }

    pub fn watch(id: u64, key: impl Into<String>) -> Self {
        Request::Watch { id, key: key.into() }
    }

    pub fn ping(id: u64) -> Self {
        Request::Ping { id }
    }

    /// Correlation id echoed back in the response
    pub fn id(&self) -> u64 {
        match self {
            Request::Get { id, .. }
            | Request::Set { id, .. }
            | Request::Watch { id, .. }
            | Request::Ping { id } => *id,
        }
    }

    /// Document key, if the request addresses one
    pub fn key(&self) -> Option<&str> {
        match self {
            Request::Get { key, .. } | Request::Set { key, .. } | Request::Watch { key, .. } => {
                Some(key)
            }
            Request::Ping { .. } => None,
        }
    }
}

/// Error codes carried by `error` frames
pub struct ErrorCode;

impl ErrorCode {
    pub const BAD_REQUEST: &'static str = "BAD_REQUEST";
    pub const TOO_LARGE: &'static str = "TOO_LARGE";
    pub const STORE: &'static str = "STORE_ERROR";
}

/// A server frame: either the reply to a request or a pushed change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Response {
    Ok { id: u64 },

    Document {
        id: u64,
        key: String,
        exists: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },

    Pong { id: u64 },

    Error {
        /// Absent when the request could not be parsed far enough to read it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: String,
        message: String,
    },

    /// Pushed to watchers of `key`
    Changed { key: String, value: Value },
}

impl Response {
    pub fn ok(id: u64) -> Self {
        Response::Ok { id }
    }

    pub fn document(id: u64, key: impl Into<String>, value: Option<Value>) -> Self {
        Response::Document {
            id,
            key: key.into(),
            exists: value.is_some(),
            value,
        }
    }

    pub fn pong(id: u64) -> Self {
        Response::Pong { id }
    }

    pub fn error(id: Option<u64>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            id,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn changed(key: impl Into<String>, value: Value) -> Self {
        Response::Changed {
            key: key.into(),
            value,
        }
    }

    /// Id of the request this frame answers; `None` for pushed changes
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Response::Ok { id } | Response::Pong { id } | Response::Document { id, .. } => {
                Some(*id)
            }
            Response::Error { id, .. } => *id,
            Response::Changed { .. } => None,
        }
    }
}
