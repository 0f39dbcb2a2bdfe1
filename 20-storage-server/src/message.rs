use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const PREVIEW_LEN: usize = 50;

/// A single client request. The `action` field selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Get {
        table: String,
        name: String,
    },
    GetMulti {
        table: String,
        name: String,
        items: Vec<String>,
    },
    /// `data` may be any JSON value; see [`stored_text`].
    Set {
        table: String,
        name: String,
        data: Value,
    },
    SetMulti {
        table: String,
        name: String,
        data: BTreeMap<String, Value>,
    },
    Del {
        table: String,
        name: String,
    },
    Lock {
        table: String,
        name: String,
    },
    Unlock {
        table: String,
        name: String,
    },
    /// Produced locally for input that could not be decoded.
    Stop,
    #[serde(other)]
    Unknown,
}

impl Request {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Strict decode that fails closed: anything malformed becomes [`Request::Stop`].
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, payload = %preview(bytes), "could not decode request");
                Request::Stop
            }
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Request::Get { .. } => "get",
            Request::GetMulti { .. } => "get_multi",
            Request::Set { .. } => "set",
            Request::SetMulti { .. } => "set_multi",
            Request::Del { .. } => "del",
            Request::Lock { .. } => "lock",
            Request::Unlock { .. } => "unlock",
            Request::Stop => "stop",
            Request::Unknown => "unknown",
        }
    }
}

/// Result payload sent back for read-style actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Response {
    Text(String),
    List(Vec<String>),
}

impl Response {
    pub fn flag(value: bool) -> Self {
        Response::Text(if value { "true" } else { "false" }.to_string())
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Response::Text(text) if text == "true")
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Text kept in the store for a written value: strings verbatim, anything
/// else as compact JSON.
pub fn stored_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Short printable prefix of a payload for log lines.
pub fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).chars().take(PREVIEW_LEN).collect()
}
