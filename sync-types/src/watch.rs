//! Watch requests and events.
//!
//! A watch stream is a sequence of newline-delimited JSON [`WatchEvent`]s.
//! The stream ends after a `close` or `error` event.

use serde::{Deserialize, Serialize};

use crate::{ApiError, Revision, TypesError};

/// Content type of a watch response body.
pub const WATCH_CONTENT_TYPE: &str = "application/json;stream=watch";

/// A request to watch one resource kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Watch {
    /// Resource kind to watch (`device`, `security-group`, ...).
    pub kind: String,
    /// Last revision the client has already seen (0 = from the beginning).
    #[serde(default)]
    pub gt_revision: Revision,
    /// Whether the client already reached the live tail.
    #[serde(default)]
    pub at_tail: bool,
    /// Kind specific filter options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Watch {
    /// Watch a kind from the beginning.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Resume after the given revision.
    pub fn after(mut self, revision: Revision) -> Self {
        self.gt_revision = revision;
        self
    }

    /// Read string-list option values (e.g. `prefixes`).
    ///
    /// A single string is accepted in place of a list.
    pub fn string_list_option(&self, name: &str) -> Result<Vec<String>, TypesError> {
        let Some(value) = self.options.as_ref().and_then(|o| o.get(name)) else {
            return Ok(Vec::new());
        };
        match value {
            serde_json::Value::Null => Ok(Vec::new()),
            serde_json::Value::String(s) => Ok(vec![s.clone()]),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| TypesError::InvalidOption(name.to_string()))
                })
                .collect(),
            _ => Err(TypesError::InvalidOption(name.to_string())),
        }
    }
}

/// Type of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A resource was created or updated.
    Change,
    /// A resource was soft deleted.
    Delete,
    /// The initial list is complete; the client reached the live tail.
    Tail,
    /// Everything up to the carried revision was delivered.
    Bookmark,
    /// The stream failed; reconnect and resume from the last revision.
    Error,
    /// The stream ended normally.
    Close,
}

impl EventType {
    /// Whether events of this type end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Close)
    }

    /// Whether events of this type mark the live tail.
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Tail | Self::Bookmark)
    }
}

/// One event of a watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// The watched kind this event belongs to (empty for stream-level events).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event payload: the resource, marker revision, or error body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl WatchEvent {
    /// A `change` event for the given kind.
    pub fn change(kind: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            event_type: EventType::Change,
            value: Some(value),
        }
    }

    /// A `delete` event for the given kind.
    pub fn delete(kind: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            event_type: EventType::Delete,
            value: Some(value),
        }
    }

    /// A `tail` or `bookmark` marker carrying the revision reached.
    pub fn marker(kind: impl Into<String>, event_type: EventType, revision: Revision) -> Self {
        Self {
            kind: kind.into(),
            event_type,
            value: Some(serde_json::json!({ "revision": revision })),
        }
    }

    /// A terminal `error` event.
    pub fn error(message: impl Into<String>) -> Self {
        let body = ApiError::new(message);
        Self {
            kind: String::new(),
            event_type: EventType::Error,
            value: serde_json::to_value(body).ok(),
        }
    }

    /// A terminal `close` event.
    pub fn close() -> Self {
        Self {
            kind: String::new(),
            event_type: EventType::Close,
            value: None,
        }
    }

    /// Revision carried by a marker event.
    pub fn marker_revision(&self) -> Option<Revision> {
        if !self.event_type.is_marker() {
            return None;
        }
        self.value
            .as_ref()
            .and_then(|v| v.get("revision"))
            .and_then(|r| r.as_u64())
            .map(Revision::new)
    }

    /// Error message carried by an `error` event.
    pub fn error_message(&self) -> Option<String> {
        if self.event_type != EventType::Error {
            return None;
        }
        self.value
            .clone()
            .and_then(|v| serde_json::from_value::<ApiError>(v).ok())
            .map(|e| e.error)
    }

    /// Encode as one line of a watch stream (JSON followed by `\n`).
    pub fn to_line(&self) -> Result<Vec<u8>, TypesError> {
        let mut bytes = serde_json::to_vec(self).map_err(TypesError::Encode)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Decode one line of a watch stream.
    pub fn from_line(line: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(line).map_err(TypesError::Decode)
    }
}
