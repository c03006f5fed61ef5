//! Error types for the watch protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur encoding or decoding protocol values.
#[derive(Debug, Error)]
pub enum TypesError {
    /// JSON encoding failed
    #[error("encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding failed
    #[error("decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// A watch option had an unexpected shape
    #[error("invalid watch option: {0}")]
    InvalidOption(String),
}

/// JSON error body returned by the API and carried by `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Human readable error message.
    pub error: String,
    /// The offending field, for validation errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ApiError {
    /// Create an error body with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            field: None,
        }
    }

    /// Create a validation error body for a field.
    pub fn invalid_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            error: format!("invalid field: {field}"),
            field: Some(field),
        }
    }
}
