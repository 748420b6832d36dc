//! Error types for envelope handling.

use thiserror::Error;

/// Errors that can occur when decoding bus payloads.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The payload does not match the channel's schema.
    #[error("failed to decode payload on {channel}: {message}")]
    Decode { channel: String, message: String },

    /// A broker entry is missing a required field.
    #[error("entry on {channel} is missing field '{field}'")]
    MissingField {
        channel: String,
        field: &'static str,
    },

    /// The action type string is not one the sandboxes understand.
    #[error("unknown action type: {0}")]
    UnknownActionType(String),
}
