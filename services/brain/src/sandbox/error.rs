//! Sandbox error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SandboxError {
    /// An operation needs a started sandbox.
    #[error("sandbox not started")]
    NotStarted,

    /// The backend cannot perform this operation at all.
    #[error("{op} is not supported by the {backend} sandbox")]
    Unsupported {
        backend: &'static str,
        op: &'static str,
    },

    /// The backend did not answer in time.
    #[error("{op} timed out after {}s", .after.as_secs_f64())]
    Timeout { op: &'static str, after: Duration },

    /// The backend never became ready.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    /// Transport failure talking to the backend.
    #[error("{op} request failed: {message}")]
    Http { op: &'static str, message: String },

    /// The backend answered with an error.
    #[error("{op} rejected by backend ({status}): {message}")]
    Backend {
        op: &'static str,
        status: u16,
        message: String,
    },

    /// The backend answered with something we could not interpret.
    #[error("{op} returned an invalid response: {message}")]
    InvalidResponse { op: &'static str, message: String },

    /// A command ran but failed.
    #[error("command failed with exit code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// The snapshot was taken on a different sandbox instance.
    #[error("snapshot {snapshot} does not belong to this sandbox")]
    ForeignSnapshot { snapshot: String },

    /// The request cannot be executed as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SandboxError {
    /// Maps a transport error, distinguishing timeouts.
    pub(crate) fn from_reqwest(op: &'static str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SandboxError::Timeout { op, after: timeout }
        } else if err.is_decode() {
            SandboxError::InvalidResponse {
                op,
                message: err.to_string(),
            }
        } else {
            SandboxError::Http {
                op,
                message: err.to_string(),
            }
        }
    }
}
