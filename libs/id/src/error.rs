//! ID parse errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("empty id")]
    Empty,

    /// Missing `_`, or a prefix that belongs to another kind of id.
    #[error("'{id}' is not a {expected}_ id")]
    WrongKind { expected: &'static str, id: String },

    #[error("invalid ULID in id: {0}")]
    InvalidUlid(String),
}
