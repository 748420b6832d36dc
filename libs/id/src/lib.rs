//! # bravebird-id
//!
//! Typed identifiers used across the bus, the actors and the sandboxes.
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`, for example
//! `act_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix keeps action, request and
//! sandbox identifiers from being mixed up when they travel as plain strings
//! inside bus payloads, and the ULID keeps them time-ordered.
//!
//! Identifiers minted by other systems (snapshot ids returned by a sandbox
//! backend, workflow ids from the synthesizer) stay opaque strings and are not
//! modelled here.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
