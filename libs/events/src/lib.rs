//! # bravebird-events
//!
//! Channel names, the bus envelope, and the payload schemas carried on the
//! event bus.
//!
//! ## Design Principles
//!
//! - Every channel carries exactly one payload type; the envelope is not
//!   self-describing, so a subscriber names the schema it expects
//! - Payloads are protobuf messages (compact, forward compatible)
//! - Heavy data (video pixels) never travels on the bus; only pointers to
//!   the shared-memory region do
//!
//! ## Channels
//!
//! - Input sensors (`input.*`)
//! - Video notifications (`video.*`)
//! - Perception requests/results (`perception.*`)
//! - Cognition inputs (`cognition.*`)
//! - Action requests/results (`action.*`)

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
