//! # bravebird-bus
//!
//! Cross-process publish/subscribe with stream semantics.
//!
//! ## Delivery Model
//!
//! - Each channel is an append-only stream capped at `maxlen` entries; when
//!   full the broker drops the oldest entries
//! - Subscribing to a channel creates a consumer group, i.e. a durable read
//!   position shared across restarts
//! - A background poll loop blocks for at most `block` waiting for entries on
//!   every subscribed channel and hands them to one dispatcher per channel
//! - A dispatcher decodes each entry with the channel's schema, runs the
//!   handlers in publish order, and acknowledges the entry only when every
//!   handler succeeded
//! - Unacknowledged entries are redelivered when a consumer restarts
//!   (at-least-once); handlers must tolerate duplicates
//!
//! ```text
//! publish ──XADD MAXLEN──▶ stream ──XREADGROUP──▶ poll loop ──▶ dispatcher(channel) ──▶ handlers
//!                                                                      │
//!                                                                      └──XACK (all Ok)
//! ```
//!
//! ## Brokers
//!
//! - [`RedisBroker`]: Redis Streams, used across processes
//! - [`MemoryBroker`]: in-process broker with the same semantics, used by
//!   tests and single-process runs

mod backoff;
mod broker;
mod bus;
mod error;
mod memory;
mod redis_broker;

pub use backoff::BackoffPolicy;
pub use broker::{Broker, EntryId, ReadCursor, StartPosition, StreamEntry};
pub use bus::{Bus, BusConfig, BusStatus};
pub use error::{BrokerError, BusError};
pub use memory::MemoryBroker;
pub use redis_broker::{RedisBroker, RedisConfig};
