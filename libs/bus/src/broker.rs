//! Broker interface.
//!
//! A broker stores capped, append-only streams and tracks per-group read
//! positions and unacknowledged (pending) entries. The bus only talks to the
//! broker through this trait.

use std::time::Duration;

use async_trait::async_trait;
use bravebird_events::Envelope;

use crate::BrokerError;

/// Broker-assigned entry identifier (`<millis>-<seq>` for Redis).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub String);

impl EntryId {
    /// The id that sorts before every real entry.
    pub fn zero() -> Self {
        Self("0-0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only entries appended after the group is created.
    #[default]
    Latest,
    /// Everything still retained in the stream.
    Earliest,
}

/// What a group read returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to the group.
    New,
    /// Entries already delivered to this consumer but not acknowledged, with
    /// ids greater than the given id.
    PendingAfter(EntryId),
}

/// One entry read from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub channel: String,
    pub id: EntryId,
    /// `None` when the entry was trimmed away while still pending, or when
    /// its fields could not be parsed.
    pub envelope: Option<Envelope>,
}

/// Stream broker operations used by the bus.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Checks that the session is alive.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Appends an entry, evicting the oldest entries beyond `maxlen`.
    async fn append(
        &self,
        channel: &str,
        envelope: &Envelope,
        maxlen: usize,
    ) -> Result<EntryId, BrokerError>;

    /// Creates the consumer group if it does not exist yet.
    async fn ensure_group(
        &self,
        channel: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BrokerError>;

    /// Reads up to `count` entries per channel for `consumer`.
    ///
    /// Blocks for at most `block` when every cursor is [`ReadCursor::New`] and
    /// nothing is available; pending reads never block.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, ReadCursor)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Acknowledges entries, removing them from the pending list.
    async fn ack(&self, channel: &str, group: &str, ids: &[EntryId]) -> Result<(), BrokerError>;

    /// Reads the oldest `count` retained entries, independent of any group.
    async fn range(&self, channel: &str, count: usize) -> Result<Vec<StreamEntry>, BrokerError>;
}
