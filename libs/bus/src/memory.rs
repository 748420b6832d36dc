//! In-process broker.
//!
//! Mirrors the Redis Streams semantics the bus relies on: capped streams,
//! consumer groups with a last-delivered id, per-consumer pending lists and
//! blocking reads. Entry ids are `<seq>-0` with `seq` starting at 1.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bravebird_events::Envelope;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{Broker, EntryId, ReadCursor, StartPosition, StreamEntry};
use crate::BrokerError;

#[derive(Default)]
struct Group {
    last_delivered: u64,
    /// Delivered but unacknowledged: seq -> consumer.
    pending: BTreeMap<u64, String>,
}

#[derive(Default)]
struct Stream {
    entries: VecDeque<(u64, Envelope)>,
    last_seq: u64,
    groups: HashMap<String, Group>,
}

/// Broker kept entirely in memory.
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    connected: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Makes every subsequent operation fail with a connection error.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.appended.notify_waiters();
    }

    /// Restores a broker after [`MemoryBroker::disconnect`].
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Number of retained entries in a stream.
    pub fn len(&self, channel: &str) -> usize {
        self.lock()
            .get(channel)
            .map(|stream| stream.entries.len())
            .unwrap_or(0)
    }

    /// Whether the stream is missing or empty.
    pub fn is_empty(&self, channel: &str) -> bool {
        self.len(channel) == 0
    }

    /// Number of unacknowledged entries for a group.
    pub fn pending_count(&self, channel: &str, group: &str) -> usize {
        self.lock()
            .get(channel)
            .and_then(|stream| stream.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection("memory broker disconnected".to_string()))
        }
    }

    fn read_once(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, ReadCursor)],
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut state = self.lock();
        let mut out = Vec::new();

        for (channel, cursor) in streams {
            let stream = state.get_mut(channel).ok_or_else(|| no_group(channel, group))?;
            let Stream {
                entries, groups, ..
            } = stream;
            let grp = groups.get_mut(group).ok_or_else(|| no_group(channel, group))?;

            match cursor {
                ReadCursor::New => {
                    let fresh: Vec<(u64, Envelope)> = entries
                        .iter()
                        .filter(|(seq, _)| *seq > grp.last_delivered)
                        .take(count)
                        .cloned()
                        .collect();
                    for (seq, envelope) in fresh {
                        grp.last_delivered = seq;
                        grp.pending.insert(seq, consumer.to_string());
                        out.push(StreamEntry {
                            channel: channel.clone(),
                            id: format_id(seq),
                            envelope: Some(envelope),
                        });
                    }
                }
                ReadCursor::PendingAfter(after) => {
                    let after = parse_id(after)?;
                    let owned: Vec<u64> = grp
                        .pending
                        .range(after + 1..)
                        .filter(|(_, owner)| owner.as_str() == consumer)
                        .map(|(seq, _)| *seq)
                        .take(count)
                        .collect();
                    for seq in owned {
                        let envelope = lookup(entries, seq);
                        out.push(StreamEntry {
                            channel: channel.clone(),
                            id: format_id(seq),
                            envelope,
                        });
                    }
                }
            }
        }

        Ok(out)
    }
}

fn lookup(entries: &VecDeque<(u64, Envelope)>, seq: u64) -> Option<Envelope> {
    entries
        .iter()
        .find(|(s, _)| *s == seq)
        .map(|(_, envelope)| envelope.clone())
}

fn format_id(seq: u64) -> EntryId {
    EntryId(format!("{seq}-0"))
}

fn parse_id(id: &EntryId) -> Result<u64, BrokerError> {
    let ms = id.as_str().split('-').next().unwrap_or_default();
    ms.parse()
        .map_err(|_| BrokerError::Command(format!("invalid stream id: {id}")))
}

fn no_group(channel: &str, group: &str) -> BrokerError {
    BrokerError::Command(format!("NOGROUP no such group '{group}' for stream '{channel}'"))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check_connected()
    }

    async fn append(
        &self,
        channel: &str,
        envelope: &Envelope,
        maxlen: usize,
    ) -> Result<EntryId, BrokerError> {
        self.check_connected()?;
        let id = {
            let mut state = self.lock();
            let stream = state.entry(channel.to_string()).or_default();
            stream.last_seq += 1;
            let seq = stream.last_seq;
            stream.entries.push_back((seq, envelope.clone()));
            while stream.entries.len() > maxlen {
                stream.entries.pop_front();
            }
            format_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        channel: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BrokerError> {
        self.check_connected()?;
        let mut state = self.lock();
        let stream = state.entry(channel.to_string()).or_default();
        let last_delivered = match start {
            StartPosition::Latest => stream.last_seq,
            StartPosition::Earliest => 0,
        };
        stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| Group {
                last_delivered,
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, ReadCursor)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let blocking = streams.iter().all(|(_, c)| *c == ReadCursor::New);
        let deadline = Instant::now() + block;

        loop {
            // Registered before the read so an append in between still wakes us.
            let appended = self.appended.notified();
            self.check_connected()?;

            let entries = self.read_once(group, consumer, streams, count)?;
            if !entries.is_empty() || !blocking || Instant::now() >= deadline {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, channel: &str, group: &str, ids: &[EntryId]) -> Result<(), BrokerError> {
        self.check_connected()?;
        let mut state = self.lock();
        if let Some(grp) = state
            .get_mut(channel)
            .and_then(|stream| stream.groups.get_mut(group))
        {
            for id in ids {
                grp.pending.remove(&parse_id(id)?);
            }
        }
        Ok(())
    }

    async fn range(&self, channel: &str, count: usize) -> Result<Vec<StreamEntry>, BrokerError> {
        self.check_connected()?;
        let state = self.lock();
        Ok(state
            .get(channel)
            .map(|stream| {
                stream
                    .entries
                    .iter()
                    .take(count)
                    .map(|(seq, envelope)| StreamEntry {
                        channel: channel.to_string(),
                        id: format_id(*seq),
                        envelope: Some(envelope.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
