//! Redis Streams broker.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bravebird_events::Envelope;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use tracing::{debug, warn};

use crate::broker::{Broker, EntryId, ReadCursor, StartPosition, StreamEntry};
use crate::BrokerError;

/// Connection settings for [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    /// `redis://` URL for this configuration.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Broker backed by Redis Streams.
///
/// Holds two managed connections: blocking group reads go over their own
/// connection so they never delay publishes and acks.
pub struct RedisBroker {
    commands: ConnectionManager,
    reads: ConnectionManager,
}

impl RedisBroker {
    /// Opens both connections. Fails if the server is unreachable.
    pub async fn connect(config: &RedisConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url())?;
        let commands = ConnectionManager::new(client.clone()).await?;
        let reads = ConnectionManager::new(client).await?;

        debug!(host = %config.host, port = config.port, db = config.db, "connected to redis");
        Ok(Self { commands, reads })
    }

    fn to_entry(channel: &str, stream_id: StreamId) -> StreamEntry {
        let fields: Vec<(String, Vec<u8>)> = stream_id
            .map
            .into_iter()
            .filter_map(|(name, value)| field_bytes(&value).map(|bytes| (name, bytes)))
            .collect();

        let envelope = if fields.is_empty() {
            None
        } else {
            match Envelope::from_fields(
                channel,
                fields.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
            ) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(channel = %channel, id = %stream_id.id, error = %e, "malformed stream entry");
                    None
                }
            }
        };

        StreamEntry {
            channel: channel.to_string(),
            id: EntryId(stream_id.id),
            envelope,
        }
    }
}

fn field_bytes(value: &Value) -> Option<Vec<u8>> {
    redis::from_redis_value::<Vec<u8>>(value).ok()
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn append(
        &self,
        channel: &str,
        envelope: &Envelope,
        maxlen: usize,
    ) -> Result<EntryId, BrokerError> {
        let mut conn = self.commands.clone();
        let id: String = conn
            .xadd_maxlen(channel, StreamMaxlen::Equals(maxlen), "*", &envelope.to_fields())
            .await?;
        Ok(EntryId(id))
    }

    async fn ensure_group(
        &self,
        channel: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let id = match start {
            StartPosition::Latest => "$",
            StartPosition::Earliest => "0",
        };

        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(channel, group, id).await;
        match created {
            Ok(()) => {
                debug!(channel = %channel, group = %group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, ReadCursor)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<&str> = streams.iter().map(|(channel, _)| channel.as_str()).collect();
        let ids: Vec<String> = streams
            .iter()
            .map(|(_, cursor)| match cursor {
                ReadCursor::New => ">".to_string(),
                ReadCursor::PendingAfter(after) => after.0.clone(),
            })
            .collect();

        let mut options = StreamReadOptions::default().group(group, consumer).count(count);
        // BLOCK 0 waits forever, and pending reads return immediately anyway.
        let blocking = streams.iter().all(|(_, c)| *c == ReadCursor::New);
        if blocking && !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let mut conn = self.reads.clone();
        let reply: Option<StreamReadReply> = conn.xread_options(&keys, &ids, &options).await?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for stream_id in key.ids {
                entries.push(Self::to_entry(&key.key, stream_id));
            }
        }
        Ok(entries)
    }

    async fn ack(&self, channel: &str, group: &str, ids: &[EntryId]) -> Result<(), BrokerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = ids.iter().map(EntryId::as_str).collect();
        let mut conn = self.commands.clone();
        let _: i64 = conn.xack(channel, group, &ids).await?;
        Ok(())
    }

    async fn range(&self, channel: &str, count: usize) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.commands.clone();
        let reply: StreamRangeReply = conn.xrange_count(channel, "-", "+", count).await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|stream_id| Self::to_entry(channel, stream_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_without_password() {
        let config = RedisConfig::default();
        assert_eq!(config.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_url_with_password() {
        let config = RedisConfig {
            host: "broker".to_string(),
            port: 6380,
            db: 2,
            password: Some("secret".to_string()),
        };
        assert_eq!(config.url(), "redis://:secret@broker:6380/2");
    }

    #[test]
    fn test_to_entry_without_fields_has_no_envelope() {
        let stream_id = StreamId {
            id: "1-0".to_string(),
            map: HashMap::new(),
        };
        let entry = RedisBroker::to_entry("action.request", stream_id);
        assert_eq!(entry.id, EntryId("1-0".to_string()));
        assert!(entry.envelope.is_none());
    }

    #[test]
    fn test_to_entry_parses_fields() {
        let mut map = HashMap::new();
        map.insert("data".to_string(), Value::BulkString(vec![1, 2, 3]));
        let stream_id = StreamId {
            id: "5-1".to_string(),
            map,
        };
        let entry = RedisBroker::to_entry("action.request", stream_id);
        let envelope = entry.envelope.unwrap();
        assert_eq!(envelope.payload.as_ref(), &[1, 2, 3]);
        assert_eq!(envelope.channel, "action.request");
    }
}
