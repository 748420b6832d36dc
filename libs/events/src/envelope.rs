//! Envelope - the common wrapper for every bus message.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message;

use crate::EventError;

/// Stream entry field holding the encoded payload.
pub const DATA_FIELD: &str = "data";

/// Stream entry field holding the producer timestamp (RFC 3339).
pub const PRODUCED_AT_FIELD: &str = "produced_at";

/// A single bus message.
///
/// The payload is opaque bytes; its schema is fixed by the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Channel the message was published on (e.g. `action.request`).
    pub channel: String,

    /// Encoded payload.
    pub payload: Bytes,

    /// When the producer created the message.
    pub produced_at: DateTime<Utc>,
}

impl Envelope {
    /// Wraps an encoded payload produced now.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            produced_at: Utc::now(),
        }
    }

    /// Encodes `message` and wraps it for `channel`.
    pub fn encode<M: Message>(channel: impl Into<String>, message: &M) -> Self {
        Self::new(channel, message.encode_to_vec())
    }

    /// Decodes the payload as the channel's schema `M`.
    pub fn decode<M: Message + Default>(&self) -> Result<M, EventError> {
        M::decode(self.payload.clone()).map_err(|e| EventError::Decode {
            channel: self.channel.clone(),
            message: e.to_string(),
        })
    }

    /// Flattens the envelope into stream entry fields.
    pub fn to_fields(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            (DATA_FIELD, self.payload.to_vec()),
            (PRODUCED_AT_FIELD, self.produced_at.to_rfc3339().into_bytes()),
        ]
    }

    /// Rebuilds an envelope from stream entry fields.
    ///
    /// A missing or unparsable `produced_at` falls back to the current time;
    /// producers that predate the field only send `data`.
    pub fn from_fields<'a, I>(channel: &str, fields: I) -> Result<Self, EventError>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut payload = None;
        let mut produced_at = None;

        for (name, value) in fields {
            match name {
                DATA_FIELD => payload = Some(Bytes::copy_from_slice(value)),
                PRODUCED_AT_FIELD => {
                    produced_at = std::str::from_utf8(value)
                        .ok()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|ts| ts.with_timezone(&Utc));
                }
                _ => {}
            }
        }

        let payload = payload.ok_or_else(|| EventError::MissingField {
            channel: channel.to_string(),
            field: DATA_FIELD,
        })?;

        Ok(Self {
            channel: channel.to_string(),
            payload,
            produced_at: produced_at.unwrap_or_else(Utc::now),
        })
    }
}
