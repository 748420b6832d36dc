//! Bus error types.

use thiserror::Error;

/// Errors raised by a broker implementation.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    /// The broker session is unusable (connection refused, dropped).
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed a command.
    #[error("broker command failed: {0}")]
    Command(String),
}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Command(err.to_string())
        }
    }
}

/// Errors surfaced by the bus.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    /// The initial session could not be established.
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The poll loop gave up after repeated broker failures.
    #[error("broker session lost: {0}")]
    SessionLost(String),

    /// The bus has been disconnected.
    #[error("bus is closed")]
    Closed,
}
