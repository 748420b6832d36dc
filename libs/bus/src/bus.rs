//! The bus: publishing, typed subscriptions, and the poll loop.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bravebird_events::{channels, Envelope};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use prost::Message;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, EntryId, ReadCursor, StartPosition, StreamEntry};
use crate::BusError;

type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Consumer group shared by every subscription of this process.
    pub group: String,

    /// Consumer name within the group. Must be stable across restarts for
    /// pending entries to be redelivered to it.
    pub consumer: String,

    /// Maximum entries read per channel per poll.
    pub batch_size: usize,

    /// How long one poll blocks waiting for new entries.
    pub block: Duration,

    /// Stream cap applied on every publish.
    pub maxlen: usize,

    /// Where a newly created consumer group starts.
    pub start: StartPosition,

    /// Entries buffered per channel between the poll loop and its dispatcher.
    pub dispatch_buffer: usize,

    /// Retry delays after broker errors in the poll loop.
    pub backoff: BackoffPolicy,

    /// Consecutive poll failures after which the session is declared lost.
    pub max_consecutive_failures: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            group: "brain_workers".to_string(),
            consumer: "worker_1".to_string(),
            batch_size: 10,
            block: Duration::from_millis(100),
            maxlen: 2000,
            start: StartPosition::Latest,
            dispatch_buffer: 256,
            backoff: BackoffPolicy::default(),
            max_consecutive_failures: 5,
        }
    }
}

/// Session state reported by [`Bus::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusStatus {
    Connected,
    /// Stopped by [`Bus::disconnect`].
    Closed,
    /// The poll loop gave up; carries the last broker error.
    Lost(String),
}

// =============================================================================
// Bus
// =============================================================================

struct ChannelSubscription {
    handlers: Arc<RwLock<Vec<Handler>>>,
    tx: mpsc::Sender<StreamEntry>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: BusConfig,
    subscriptions: RwLock<HashMap<String, ChannelSubscription>>,
    subscriptions_changed: Notify,
    cancel: CancellationToken,
    tasks: TaskTracker,
    status: watch::Sender<BusStatus>,
}

/// Handle to the event bus. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Establishes the broker session and starts the poll loop.
    ///
    /// Fails immediately if the broker is unreachable.
    pub async fn connect(broker: Arc<dyn Broker>, config: BusConfig) -> Result<Self, BusError> {
        broker
            .ping()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let (status, _) = watch::channel(BusStatus::Connected);
        let inner = Arc::new(Inner {
            broker,
            config,
            subscriptions: RwLock::new(HashMap::new()),
            subscriptions_changed: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            status,
        });

        inner.tasks.spawn(poll_loop(inner.clone()));

        info!(
            group = %inner.config.group,
            consumer = %inner.config.consumer,
            "event bus connected"
        );
        Ok(Self { inner })
    }

    /// Publishes a message, logging instead of returning any failure.
    pub async fn publish<M: Message>(&self, channel: &str, message: &M) {
        if let Err(e) = self.try_publish(channel, message).await {
            error!(channel = %channel, error = %e, "failed to publish");
        }
    }

    /// Publishes a message and returns the broker-assigned entry id.
    pub async fn try_publish<M: Message>(
        &self,
        channel: &str,
        message: &M,
    ) -> Result<EntryId, BusError> {
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let envelope = Envelope::encode(channel, message);
        let id = self
            .inner
            .broker
            .append(channel, &envelope, self.inner.config.maxlen)
            .await?;

        if !channels::is_high_frequency(channel) {
            debug!(channel = %channel, id = %id, "published");
        }
        Ok(id)
    }

    /// Registers a handler for `channel`, decoding payloads as `T`.
    ///
    /// The first subscription to a channel creates the consumer group and
    /// that channel's dispatcher. Handlers on one channel run one at a time,
    /// in publish order; an entry is acknowledged only when every handler
    /// on the channel returned `Ok`.
    pub async fn subscribe<T, F, Fut>(&self, channel: &str, handler: F) -> Result<(), BusError>
    where
        T: Message + Default + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::Closed);
        }

        let handler: Handler = Arc::new(move |envelope: Envelope| match envelope.decode::<T>() {
            Ok(message) => handler(message).boxed(),
            Err(e) => async move { Err::<(), _>(anyhow::Error::new(e)) }.boxed(),
        });

        self.inner
            .broker
            .ensure_group(channel, &self.inner.config.group, self.inner.config.start)
            .await?;

        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = subscriptions.get(channel) {
            existing
                .handlers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push(handler);
            return Ok(());
        }

        let handlers = Arc::new(RwLock::new(vec![handler]));
        let (tx, rx) = mpsc::channel(self.inner.config.dispatch_buffer.max(1));
        self.inner.tasks.spawn(dispatch_loop(
            self.inner.clone(),
            channel.to_string(),
            handlers.clone(),
            rx,
        ));
        subscriptions.insert(channel.to_string(), ChannelSubscription { handlers, tx });
        drop(subscriptions);

        self.inner.subscriptions_changed.notify_one();
        info!(channel = %channel, "subscribed");
        Ok(())
    }

    /// Reads up to `count` of the oldest retained messages on `channel`,
    /// independent of any consumer group.
    pub async fn replay(&self, channel: &str, count: usize) -> Result<Vec<Envelope>, BusError> {
        let entries = self.inner.broker.range(channel, count).await?;
        Ok(entries.into_iter().filter_map(|e| e.envelope).collect())
    }

    /// Current session state.
    pub fn status(&self) -> BusStatus {
        self.inner.status.borrow().clone()
    }

    /// Resolves once the bus stops, with the reason.
    pub async fn closed(&self) -> BusError {
        let mut rx = self.inner.status.subscribe();
        let status = match rx.wait_for(|s| *s != BusStatus::Connected).await {
            Ok(status) => status.clone(),
            Err(_) => BusStatus::Closed,
        };
        match status {
            BusStatus::Lost(reason) => BusError::SessionLost(reason),
            _ => BusError::Closed,
        }
    }

    /// Stops the poll loop and every dispatcher.
    ///
    /// Entries handed to a dispatcher but not yet handled stay pending and
    /// are redelivered on the next start.
    pub async fn disconnect(&self) {
        self.inner.status.send_if_modified(|status| {
            if *status == BusStatus::Connected {
                *status = BusStatus::Closed;
                true
            } else {
                false
            }
        });
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("event bus disconnected");
    }
}

// =============================================================================
// Poll Loop
// =============================================================================

async fn poll_loop(inner: Arc<Inner>) {
    let config = &inner.config;
    // Channels still draining their pending list, with the last id seen.
    let mut draining: HashMap<String, EntryId> = HashMap::new();
    let mut known: Vec<String> = Vec::new();
    let mut failures: u32 = 0;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let subscribed: Vec<String> = inner
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        for channel in &subscribed {
            if !known.contains(channel) {
                known.push(channel.clone());
                draining.insert(channel.clone(), EntryId::zero());
            }
        }

        if subscribed.is_empty() {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.subscriptions_changed.notified() => continue,
            }
        }

        let draining_pending = !draining.is_empty();
        let streams: Vec<(String, ReadCursor)> = if draining_pending {
            draining
                .iter()
                .map(|(channel, after)| (channel.clone(), ReadCursor::PendingAfter(after.clone())))
                .collect()
        } else {
            subscribed
                .iter()
                .map(|channel| (channel.clone(), ReadCursor::New))
                .collect()
        };

        let read = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            read = inner.broker.read_group(
                &config.group,
                &config.consumer,
                &streams,
                config.batch_size,
                config.block,
            ) => read,
        };

        let entries = match read {
            Ok(entries) => {
                if failures > 0 {
                    info!(attempts = failures, "broker session recovered");
                }
                failures = 0;
                entries
            }
            Err(e) => {
                failures += 1;
                if failures >= config.max_consecutive_failures {
                    error!(error = %e, attempts = failures, "broker session lost");
                    inner.status.send_replace(BusStatus::Lost(e.to_string()));
                    inner.cancel.cancel();
                    break;
                }

                let delay = config.backoff.delay(failures - 1);
                warn!(error = %e, attempt = failures, delay_ms = delay.as_millis() as u64, "poll failed, retrying");
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if draining_pending {
            let mut seen: HashMap<&str, EntryId> = HashMap::new();
            for entry in &entries {
                seen.insert(entry.channel.as_str(), entry.id.clone());
            }
            draining.retain(|channel, after| match seen.get(channel.as_str()) {
                Some(last) => {
                    *after = last.clone();
                    true
                }
                None => false,
            });
            if !entries.is_empty() {
                info!(count = entries.len(), "redelivering pending entries");
            }
        }

        if !dispatch(&inner, entries).await {
            break;
        }
    }

    debug!("poll loop stopped");
}

/// Hands entries to their channel dispatchers. Returns false once cancelled.
async fn dispatch(inner: &Inner, entries: Vec<StreamEntry>) -> bool {
    for entry in entries {
        let tx = inner
            .subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&entry.channel)
            .map(|sub| sub.tx.clone());

        let Some(tx) = tx else {
            warn!(channel = %entry.channel, "entry for unknown channel");
            continue;
        };

        tokio::select! {
            _ = inner.cancel.cancelled() => return false,
            sent = tx.send(entry) => {
                if sent.is_err() {
                    return false;
                }
            }
        }
    }
    true
}

// =============================================================================
// Dispatcher
// =============================================================================

async fn dispatch_loop(
    inner: Arc<Inner>,
    channel: String,
    handlers: Arc<RwLock<Vec<Handler>>>,
    mut rx: mpsc::Receiver<StreamEntry>,
) {
    let quiet = channels::is_high_frequency(&channel);

    loop {
        let entry = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        let Some(envelope) = entry.envelope else {
            // Trimmed while pending; nothing left to deliver.
            warn!(channel = %channel, id = %entry.id, "dropping evicted pending entry");
            ack(&inner, &channel, entry.id).await;
            continue;
        };

        let current: Vec<Handler> = handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut all_ok = true;
        for handler in current {
            let outcome = AssertUnwindSafe(handler(envelope.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    all_ok = false;
                    error!(channel = %channel, id = %entry.id, error = %e, "handler failed");
                }
                Err(_) => {
                    all_ok = false;
                    error!(channel = %channel, id = %entry.id, "handler panicked");
                }
            }
        }

        if all_ok {
            ack(&inner, &channel, entry.id).await;
        } else if !quiet {
            debug!(channel = %channel, "entry left pending");
        }
    }
}

async fn ack(inner: &Inner, channel: &str, id: EntryId) {
    if let Err(e) = inner
        .broker
        .ack(channel, &inner.config.group, std::slice::from_ref(&id))
        .await
    {
        warn!(channel = %channel, id = %id, error = %e, "failed to ack entry");
    }
}
