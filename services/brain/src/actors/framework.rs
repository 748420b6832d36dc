//! Core actor framework types and traits.
//!
//! Provides the building blocks shared by every actor:
//! - `Actor` trait for setup and cleanup hooks
//! - `ActorContext` for subscriptions and background tasks
//! - `ActorCell` for the lifecycle of one actor
//! - `ActorSystem` for ordered startup and reverse shutdown

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use bravebird_bus::{Bus, BusError};
use futures_util::FutureExt;
use prost::Message;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for background tasks after cancelling them.
const STOP_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Core Traits
// =============================================================================

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Subscribe to bus channels and spawn background work in `setup`
/// - Own mutable state not shared with other actors
/// - Talk to other actors only through the bus
#[async_trait]
pub trait Actor: Send + 'static {
    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Called once when the actor starts. Register subscriptions here.
    async fn setup(&mut self, ctx: &ActorContext) -> Result<(), ActorError>;

    /// Called after background tasks have been cancelled.
    async fn cleanup(&mut self) {}
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Constructed, not started.
    Created,
    /// `setup` completed; handlers and tasks are live.
    Running,
    /// Cancelling tasks and running `cleanup`.
    Stopping,
    /// Stopped, or `setup` failed.
    Stopped,
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActorState::Created => "created",
            ActorState::Running => "running",
            ActorState::Stopping => "stopping",
            ActorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// A subscription could not be registered.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// `setup` could not acquire what the actor needs.
    #[error("setup failed: {0}")]
    Setup(String),

    /// Lifecycle call made in the wrong state.
    #[error("actor {actor} cannot start while {state}")]
    InvalidState { actor: String, state: ActorState },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Context
// =============================================================================

/// Context handed to an actor: its bus handle, its cancellation token and
/// its background task set. Cheap to clone into handlers.
#[derive(Clone)]
pub struct ActorContext {
    name: String,
    bus: Bus,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ActorContext {
    fn new(name: String, bus: Bus) -> Self {
        Self {
            name,
            bus,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Token cancelled when the actor stops.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of background tasks still running.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Runs `future` in the background until it completes or the actor stops.
    ///
    /// Finished tasks leave the set on their own.
    pub fn spawn<F>(&self, task: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let actor = self.name.clone();
        let task = task.to_string();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(actor = %actor, task = %task, "background task cancelled");
                }
                _ = future => {
                    debug!(actor = %actor, task = %task, "background task finished");
                }
            }
        });
    }

    /// Subscribes a handler that lives as long as the actor.
    ///
    /// Once the actor stops, deliveries fail without running the handler so
    /// the bus keeps them pending for the next start.
    pub async fn subscribe<T, F, Fut>(&self, channel: &str, handler: F) -> Result<(), ActorError>
    where
        T: Message + Default + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let actor = self.name.clone();

        self.bus
            .subscribe(channel, move |message: T| {
                let cancel = cancel.clone();
                let actor = actor.clone();
                let work = handler(message);
                async move {
                    if cancel.is_cancelled() {
                        anyhow::bail!("actor {actor} is stopped");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => anyhow::bail!("actor {actor} stopped mid-delivery"),
                        outcome = work => outcome,
                    }
                }
            })
            .await?;
        Ok(())
    }
}

// =============================================================================
// Actor Cell
// =============================================================================

/// Owns one actor and drives its lifecycle.
pub struct ActorCell<A: Actor> {
    actor: A,
    ctx: ActorContext,
    state: ActorState,
}

impl<A: Actor> ActorCell<A> {
    pub fn new(actor: A, bus: Bus) -> Self {
        let ctx = ActorContext::new(actor.name().to_string(), bus);
        Self {
            actor,
            ctx,
            state: ActorState::Created,
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    pub fn context(&self) -> &ActorContext {
        &self.ctx
    }

    pub fn actor(&self) -> &A {
        &self.actor
    }

    /// Runs `setup` and marks the actor Running.
    ///
    /// A failed setup leaves the actor Stopped with its tasks cancelled.
    pub async fn start(&mut self) -> Result<(), ActorError> {
        if self.state != ActorState::Created {
            return Err(ActorError::InvalidState {
                actor: self.name().to_string(),
                state: self.state,
            });
        }

        info!(actor = %self.name(), "starting actor");
        self.state = ActorState::Running;

        if let Err(e) = self.actor.setup(&self.ctx).await {
            error!(actor = %self.name(), error = %e, "actor setup failed");
            self.ctx.cancel.cancel();
            self.ctx.tasks.close();
            self.state = ActorState::Stopped;
            return Err(e);
        }

        info!(actor = %self.name(), "actor started");
        Ok(())
    }

    /// Cancels background work, runs `cleanup` and marks the actor Stopped.
    /// Does nothing unless the actor is Running. A panicking `cleanup` is
    /// logged and the actor still ends up Stopped.
    pub async fn stop(&mut self) {
        if self.state != ActorState::Running {
            return;
        }

        info!(actor = %self.name(), "stopping actor");
        self.state = ActorState::Stopping;

        self.ctx.cancel.cancel();
        self.ctx.tasks.close();
        if tokio::time::timeout(STOP_GRACE, self.ctx.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                actor = %self.name(),
                remaining = self.ctx.tasks.len(),
                "background tasks did not finish in time"
            );
        }

        let cleaned = AssertUnwindSafe(self.actor.cleanup()).catch_unwind().await;
        self.state = ActorState::Stopped;
        match cleaned {
            Ok(()) => info!(actor = %self.name(), "actor stopped"),
            Err(_) => error!(actor = %self.name(), "actor cleanup panicked"),
        }
    }
}

// =============================================================================
// Actor System
// =============================================================================

/// Object-safe view of an [`ActorCell`] used by [`ActorSystem`].
#[async_trait]
pub trait ManagedActor: Send {
    fn name(&self) -> &str;
    fn state(&self) -> ActorState;
    async fn start(&mut self) -> Result<(), ActorError>;
    async fn stop(&mut self);
}

#[async_trait]
impl<A: Actor> ManagedActor for ActorCell<A> {
    fn name(&self) -> &str {
        ActorCell::name(self)
    }

    fn state(&self) -> ActorState {
        ActorCell::state(self)
    }

    async fn start(&mut self) -> Result<(), ActorError> {
        ActorCell::start(self).await
    }

    async fn stop(&mut self) {
        ActorCell::stop(self).await
    }
}

/// Starts actors in registration order and stops them in reverse.
#[derive(Default)]
pub struct ActorSystem {
    actors: Vec<Box<dyn ManagedActor>>,
}

impl ActorSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an actor; it starts after every actor added before it.
    pub fn add<A: Actor>(&mut self, actor: A, bus: Bus) {
        self.actors.push(Box::new(ActorCell::new(actor, bus)));
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Name and state of every actor, in startup order.
    pub fn states(&self) -> Vec<(String, ActorState)> {
        self.actors
            .iter()
            .map(|a| (a.name().to_string(), a.state()))
            .collect()
    }

    /// Starts every actor. If one fails, the ones already started are
    /// stopped again and the error is returned.
    pub async fn start_all(&mut self) -> Result<(), ActorError> {
        info!(count = self.actors.len(), "starting actors");

        for index in 0..self.actors.len() {
            if let Err(e) = self.actors[index].start().await {
                error!(actor = %self.actors[index].name(), error = %e, "aborting startup");
                for started in self.actors[..index].iter_mut().rev() {
                    started.stop().await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stops every actor in reverse startup order.
    pub async fn stop_all(&mut self) {
        info!(count = self.actors.len(), "stopping actors");
        for actor in self.actors.iter_mut().rev() {
            actor.stop().await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use bravebird_bus::{BusConfig, MemoryBroker};

    use super::*;

    async fn test_bus() -> Bus {
        Bus::connect(Arc::new(MemoryBroker::new()), BusConfig::default())
            .await
            .unwrap()
    }

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_setup: bool,
        panic_in_cleanup: bool,
    }

    #[async_trait]
    impl Actor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn setup(&mut self, _ctx: &ActorContext) -> Result<(), ActorError> {
            if self.fail_setup {
                return Err(ActorError::Setup("no model".to_string()));
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn cleanup(&mut self) {
            if self.panic_in_cleanup {
                panic!("{} lost its model handle", self.name);
            }
            self.log.lock().unwrap().push(format!("stop {}", self.name));
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder {
            name: name.to_string(),
            log: log.clone(),
            fail_setup: false,
            panic_in_cleanup: false,
        }
    }

    struct Ticker {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Actor for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        async fn setup(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
            let ticks = self.ticks.clone();
            ctx.spawn("tick", async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
            ctx.spawn("one_shot", async {});
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut cell = ActorCell::new(recorder("a", &log), test_bus().await);
        assert_eq!(cell.state(), ActorState::Created);

        cell.start().await.unwrap();
        assert_eq!(cell.state(), ActorState::Running);

        cell.stop().await;
        assert_eq!(cell.state(), ActorState::Stopped);

        // Stopping twice is a no-op.
        cell.stop().await;
        assert_eq!(*log.lock().unwrap(), vec!["start a", "stop a"]);
    }

    #[tokio::test]
    async fn test_setup_failure_leaves_actor_stopped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut actor = recorder("broken", &log);
        actor.fail_setup = true;

        let mut cell = ActorCell::new(actor, test_bus().await);
        assert!(matches!(cell.start().await, Err(ActorError::Setup(_))));
        assert_eq!(cell.state(), ActorState::Stopped);
        assert!(cell.context().is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_cancels_background_tasks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut cell = ActorCell::new(Ticker { ticks: ticks.clone() }, test_bus().await);
        cell.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        // The one-shot task removed itself from the set.
        assert_eq!(cell.context().task_count(), 1);

        cell.stop().await;
        assert_eq!(cell.context().task_count(), 0);

        let after_stop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_system_stops_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = test_bus().await;
        let mut system = ActorSystem::new();
        system.add(recorder("perception", &log), bus.clone());
        system.add(recorder("cognition", &log), bus.clone());
        system.add(recorder("action", &log), bus);

        system.start_all().await.unwrap();
        system.stop_all().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start perception",
                "start cognition",
                "start action",
                "stop action",
                "stop cognition",
                "stop perception",
            ]
        );
    }

    #[tokio::test]
    async fn test_system_rolls_back_failed_startup() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = test_bus().await;
        let mut broken = recorder("audio", &log);
        broken.fail_setup = true;

        let mut system = ActorSystem::new();
        system.add(recorder("perception", &log), bus.clone());
        system.add(broken, bus.clone());
        system.add(recorder("action", &log), bus);

        assert!(system.start_all().await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["start perception", "stop perception"]);
        assert_eq!(system.states()[2].1, ActorState::Created);
    }

    #[tokio::test]
    async fn test_panicking_cleanup_does_not_abort_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = test_bus().await;
        let mut broken = recorder("audio", &log);
        broken.panic_in_cleanup = true;

        let mut system = ActorSystem::new();
        system.add(recorder("perception", &log), bus.clone());
        system.add(broken, bus.clone());
        system.add(recorder("action", &log), bus);

        system.start_all().await.unwrap();
        system.stop_all().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start perception",
                "start audio",
                "start action",
                "stop action",
                "stop perception",
            ]
        );
        assert!(system
            .states()
            .iter()
            .all(|(_, state)| *state == ActorState::Stopped));
    }
}
