//! Action actor: executes action requests against sandboxes.
//!
//! Every request produces exactly one `action.result`. When the request asks
//! for it and the target can snapshot, the sandbox is checkpointed first and
//! rolled back if the action fails:
//!
//! ```text
//! snapshot(pre_action_<id>) -> act -> ok  -> success
//!                                  -> err -> restore(snapshot) -> failure
//! ```
//!
//! A failed restore is logged; the result still carries the action's error.
//!
//! Requests can be delivered more than once. The actor remembers the result
//! of recent action ids: a repeat never reaches the sandbox again, and its
//! stored result is republished only if the first publish did not go
//! through.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bravebird_bus::Bus;
use bravebird_events::{channels, ActionRequest, ActionResult, ActionType};
use tracing::{error, info, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::sandbox::{MouseAction, SandboxBackend, SandboxError, SandboxRegistry, Snapshot};

/// Number of answered action ids kept for duplicate detection.
const REMEMBERED_ACTIONS: usize = 1024;

#[derive(Debug)]
struct Answer {
    result: ActionResult,
    published: bool,
}

/// Results of recently executed actions, oldest evicted first.
#[derive(Debug, Default)]
struct Answered {
    order: VecDeque<String>,
    answers: HashMap<String, Answer>,
}

impl Answered {
    fn get(&self, id: &str) -> Option<&Answer> {
        self.answers.get(id)
    }

    fn insert(&mut self, result: ActionResult) {
        let id = result.request_id.clone();
        if self.answers.contains_key(&id) {
            return;
        }
        if self.order.len() >= REMEMBERED_ACTIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.answers.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.answers.insert(
            id,
            Answer {
                result,
                published: false,
            },
        );
    }

    fn mark_published(&mut self, id: &str) {
        if let Some(answer) = self.answers.get_mut(id) {
            answer.published = true;
        }
    }
}

/// Executes `action.request` messages.
#[derive(Clone)]
pub struct ActionActor {
    registry: Arc<SandboxRegistry>,
    default_timeout: Duration,
    answered: Arc<Mutex<Answered>>,
}

impl ActionActor {
    pub fn new(registry: SandboxRegistry, default_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            default_timeout,
            answered: Arc::new(Mutex::new(Answered::default())),
        }
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    /// Runs one request and returns its single result.
    pub async fn execute(&self, request: &ActionRequest) -> ActionResult {
        let id = request.action_id.as_str();

        let Some((target, backend)) = self.registry.resolve(&request.target_os) else {
            warn!(action_id = %id, target = %request.target_os, "unknown sandbox target");
            return ActionResult::failure(
                id,
                format!("unknown sandbox target '{}'", request.target_os),
            );
        };

        let kind = match request.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(action_id = %id, error = %e, "invalid action request");
                return ActionResult::failure(id, format!("invalid request: {e}"));
            }
        };

        info!(action_id = %id, target = %target, action = %kind, "executing action");

        let snapshot = if request.requires_snapshot && backend.capabilities().can_snapshot {
            match backend.snapshot_state(&format!("pre_action_{id}")).await {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    error!(action_id = %id, error = %e, "pre-action snapshot failed, not acting");
                    return ActionResult::failure(id, format!("snapshot failed: {e}"));
                }
            }
        } else {
            None
        };

        match perform(backend.as_ref(), kind, request, self.timeout_for(request)).await {
            Ok(details) => {
                info!(action_id = %id, "action succeeded");
                ActionResult::success(id, details)
            }
            Err(e) => {
                error!(action_id = %id, error = %e, "action failed");
                if let Some(snapshot) = &snapshot {
                    rollback(backend.as_ref(), id, snapshot).await;
                }
                ActionResult::failure(id, e.to_string())
            }
        }
    }

    /// Answers one delivery of `request` on `action.result`.
    ///
    /// A repeated action id is not executed again. Its stored result is
    /// published only if no earlier publish succeeded.
    pub async fn handle(&self, bus: &Bus, request: &ActionRequest) -> anyhow::Result<()> {
        let id = request.action_id.as_str();

        let result = match self.stored(id) {
            Some((_, true)) => {
                info!(action_id = %id, "duplicate action request, already answered");
                return Ok(());
            }
            Some((result, false)) => {
                warn!(action_id = %id, "duplicate action request, republishing stored result");
                result
            }
            None => {
                let result = self.execute(request).await;
                if !id.is_empty() {
                    self.lock_answered().insert(result.clone());
                }
                result
            }
        };

        bus.try_publish(channels::ACTION_RESULT, &result).await?;
        self.lock_answered().mark_published(id);
        Ok(())
    }

    fn stored(&self, id: &str) -> Option<(ActionResult, bool)> {
        if id.is_empty() {
            return None;
        }
        self.lock_answered()
            .get(id)
            .map(|answer| (answer.result.clone(), answer.published))
    }

    fn lock_answered(&self) -> std::sync::MutexGuard<'_, Answered> {
        self.answered.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timeout_for(&self, request: &ActionRequest) -> Duration {
        match request.timeout_secs {
            0 => self.default_timeout,
            secs => Duration::from_secs(secs.into()),
        }
    }
}

async fn rollback(backend: &dyn SandboxBackend, id: &str, snapshot: &Snapshot) {
    warn!(action_id = %id, snapshot = %snapshot.id, "rolling back");
    match backend.restore_state(snapshot).await {
        Ok(true) => info!(action_id = %id, snapshot = %snapshot.id, "rolled back"),
        Ok(false) => warn!(action_id = %id, snapshot = %snapshot.id, "rollback did not complete"),
        Err(e) => error!(action_id = %id, snapshot = %snapshot.id, error = %e, "rollback failed"),
    }
}

async fn perform(
    backend: &dyn SandboxBackend,
    kind: ActionType,
    request: &ActionRequest,
    timeout: Duration,
) -> Result<String, SandboxError> {
    let button = if request.button.is_empty() {
        "left"
    } else {
        request.button.as_str()
    };
    let (x, y) = (request.x, request.y);

    match kind {
        ActionType::Click | ActionType::DoubleClick | ActionType::Move => {
            let action = match kind {
                ActionType::Click => MouseAction::Click,
                ActionType::DoubleClick => MouseAction::DoubleClick,
                _ => MouseAction::Move,
            };
            backend.execute_mouse_action(action, x, y, button).await?;
            Ok(format!("{} at ({x}, {y})", action.as_str()))
        }
        ActionType::Type => {
            if request.text.is_empty() && request.keys.is_empty() {
                return Err(SandboxError::InvalidRequest(
                    "type needs text or keys".to_string(),
                ));
            }
            let text = (!request.text.is_empty()).then_some(request.text.as_str());
            backend.execute_keyboard_action(text, &request.keys).await?;
            Ok(format!(
                "typed {} chars, {} keys",
                request.text.chars().count(),
                request.keys.len()
            ))
        }
        ActionType::Scroll => {
            backend.scroll(request.amount).await?;
            Ok(format!("scrolled {}", request.amount))
        }
        ActionType::Command => {
            if request.command.trim().is_empty() {
                return Err(SandboxError::InvalidRequest("empty command".to_string()));
            }
            let output = backend.run_command(&request.command, timeout).await?;
            if !output.success() {
                return Err(SandboxError::CommandFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                });
            }
            Ok(output.stdout)
        }
    }
}

#[async_trait]
impl Actor for ActionActor {
    fn name(&self) -> &str {
        "action"
    }

    async fn setup(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let started = self.registry.start_all().await;
        info!(
            started,
            targets = ?self.registry.targets(),
            "sandboxes initialized"
        );

        let this = self.clone();
        let bus = ctx.bus().clone();
        ctx.subscribe(channels::ACTION_REQUEST, move |request: ActionRequest| {
            let this = this.clone();
            let bus = bus.clone();
            async move { this.handle(&bus, &request).await }
        })
        .await?;
        Ok(())
    }

    async fn cleanup(&mut self) {
        self.registry.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use bravebird_bus::{BusConfig, MemoryBroker};
    use rstest::rstest;

    use super::*;
    use crate::sandbox::{MockCall, MockSandbox, TARGET_LINUX};

    async fn actor_with(mock: Arc<MockSandbox>) -> ActionActor {
        let mut registry = SandboxRegistry::new(TARGET_LINUX);
        registry.insert(TARGET_LINUX, mock);
        let actor = ActionActor::new(registry, Duration::from_secs(5));
        actor.registry().start_all().await;
        actor
    }

    fn request(action_type: &str) -> ActionRequest {
        ActionRequest {
            action_id: "act_1".to_string(),
            action_type: action_type.to_string(),
            requires_snapshot: true,
            x: 10,
            y: 20,
            text: "hello".to_string(),
            command: "ls".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_drops_snapshot() {
        let mock = Arc::new(MockSandbox::snapshotting());
        let actor = actor_with(mock.clone()).await;

        let result = actor.execute(&request("click")).await;
        assert!(result.success, "{}", result.error);
        assert_eq!(result.request_id, "act_1");
        assert_eq!(mock.snapshot_calls(), vec!["pre_action_act_1"]);
        assert!(mock.restore_calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_snapshot_unless_requested() {
        let mock = Arc::new(MockSandbox::snapshotting());
        let actor = actor_with(mock.clone()).await;

        let mut req = request("scroll");
        req.requires_snapshot = false;
        assert!(actor.execute(&req).await.success);
        assert!(mock.snapshot_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_original_error() {
        let mock = Arc::new(
            MockSandbox::snapshotting()
                .fail_actions_with("window vanished")
                .failing_restore(),
        );
        let actor = actor_with(mock.clone()).await;

        let result = actor.execute(&request("type")).await;
        assert!(!result.success);
        assert!(result.error.contains("window vanished"));
        assert_eq!(mock.restore_calls().len(), 1);
    }

    #[rstest]
    #[case("teleport", "invalid request")]
    #[case("", "invalid request")]
    #[tokio::test]
    async fn test_invalid_action_type(#[case] action_type: &str, #[case] expected: &str) {
        let mock = Arc::new(MockSandbox::snapshotting());
        let actor = actor_with(mock.clone()).await;

        let result = actor.execute(&request(action_type)).await;
        assert!(!result.success);
        assert!(result.error.contains(expected));
        // Nothing reached the sandbox beyond start.
        assert_eq!(mock.calls(), vec![MockCall::Start]);
    }

    #[tokio::test]
    async fn test_type_without_text_or_keys_is_rejected() {
        let mock = Arc::new(MockSandbox::without_snapshots());
        let actor = actor_with(mock).await;

        let mut req = request("type");
        req.text.clear();
        let result = actor.execute(&req).await;
        assert!(!result.success);
        assert!(result.error.contains("text or keys"));
    }

    #[test]
    fn test_timeout_defaults() {
        let actor = ActionActor::new(SandboxRegistry::new(TARGET_LINUX), Duration::from_secs(30));
        let mut req = request("command");
        assert_eq!(actor.timeout_for(&req), Duration::from_secs(30));
        req.timeout_secs = 3;
        assert_eq!(actor.timeout_for(&req), Duration::from_secs(3));
    }

    fn mouse_calls(mock: &MockSandbox) -> usize {
        mock.calls()
            .iter()
            .filter(|call| matches!(call, MockCall::Mouse { .. }))
            .count()
    }

    async fn memory_bus() -> (Arc<MemoryBroker>, Bus) {
        let broker = Arc::new(MemoryBroker::new());
        let bus = Bus::connect(broker.clone(), BusConfig::default())
            .await
            .unwrap();
        (broker, bus)
    }

    #[tokio::test]
    async fn test_repeated_request_is_answered_once() {
        let mock = Arc::new(MockSandbox::without_snapshots());
        let actor = actor_with(mock.clone()).await;
        let (broker, bus) = memory_bus().await;

        let req = request("click");
        actor.handle(&bus, &req).await.unwrap();
        actor.handle(&bus, &req).await.unwrap();

        assert_eq!(mouse_calls(&mock), 1);
        assert_eq!(broker.len(channels::ACTION_RESULT), 1);
        bus.disconnect().await;
    }

    #[tokio::test]
    async fn test_unpublished_result_is_replayed_without_acting() {
        let mock = Arc::new(MockSandbox::without_snapshots());
        let actor = actor_with(mock.clone()).await;
        let (broker, bus) = memory_bus().await;
        let req = request("click");

        broker.disconnect();
        assert!(actor.handle(&bus, &req).await.is_err());
        assert_eq!(mouse_calls(&mock), 1);
        assert_eq!(broker.len(channels::ACTION_RESULT), 0);

        broker.reconnect();
        actor.handle(&bus, &req).await.unwrap();
        assert_eq!(mouse_calls(&mock), 1);
        assert_eq!(broker.len(channels::ACTION_RESULT), 1);

        // Once published, further repeats stay silent.
        actor.handle(&bus, &req).await.unwrap();
        assert_eq!(broker.len(channels::ACTION_RESULT), 1);
        bus.disconnect().await;
    }

    #[test]
    fn test_answered_evicts_oldest() {
        let mut answered = Answered::default();
        for n in 0..=REMEMBERED_ACTIONS {
            answered.insert(ActionResult::success(format!("act_{n}"), "ok"));
        }
        assert!(answered.get("act_0").is_none());
        assert!(answered.get("act_1").is_some());
        assert_eq!(answered.order.len(), REMEMBERED_ACTIONS);
    }
}
