//! Cognition actor: drives a workflow through the agent state machine.
//!
//! ```text
//! start_workflow -> Planning -> Observing --grounding request-->
//! grounding result -> Thinking -> Acting --action request-->
//! action result    -> Verifying -> Observing (next step) | Finished | Failed
//! ```
//!
//! Low-confidence groundings go through Recovering and are retried a few
//! times before the episode fails. A voice command containing "stop" fails
//! the episode immediately.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bravebird_bus::Bus;
use bravebird_events::{
    channels, ActionRequest, ActionResult, ActionType, GroundingRequest, GroundingResult,
    UserTranscript, WorkflowStart,
};
use bravebird_id::{ActionId, EpisodeId, RequestId};
use prost::Message;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use super::framework::{Actor, ActorContext, ActorError};
use crate::state_machine::{AgentState, AgentStateMachine, StateError};

/// Groundings below this confidence are not acted on.
pub const MIN_CONFIDENCE: f32 = 0.5;

/// Grounding attempts per step before the episode fails.
pub const MAX_GROUNDING_ATTEMPTS: u32 = 3;

// =============================================================================
// Workflow
// =============================================================================

/// A synthesized workflow: an ordered list of steps.
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowStep {
    /// What to look for on screen, e.g. "the Save button".
    #[serde(alias = "description")]
    pub instruction: String,
    #[serde(default)]
    pub action: StepAction,
    /// Text for `type` steps.
    #[serde(default)]
    pub text: Option<String>,
    /// Sandbox target; the registry default when absent.
    #[serde(default)]
    pub target_os: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    #[default]
    Click,
    DoubleClick,
    /// Types `text` into the focused element; no grounding needed.
    Type,
}

// =============================================================================
// State
// =============================================================================

/// Snapshot of what the cognition actor is doing.
#[derive(Debug, Clone, PartialEq)]
pub struct CognitionStatus {
    pub episode: EpisodeId,
    pub state: AgentState,
    pub workflow_id: Option<String>,
    /// Index of the current step.
    pub step: usize,
    pub total_steps: usize,
    pub awaiting_grounding: Option<String>,
    pub awaiting_action: Option<String>,
}

/// A message cognition wants published.
#[derive(Debug, Clone, PartialEq)]
enum Outgoing {
    Ground(GroundingRequest),
    Act(ActionRequest),
}

#[derive(Clone)]
struct Run {
    workflow_id: String,
    steps: Vec<WorkflowStep>,
    index: usize,
    attempts: u32,
}

impl Run {
    fn step(&self) -> Option<&WorkflowStep> {
        self.steps.get(self.index)
    }
}

#[derive(Clone, Default)]
struct Cognition {
    machine: AgentStateMachine,
    run: Option<Run>,
    awaiting_grounding: Option<String>,
    awaiting_action: Option<String>,
}

impl Cognition {
    fn status(&self) -> CognitionStatus {
        CognitionStatus {
            episode: *self.machine.episode(),
            state: self.machine.current(),
            workflow_id: self.run.as_ref().map(|r| r.workflow_id.clone()),
            step: self.run.as_ref().map_or(0, |r| r.index),
            total_steps: self.run.as_ref().map_or(0, |r| r.steps.len()),
            awaiting_grounding: self.awaiting_grounding.clone(),
            awaiting_action: self.awaiting_action.clone(),
        }
    }

    fn start_workflow(&mut self, start: &WorkflowStart) -> Result<Vec<Outgoing>, StateError> {
        if !self.machine.is_terminal() && self.machine.current() != AgentState::Idle {
            warn!(
                state = %self.machine.current(),
                workflow_id = %start.workflow_id,
                "abandoning running episode for new workflow"
            );
            self.machine.transition(
                AgentState::Failed,
                format!("superseded by workflow {}", start.workflow_id),
            )?;
        }
        self.machine.reset(format!("workflow {} received", start.workflow_id))?;
        self.awaiting_grounding = None;
        self.awaiting_action = None;
        self.run = None;
        self.machine.transition(AgentState::Planning, "loading workflow")?;

        let workflow: Workflow = match serde_json::from_str(&start.workflow_json) {
            Ok(workflow) => workflow,
            Err(e) => {
                error!(workflow_id = %start.workflow_id, error = %e, "invalid workflow");
                self.machine.transition(AgentState::Failed, format!("invalid workflow: {e}"))?;
                return Ok(Vec::new());
            }
        };

        info!(
            workflow_id = %start.workflow_id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            episode = %self.machine.episode(),
            "starting workflow"
        );

        self.run = Some(Run {
            workflow_id: start.workflow_id.clone(),
            steps: workflow.steps,
            index: 0,
            attempts: 0,
        });
        self.next_step()
    }

    /// Issues the current step, or finishes when there is none left.
    fn next_step(&mut self) -> Result<Vec<Outgoing>, StateError> {
        let Some(run) = self.run.as_mut() else {
            return Ok(Vec::new());
        };
        let Some(step) = run.steps.get(run.index).cloned() else {
            let reason = format!("completed {} steps", run.steps.len());
            self.machine.transition(AgentState::Finished, reason)?;
            return Ok(Vec::new());
        };

        if step.action == StepAction::Type {
            self.machine.transition(AgentState::Thinking, "typing step")?;
            self.machine.transition(AgentState::Acting, "typing text")?;
            let action_id = ActionId::new().to_string();
            self.awaiting_action = Some(action_id.clone());
            return Ok(vec![Outgoing::Act(ActionRequest {
                action_id,
                target_os: step.target_os.unwrap_or_default(),
                action_type: ActionType::Type.as_str().to_string(),
                requires_snapshot: true,
                text: step.text.unwrap_or_default(),
                ..Default::default()
            })]);
        }

        run.attempts += 1;
        self.machine
            .transition(AgentState::Observing, format!("locating '{}'", step.instruction))?;
        let request_id = RequestId::new().to_string();
        self.awaiting_grounding = Some(request_id.clone());
        Ok(vec![Outgoing::Ground(GroundingRequest {
            request_id,
            instruction: step.instruction,
        })])
    }

    fn on_grounding(&mut self, result: &GroundingResult) -> Result<Vec<Outgoing>, StateError> {
        if self.awaiting_grounding.as_deref() != Some(result.request_id.as_str()) {
            debug!(request_id = %result.request_id, "ignoring unexpected grounding result");
            return Ok(Vec::new());
        }
        self.awaiting_grounding = None;

        let Some(run) = self.run.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(step) = run.step().cloned() else {
            return Ok(Vec::new());
        };
        let attempts = run.attempts;

        self.machine.transition(AgentState::Thinking, "grounding received")?;

        if result.confidence < MIN_CONFIDENCE || !result.error.is_empty() {
            warn!(
                request_id = %result.request_id,
                confidence = result.confidence,
                error = %result.error,
                attempts,
                "low confidence grounding"
            );
            self.machine
                .transition(AgentState::Recovering, "low confidence grounding")?;
            if attempts >= MAX_GROUNDING_ATTEMPTS {
                self.machine.transition(
                    AgentState::Failed,
                    format!("could not locate '{}'", step.instruction),
                )?;
                return Ok(Vec::new());
            }
            return self.next_step();
        }

        let action_type = match step.action {
            StepAction::DoubleClick => ActionType::DoubleClick,
            _ => ActionType::Click,
        };

        self.machine
            .transition(AgentState::Acting, format!("{action_type} at ({}, {})", result.x, result.y))?;
        let action_id = ActionId::new().to_string();
        self.awaiting_action = Some(action_id.clone());
        Ok(vec![Outgoing::Act(ActionRequest {
            action_id,
            target_os: step.target_os.unwrap_or_default(),
            action_type: action_type.as_str().to_string(),
            requires_snapshot: true,
            x: result.x,
            y: result.y,
            button: "left".to_string(),
            ..Default::default()
        })])
    }

    fn on_action_result(&mut self, result: &ActionResult) -> Result<Vec<Outgoing>, StateError> {
        if self.awaiting_action.as_deref() != Some(result.request_id.as_str()) {
            debug!(request_id = %result.request_id, "ignoring unexpected action result");
            return Ok(Vec::new());
        }
        self.awaiting_action = None;

        self.machine.transition(AgentState::Verifying, "action result received")?;

        if !result.success {
            self.machine
                .transition(AgentState::Failed, format!("action failed: {}", result.error))?;
            return Ok(Vec::new());
        }

        if let Some(run) = self.run.as_mut() {
            run.index += 1;
            run.attempts = 0;
        }
        self.next_step()
    }

    fn on_voice(&mut self, transcript: &UserTranscript) -> Result<(), StateError> {
        info!(text = %transcript.text, "user said");
        if !transcript.text.to_lowercase().contains("stop") {
            return Ok(());
        }

        error!(state = %self.machine.current(), "emergency stop requested by voice");
        self.awaiting_grounding = None;
        self.awaiting_action = None;
        self.machine.transition(AgentState::Failed, "emergency stop")?;
        Ok(())
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Owns the agent state machine and sequences workflows.
#[derive(Clone, Default)]
pub struct CognitionActor {
    inner: Arc<Mutex<Cognition>>,
    /// Held across a step and its publishes, so steps commit one at a time.
    turn: Arc<tokio::sync::Mutex<()>>,
}

impl CognitionActor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CognitionStatus {
        self.lock().status()
    }

    /// Full transition history across episodes.
    pub fn history(&self) -> Vec<crate::state_machine::Transition> {
        self.lock().machine.history().to_vec()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Cognition> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `event` and publishes whatever it produced.
    ///
    /// The step runs on a copy of the state that replaces the current one
    /// only after every publish went through; on a publish error nothing
    /// changes and the error is returned so the event stays pending.
    ///
    /// Denied transitions are logged and the event is consumed; replaying it
    /// would hit the same edge.
    async fn apply<T, F>(&self, bus: &Bus, event: &T, step: F) -> anyhow::Result<()>
    where
        T: Message,
        F: FnOnce(&mut Cognition, &T) -> Result<Vec<Outgoing>, StateError>,
    {
        let _turn = self.turn.lock().await;

        let mut next = self.lock().clone();
        let outgoing = match step(&mut next, event) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                warn!(state = %next.machine.current(), error = %e, "event ignored");
                return Ok(());
            }
        };

        for message in &outgoing {
            match message {
                Outgoing::Ground(request) => {
                    bus.try_publish(channels::PERCEPTION_GROUNDING_REQUEST, request)
                        .await?;
                }
                Outgoing::Act(request) => {
                    bus.try_publish(channels::ACTION_REQUEST, request).await?;
                }
            }
        }

        *self.lock() = next;
        Ok(())
    }

    async fn hear(&self, transcript: &UserTranscript) {
        let _turn = self.turn.lock().await;
        if let Err(e) = self.lock().on_voice(transcript) {
            warn!(error = %e, "voice command ignored");
        }
    }
}

#[async_trait]
impl Actor for CognitionActor {
    fn name(&self) -> &str {
        "cognition"
    }

    async fn setup(&mut self, ctx: &ActorContext) -> Result<(), ActorError> {
        let bus = ctx.bus().clone();

        let (this, b) = (self.clone(), bus.clone());
        ctx.subscribe(channels::COGNITION_START_WORKFLOW, move |start: WorkflowStart| {
            let (this, bus) = (this.clone(), b.clone());
            async move { this.apply(&bus, &start, Cognition::start_workflow).await }
        })
        .await?;

        let (this, b) = (self.clone(), bus.clone());
        ctx.subscribe(channels::PERCEPTION_GROUNDING_RESULT, move |result: GroundingResult| {
            let (this, bus) = (this.clone(), b.clone());
            async move { this.apply(&bus, &result, Cognition::on_grounding).await }
        })
        .await?;

        let (this, b) = (self.clone(), bus.clone());
        ctx.subscribe(channels::ACTION_RESULT, move |result: ActionResult| {
            let (this, bus) = (this.clone(), b.clone());
            async move { this.apply(&bus, &result, Cognition::on_action_result).await }
        })
        .await?;

        let this = self.clone();
        ctx.subscribe(channels::COGNITION_USER_VOICE, move |transcript: UserTranscript| {
            let this = this.clone();
            async move {
                this.hear(&transcript).await;
                Ok(())
            }
        })
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bravebird_bus::{BusConfig, MemoryBroker};
    use rstest::rstest;

    use super::*;

    fn start(json: &str) -> WorkflowStart {
        WorkflowStart {
            workflow_id: "wf_1".to_string(),
            workflow_json: json.to_string(),
        }
    }

    const TWO_CLICKS: &str = r#"{
        "name": "save file",
        "steps": [
            {"instruction": "File menu"},
            {"description": "Save button", "action": "double_click", "target_os": "windows"}
        ]
    }"#;

    fn grounding_of(outgoing: &[Outgoing]) -> GroundingRequest {
        match outgoing {
            [Outgoing::Ground(request)] => request.clone(),
            other => panic!("expected one grounding request, got {other:?}"),
        }
    }

    fn action_of(outgoing: &[Outgoing]) -> ActionRequest {
        match outgoing {
            [Outgoing::Act(request)] => request.clone(),
            other => panic!("expected one action request, got {other:?}"),
        }
    }

    fn confident(request: &GroundingRequest) -> GroundingResult {
        GroundingResult {
            request_id: request.request_id.clone(),
            x: 100,
            y: 200,
            confidence: 0.9,
            error: String::new(),
        }
    }

    #[test]
    fn test_workflow_runs_to_finished() {
        let mut cognition = Cognition::default();

        let first = grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());
        assert_eq!(first.instruction, "File menu");
        assert_eq!(cognition.machine.current(), AgentState::Observing);

        let click = action_of(&cognition.on_grounding(&confident(&first)).unwrap());
        assert_eq!(click.action_type, "click");
        assert_eq!((click.x, click.y), (100, 200));
        assert!(click.requires_snapshot);
        assert_eq!(cognition.machine.current(), AgentState::Acting);

        let second = grounding_of(
            &cognition
                .on_action_result(&ActionResult::success(&click.action_id, "ok"))
                .unwrap(),
        );
        assert_eq!(second.instruction, "Save button");

        let double = action_of(&cognition.on_grounding(&confident(&second)).unwrap());
        assert_eq!(double.action_type, "double_click");
        assert_eq!(double.target_os, "windows");

        let done = cognition
            .on_action_result(&ActionResult::success(&double.action_id, "ok"))
            .unwrap();
        assert!(done.is_empty());
        assert_eq!(cognition.machine.current(), AgentState::Finished);
        assert_eq!(cognition.status().step, 2);
    }

    #[test]
    fn test_failed_action_fails_episode() {
        let mut cognition = Cognition::default();
        let request = grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());
        let click = action_of(&cognition.on_grounding(&confident(&request)).unwrap());

        cognition
            .on_action_result(&ActionResult::failure(&click.action_id, "sandbox down"))
            .unwrap();
        assert_eq!(cognition.machine.current(), AgentState::Failed);
    }

    #[rstest]
    #[case(0.2, "")]
    #[case(0.0, "video unavailable")]
    #[case(0.9, "service timed out")]
    fn test_unusable_grounding_is_retried(#[case] confidence: f32, #[case] error: &str) {
        let mut cognition = Cognition::default();
        let request = grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());

        let retry = grounding_of(
            &cognition
                .on_grounding(&GroundingResult {
                    request_id: request.request_id.clone(),
                    x: 0,
                    y: 0,
                    confidence,
                    error: error.to_string(),
                })
                .unwrap(),
        );
        assert_ne!(retry.request_id, request.request_id);
        assert_eq!(retry.instruction, request.instruction);

        let states: Vec<AgentState> = cognition.machine.history().iter().map(|t| t.to).collect();
        assert!(states.contains(&AgentState::Recovering));
    }

    #[test]
    fn test_grounding_gives_up_after_max_attempts() {
        let mut cognition = Cognition::default();
        let mut request = grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());

        for _ in 1..MAX_GROUNDING_ATTEMPTS {
            let outgoing = cognition
                .on_grounding(&GroundingResult::failed(&request.request_id, "not found"))
                .unwrap();
            request = grounding_of(&outgoing);
        }
        let outgoing = cognition
            .on_grounding(&GroundingResult::failed(&request.request_id, "not found"))
            .unwrap();

        assert!(outgoing.is_empty());
        assert_eq!(cognition.machine.current(), AgentState::Failed);
    }

    #[test]
    fn test_stale_results_are_ignored() {
        let mut cognition = Cognition::default();
        cognition.start_workflow(&start(TWO_CLICKS)).unwrap();

        let outgoing = cognition
            .on_grounding(&GroundingResult {
                request_id: "req_stale".to_string(),
                x: 1,
                y: 1,
                confidence: 1.0,
                error: String::new(),
            })
            .unwrap();
        assert!(outgoing.is_empty());
        assert_eq!(cognition.machine.current(), AgentState::Observing);
    }

    #[test]
    fn test_voice_stop_fails_episode_and_blocks_action() {
        let mut cognition = Cognition::default();
        let request = grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());

        cognition
            .on_voice(&UserTranscript {
                text: "STOP right now".to_string(),
                timestamp_ms: 0,
            })
            .unwrap();
        assert_eq!(cognition.machine.current(), AgentState::Failed);

        // The in-flight grounding no longer produces an action.
        let outgoing = cognition.on_grounding(&confident(&request)).unwrap();
        assert!(outgoing.is_empty());
        assert_eq!(cognition.machine.current(), AgentState::Failed);
    }

    #[test]
    fn test_new_workflow_resets_failed_episode() {
        let mut cognition = Cognition::default();
        cognition.start_workflow(&start("not json")).unwrap();
        assert_eq!(cognition.machine.current(), AgentState::Failed);
        let failed_episode = *cognition.machine.episode();

        grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());
        assert_eq!(cognition.machine.current(), AgentState::Observing);
        assert_ne!(*cognition.machine.episode(), failed_episode);
    }

    #[test]
    fn test_type_step_skips_grounding() {
        let mut cognition = Cognition::default();
        let json = r#"{"steps": [{"instruction": "search box", "action": "type", "text": "sushi"}]}"#;

        let action = action_of(&cognition.start_workflow(&start(json)).unwrap());
        assert_eq!(action.action_type, "type");
        assert_eq!(action.text, "sushi");
        assert_eq!(cognition.machine.current(), AgentState::Acting);
    }

    #[test]
    fn test_empty_workflow_finishes() {
        let mut cognition = Cognition::default();
        assert!(cognition.start_workflow(&start(r#"{"steps": []}"#)).unwrap().is_empty());
        assert_eq!(cognition.machine.current(), AgentState::Finished);
    }

    #[tokio::test]
    async fn test_step_is_not_committed_when_publish_fails() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = Bus::connect(broker.clone(), BusConfig::default())
            .await
            .unwrap();
        let actor = CognitionActor::new();
        let workflow = start(TWO_CLICKS);

        broker.disconnect();
        assert!(actor
            .apply(&bus, &workflow, Cognition::start_workflow)
            .await
            .is_err());
        let status = actor.status();
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.awaiting_grounding, None);
        assert!(actor.history().is_empty());

        // The redelivered event starts the workflow for real.
        broker.reconnect();
        actor
            .apply(&bus, &workflow, Cognition::start_workflow)
            .await
            .unwrap();
        let status = actor.status();
        assert_eq!(status.state, AgentState::Observing);
        assert!(status.awaiting_grounding.is_some());
        assert_eq!(broker.len(channels::PERCEPTION_GROUNDING_REQUEST), 1);

        bus.disconnect().await;
    }

    #[test]
    fn test_new_workflow_supersedes_running_episode() {
        let mut cognition = Cognition::default();
        grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());
        let episode = cognition.status().episode;

        let again = grounding_of(&cognition.start_workflow(&start(TWO_CLICKS)).unwrap());
        assert_eq!(again.instruction, "File menu");
        assert_ne!(cognition.status().episode, episode);

        let states: Vec<_> = cognition.machine.history().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                AgentState::Planning,
                AgentState::Observing,
                AgentState::Failed,
                AgentState::Idle,
                AgentState::Planning,
                AgentState::Observing,
            ]
        );
    }
}
