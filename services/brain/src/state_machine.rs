//! Agent lifecycle state machine.
//!
//! One machine per episode. Edges are checked against a small deny table so
//! the rules live in one place; every accepted edge is appended to the
//! history.

use std::fmt;

use bravebird_id::EpisodeId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Waiting for a task.
    Idle,
    /// Building a workflow from an instruction or trace.
    Planning,
    /// Gathering visual and accessibility data.
    Observing,
    /// Reasoning about the next step.
    Thinking,
    /// A command is out to a sandbox.
    Acting,
    /// Checking whether the action worked.
    Verifying,
    /// Rolling back after an error.
    Recovering,
    Finished,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Planning => "planning",
            AgentState::Observing => "observing",
            AgentState::Thinking => "thinking",
            AgentState::Acting => "acting",
            AgentState::Verifying => "verifying",
            AgentState::Recovering => "recovering",
            AgentState::Finished => "finished",
            AgentState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Finished | AgentState::Failed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edges that are never allowed. Leaving Failed for Acting needs a reset.
const DENIED: &[(AgentState, AgentState)] = &[(AgentState::Failed, AgentState::Acting)];

/// Whether `from -> to` is a legal edge.
pub fn allowed(from: AgentState, to: AgentState) -> bool {
    !DENIED.contains(&(from, to))
}

/// One accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("transition {from} -> {to} is not allowed")]
    Denied { from: AgentState, to: AgentState },

    #[error("cannot reset while {0}")]
    NotTerminal(AgentState),
}

/// The state machine for one episode.
#[derive(Debug, Clone)]
pub struct AgentStateMachine {
    episode: EpisodeId,
    current: AgentState,
    history: Vec<Transition>,
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateMachine {
    pub fn new() -> Self {
        Self {
            episode: EpisodeId::new(),
            current: AgentState::Idle,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> AgentState {
        self.current
    }

    pub fn episode(&self) -> &EpisodeId {
        &self.episode
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Moves to `to`.
    ///
    /// Returns `Ok(None)` without recording anything when already in `to`,
    /// and an error, leaving the state untouched, for a denied edge.
    pub fn transition(
        &mut self,
        to: AgentState,
        reason: impl Into<String>,
    ) -> Result<Option<Transition>, StateError> {
        let from = self.current;
        if from == to {
            return Ok(None);
        }

        if !allowed(from, to) {
            warn!(episode = %self.episode, from = %from, to = %to, "rejected state transition");
            return Err(StateError::Denied { from, to });
        }

        Ok(Some(self.record(to, reason.into())))
    }

    /// Leaves a finished or failed episode for Idle and starts a new one.
    /// This is the only way out of Failed toward Acting.
    ///
    /// An Idle machine just gets a new episode. Any other state is still
    /// mid-episode and is refused; move it to Failed first.
    pub fn reset(&mut self, reason: impl Into<String>) -> Result<Option<Transition>, StateError> {
        match self.current {
            AgentState::Idle => {
                self.episode = EpisodeId::new();
                Ok(None)
            }
            state if state.is_terminal() => {
                self.episode = EpisodeId::new();
                Ok(Some(self.record(AgentState::Idle, reason.into())))
            }
            state => Err(StateError::NotTerminal(state)),
        }
    }

    fn record(&mut self, to: AgentState, reason: String) -> Transition {
        let transition = Transition {
            from: self.current,
            to,
            reason,
            at: Utc::now(),
        };
        info!(
            episode = %self.episode,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "state transition"
        );
        self.current = to;
        self.history.push(transition.clone());
        transition
    }
}
