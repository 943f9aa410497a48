//! Phase-transition events.
//!
//! Events are data, not log lines. The orchestrator pushes them onto an
//! unbounded channel so a slow observer can never stall a pipeline, and keeps
//! each scene's transitions on its run record.

use std::fmt;

use chrono::{DateTime, Utc};
use rigour_proto::ExecutionStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Per-scene pipeline state.
///
/// `Planned -> Executed -> Judged -> [Healing -> Reexecuted]? -> [Exploring]? -> Complete`,
/// with `Error` reachable from any phase and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Planned,
    Executed,
    Judged,
    Healing,
    Reexecuted,
    Exploring,
    Complete,
    Error,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Planned => "planned",
            PipelineState::Executed => "executed",
            PipelineState::Judged => "judged",
            PipelineState::Healing => "healing",
            PipelineState::Reexecuted => "reexecuted",
            PipelineState::Exploring => "exploring",
            PipelineState::Complete => "complete",
            PipelineState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::{
            Complete, Error, Executed, Exploring, Healing, Judged, Planned, Reexecuted,
        };
        match (self, next) {
            (Complete | Error, _) => false,
            (_, Error) => true,
            (Planned, Executed)
            | (Executed, Judged)
            | (Judged, Healing | Exploring | Complete)
            | (Healing, Reexecuted | Exploring | Complete)
            | (Reexecuted, Judged)
            | (Exploring, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pipeline phase in which something happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Execute,
    /// Re-execution of a repaired artifact.
    Heal,
    Explore,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Heal => "heal",
            Phase::Explore => "explore",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change of a scene pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub scene_id: String,
    /// Position of the scene in the batch input.
    pub index: usize,
    pub from: Option<PipelineState>,
    pub to: PipelineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Events emitted while a batch runs, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseEvent {
    BatchStarted {
        total: usize,
        concurrent: bool,
    },
    Transition(StateTransition),
    SceneFinished {
        scene_id: String,
        index: usize,
        state: PipelineState,
        status: Option<ExecutionStatus>,
        healed: bool,
        children: usize,
        duration_ms: u64,
    },
    BatchFinished {
        total: usize,
        duration_ms: u64,
    },
}

pub type EventSender = mpsc::UnboundedSender<PhaseEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PhaseEvent>;

/// Creates the channel an observer drains.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
