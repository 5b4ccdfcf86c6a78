use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::RequestContext;
use crate::errors::StageFailure;

/// The four processing stages, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Policy,
    Records,
    Action,
    Audit,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Policy, Stage::Records, Stage::Action, Stage::Audit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Records => "records",
            Self::Action => "action",
            Self::Audit => "audit",
        }
    }

    /// Short agent code used in operator-facing output.
    pub fn agent_code(&self) -> &'static str {
        match self {
            Self::Policy => "A1",
            Self::Records => "A3",
            Self::Action => "A5",
            Self::Audit => "A7",
        }
    }

    /// The state a run reaches once this stage has committed its output.
    pub fn completes_into(&self) -> PipelineState {
        match self {
            Self::Policy => PipelineState::PolicyRetrieved,
            Self::Records => PipelineState::RecordsAggregated,
            Self::Action => PipelineState::ActionTaken,
            Self::Audit => PipelineState::Audited,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Start,
    PolicyRetrieved,
    RecordsAggregated,
    ActionTaken,
    Audited,
    Aborted,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PolicyRetrieved => "policy_retrieved",
            Self::RecordsAggregated => "records_aggregated",
            Self::ActionTaken => "action_taken",
            Self::Audited => "audited",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Audited | Self::Aborted)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        matches!(
            (self, next),
            (Self::Start, Self::PolicyRetrieved)
                | (Self::PolicyRetrieved, Self::RecordsAggregated)
                | (Self::RecordsAggregated, Self::ActionTaken)
                | (Self::ActionTaken, Self::Audited)
                | (Self::Start, Self::Aborted)
                | (Self::PolicyRetrieved, Self::Aborted)
                | (Self::RecordsAggregated, Self::Aborted)
                | (Self::ActionTaken, Self::Aborted)
        )
    }

    pub fn transition_to(&mut self, next: PipelineState) -> Result<(), InvalidStateTransition> {
        if self.can_transition_to(next) {
            *self = next;
            return Ok(());
        }

        Err(InvalidStateTransition { from: *self, to: next })
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("invalid pipeline transition from {from} to {to}")]
pub struct InvalidStateTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    Cancelled,
    Error { failure: StageFailure },
}

impl TerminationReason {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Error { .. } => "error",
        }
    }
}

/// A run that ended without an audit record. Carries the partial context for
/// diagnostics.
#[derive(Clone, Debug, Error, Serialize)]
#[error("pipeline run {} ended in {} after reaching {last_state}", .context.request_id(), .reason.tag())]
pub struct TerminalFailure {
    pub last_state: PipelineState,
    pub reason: TerminationReason,
    pub context: Box<RequestContext>,
}

impl TerminalFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.reason, TerminationReason::Cancelled)
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match &self.reason {
            TerminationReason::Error { failure } => Some(failure),
            TerminationReason::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineState, Stage};

    #[test]
    fn states_advance_strictly_in_stage_order() {
        let mut state = PipelineState::Start;
        for stage in Stage::ORDER {
            state.transition_to(stage.completes_into()).expect("forward transition");
        }
        assert_eq!(state, PipelineState::Audited);
        assert!(state.is_terminal());
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let mut state = PipelineState::Start;
        let error = state.transition_to(PipelineState::ActionTaken).expect_err("skip rejected");
        assert_eq!(error.from, PipelineState::Start);
        assert_eq!(state, PipelineState::Start);
    }

    #[test]
    fn abort_is_reachable_from_every_non_terminal_state() {
        for from in [
            PipelineState::Start,
            PipelineState::PolicyRetrieved,
            PipelineState::RecordsAggregated,
            PipelineState::ActionTaken,
        ] {
            assert!(from.can_transition_to(PipelineState::Aborted));
        }
        assert!(!PipelineState::Audited.can_transition_to(PipelineState::Aborted));
        assert!(!PipelineState::Aborted.can_transition_to(PipelineState::PolicyRetrieved));
    }
}
