use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::Stage;

/// How a failed stage or leaf call affects the rest of the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Fill the stage output with a flagged placeholder and keep going.
    Recoverable,
    /// Abort the run without an audit record.
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{stage} stage failed ({}): {reason}", .kind.as_str())]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub reason: String,
}

impl StageFailure {
    pub fn recoverable(stage: Stage, reason: impl Into<String>) -> Self {
        Self { stage, kind: FailureKind::Recoverable, reason: reason.into() }
    }

    pub fn fatal(stage: Stage, reason: impl Into<String>) -> Self {
        Self { stage, kind: FailureKind::Fatal, reason: reason.into() }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == FailureKind::Fatal
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("context field `{0}` was already committed")]
    AlreadyCommitted(&'static str),
    #[error("context field `{field}` cannot be committed before `{missing}`")]
    OutOfOrder { field: &'static str, missing: &'static str },
    #[error("context is already terminal ({0})")]
    Terminal(&'static str),
}

impl ContextError {
    /// A context write that breaks ordering is an orchestration bug, so it is
    /// always fatal for the stage that attempted it.
    pub fn into_stage_failure(self, stage: Stage) -> StageFailure {
        StageFailure::fatal(stage, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{ContextError, FailureKind, StageFailure};
    use crate::pipeline::Stage;

    #[test]
    fn stage_failure_display_names_stage_and_kind() {
        let failure = StageFailure::recoverable(Stage::Records, "records store unreachable");
        assert_eq!(
            failure.to_string(),
            "records stage failed (recoverable): records store unreachable"
        );
        assert!(!failure.is_fatal());
    }

    #[test]
    fn context_errors_map_to_fatal_stage_failures() {
        let failure = ContextError::AlreadyCommitted("policies").into_stage_failure(Stage::Policy);
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert!(failure.reason.contains("policies"));
    }
}
