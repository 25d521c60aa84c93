//! Run state machine and per-stage dispositions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a run.
///
/// `Idle -> Running -> ... -> Completed`, with `Failed` reachable from any
/// `Running` state. A run whose every stage is served from the cache may go
/// straight from `Idle` to `Completed`; a run that fails before its first
/// stage starts (e.g. an unknown target) goes from `Idle` to `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// No stage has started.
    #[default]
    Idle,
    /// One stage, or a batch of independent stages, is executing.
    Running {
        /// The in-flight stages.
        stages: Vec<String>,
    },
    /// Every requested stage has a current result.
    Completed,
    /// The run aborted.
    Failed {
        /// The stage that failed, if the failure was stage-level.
        stage: Option<String>,
    },
}

impl RunState {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Returns true if moving to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Idle, Self::Running { .. } | Self::Completed | Self::Failed { .. }) => true,
            (Self::Running { .. }, Self::Running { .. } | Self::Completed | Self::Failed { .. }) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running { stages } => write!(f, "running({})", stages.join("+")),
            Self::Completed => write!(f, "completed"),
            Self::Failed { stage: Some(stage) } => write!(f, "failed({stage})"),
            Self::Failed { stage: None } => write!(f, "failed"),
        }
    }
}

/// How a stage was satisfied within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDisposition {
    /// The stage function ran and a new cache version was committed.
    Executed,
    /// The current cached version was reused.
    Cached,
    /// The optional stage was skipped by its predicate.
    Skipped,
}

impl fmt::Display for StageDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executed => write!(f, "executed"),
            Self::Cached => write!(f, "cached"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(stage: &str) -> RunState {
        RunState::Running {
            stages: vec![stage.to_string()],
        }
    }

    #[test]
    fn test_legal_transitions() {
        assert!(RunState::Idle.can_transition_to(&running("parse")));
        assert!(running("parse").can_transition_to(&running("transcribe")));
        assert!(running("clean").can_transition_to(&RunState::Completed));
        assert!(running("clean").can_transition_to(&RunState::Failed {
            stage: Some("clean".into())
        }));
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(RunState::Completed.is_terminal());
        assert!(!RunState::Completed.can_transition_to(&running("parse")));
        let failed = RunState::Failed { stage: None };
        assert!(failed.is_terminal());
        assert!(!failed.can_transition_to(&RunState::Completed));
        assert!(!RunState::Completed.can_transition_to(&RunState::Idle));
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Idle.to_string(), "idle");
        let batch = RunState::Running {
            stages: vec!["summarize".into(), "chunk".into()],
        };
        assert_eq!(batch.to_string(), "running(summarize+chunk)");
        assert_eq!(
            RunState::Failed { stage: Some("clean".into()) }.to_string(),
            "failed(clean)"
        );
    }

    #[test]
    fn test_run_state_serialize() {
        let json = serde_json::to_value(running("parse")).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running", "stages": ["parse"]}));

        let json = serde_json::to_string(&StageDisposition::Cached).unwrap();
        assert_eq!(json, r#""cached""#);
    }
}
