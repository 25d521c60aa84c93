//! Client-facing progress events.

use serde::{Deserialize, Serialize};

/// Kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    /// Periodic update while stages are in flight.
    Tick,
    /// A stage finished (executed, cached, or skipped).
    StageFinished,
    /// Terminal event: the run completed.
    Completed,
    /// Terminal event: the run failed or was cancelled.
    Failed,
}

/// A progress update for an in-flight run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// What triggered the event.
    pub kind: ProgressEventKind,
    /// Overall completion, 0 to 100.
    pub overall_progress_percent: f64,
    /// The in-flight stage; concurrent stages are joined with `+`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Estimated seconds until the in-flight stage(s) finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<f64>,
    /// Seconds since the run started.
    pub elapsed_seconds: f64,
    /// Failure description, for `Failed` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    /// Returns true for `Completed` and `Failed` events.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ProgressEventKind::Completed | ProgressEventKind::Failed
        )
    }
}

/// Sending half of a client progress channel.
pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

/// Receiving half of a client progress channel.
pub type ProgressReceiver = tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>;

/// Creates a progress channel.
#[must_use]
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
