//! Run lifecycle events.
//!
//! The orchestrator reports what happens in a run through an [`EventSink`].
//! Events are structured JSON so they can be logged, collected in tests, or
//! forwarded to an external analytics system.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod kinds {
    /// A run began resolving and executing stages.
    pub const RUN_STARTED: &str = "run.started";
    /// A run reached `Completed`.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run reached `Failed`.
    pub const RUN_FAILED: &str = "run.failed";
    /// A stage function was invoked.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage was satisfied by its current cached version.
    pub const STAGE_CACHED: &str = "stage.cached";
    /// An optional stage was skipped.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage function returned and its result was committed.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage function failed or timed out.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage was abandoned because the run was cancelled.
    pub const STAGE_CANCELLED: &str = "stage.cancelled";
    /// A new cache version was committed.
    pub const CACHE_COMMITTED: &str = "cache.committed";
    /// The current cache version of a stage was switched.
    pub const CACHE_CURRENT_CHANGED: &str = "cache.current_changed";
}
