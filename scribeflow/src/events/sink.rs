//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

/// Receives run lifecycle events.
///
/// Sinks must never fail the run: errors inside a sink are the sink's own
/// business and are logged, not returned.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - One of the names in [`super::kinds`]
    /// * `data` - Event payload
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without awaiting.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// Writes events to the `tracing` subscriber.
///
/// Failure events (`*.failed`, `*.cancelled`) are always logged at WARN;
/// everything else at the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&serde_json::Value>) {
        let run_id = data
            .and_then(|d| d.get("run_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let stage = data
            .and_then(|d| d.get("stage"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        if event_type.ends_with(".failed") || event_type.ends_with(".cancelled") {
            warn!(event_type, run_id, stage, event_data = ?data, "Event: {event_type}");
        } else if self.level == Level::DEBUG {
            debug!(event_type, run_id, stage, event_data = ?data, "Event: {event_type}");
        } else {
            info!(event_type, run_id, stage, event_data = ?data, "Event: {event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Records every event in memory; used by tests and embedders that poll.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Returns only the event types, in emission order.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type is exactly `event_type`.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<Option<serde_json::Value>> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Returns the stages named by events of `event_type`, in order.
    #[must_use]
    pub fn stages_of_type(&self, event_type: &str) -> Vec<String> {
        self.events_of_type(event_type)
            .into_iter()
            .filter_map(|d| d?.get("stage")?.as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit("run.started", None).await;
        let sink = LoggingEventSink::debug();
        sink.emit("stage.completed", Some(json!({"run_id": "r1", "stage": "clean"})))
            .await;
        sink.try_emit("stage.failed", Some(json!({"stage": "clean", "error": "boom"})));
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("stage.started", Some(json!({"stage": "parse"}))).await;
        sink.try_emit("stage.cached", Some(json!({"stage": "transcribe"})));
        sink.try_emit("stage.started", Some(json!({"stage": "clean"})));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.types(), vec!["stage.started", "stage.cached", "stage.started"]);
        assert_eq!(sink.stages_of_type("stage.started"), vec!["parse", "clean"]);
        assert_eq!(sink.events_of_type("stage.cached").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
