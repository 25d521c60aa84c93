//! Spans and structured event payloads for runs and stages.

use crate::core::StageDisposition;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info_span, Span};

/// Span covering one run.
#[must_use]
pub fn run_span(run_id: &str) -> Span {
    info_span!("run", run_id = %run_id)
}

/// Span covering one stage of a run.
#[must_use]
pub fn stage_span(run_id: &str, stage: &str) -> Span {
    info_span!("stage", run_id = %run_id, stage = %stage, version = tracing::field::Empty)
}

/// Attributes attached to stage lifecycle events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSpanAttributes {
    /// Run identifier.
    pub run_id: String,
    /// Stage name.
    pub stage: String,
    /// How the stage was satisfied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<StageDisposition>,
    /// Cache version read or written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Wall-clock duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Estimated duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate_seconds: Option<f64>,
    /// Error message if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage of a run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            ..Default::default()
        }
    }

    /// Sets the disposition.
    #[must_use]
    pub fn with_disposition(mut self, disposition: StageDisposition) -> Self {
        self.disposition = Some(disposition);
        self
    }

    /// Sets the cache version.
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the estimate.
    #[must_use]
    pub fn with_estimate_seconds(mut self, estimate_seconds: f64) -> Self {
        self.estimate_seconds = Some(estimate_seconds);
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Converts to an event payload.
    #[must_use]
    pub fn to_event_data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "run_id": self.run_id, "stage": self.stage })
        })
    }
}

/// Measures wall-clock time of a span.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_data_skips_unset_fields() {
        let data = StageSpanAttributes::new("r1", "clean")
            .with_disposition(StageDisposition::Executed)
            .with_version(3)
            .to_event_data();

        assert_eq!(
            data,
            json!({"run_id": "r1", "stage": "clean", "disposition": "executed", "version": 3})
        );
    }

    #[test]
    fn test_error_attributes() {
        let data = StageSpanAttributes::new("r1", "summarize")
            .with_error("rate limited")
            .with_duration_ms(12.5)
            .to_event_data();
        assert_eq!(data["error"], "rate limited");
        assert_eq!(data["duration_ms"], 12.5);
    }

    #[test]
    fn test_span_timer_advances() {
        let timer = SpanTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.elapsed_ms() >= 1.0);
    }

    #[test]
    fn test_spans_construct_without_subscriber() {
        let span = stage_span("r1", "clean");
        span.record("version", 2);
        let _run = run_span("r1");
    }
}
