//! Stages with scripted behaviour for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::StageConfig;
use crate::context::StageContext;
use crate::core::StageResult;
use crate::errors::StageError;
use crate::stages::Stage;

/// Tracks how many stages run at the same time.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    /// Creates a shared gauge.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of simultaneously active stages observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A stage that records its calls and returns a deterministic payload.
///
/// The payload is `{"stage": name, "call": n, "inputs": [...]}` where
/// `inputs` lists the stages visible in the context.
#[derive(Debug)]
pub struct MockStage {
    name: String,
    delay: Option<Duration>,
    provenance: Option<String>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<String>>>,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl MockStage {
    /// Creates a mock stage that succeeds immediately.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: None,
            provenance: None,
            failures_left: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            gauge: None,
        }
    }

    /// Sleeps (asynchronously) for `delay` on every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Tags every result with a provenance string.
    #[must_use]
    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        self.provenance = Some(provenance.into());
        self
    }

    /// Reports start and end of every call to `gauge`.
    #[must_use]
    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Makes the next `count` calls fail.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns the context stage names seen on each call.
    #[must_use]
    pub fn seen_inputs(&self) -> Vec<Vec<String>> {
        self.seen.lock().clone()
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let inputs: Vec<String> = ctx.stages().map(str::to_string).collect();
        self.seen.lock().push(inputs.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(format!("{} failed on call {call}", self.name).into());
        }

        let result = StageResult::new(json!({ "stage": self.name, "call": call, "inputs": inputs }));
        Ok(match &self.provenance {
            Some(p) => result.with_provenance(p.clone()),
            None => result,
        })
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn execute(&self, ctx: &StageContext, _config: &StageConfig) -> Result<StageResult, StageError> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        let result = self.run(ctx).await;
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        result
    }
}

/// A stage that always fails.
#[derive(Debug)]
pub struct FailingStage {
    error: String,
}

impl FailingStage {
    /// Creates a new failing stage.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

#[async_trait]
impl Stage for FailingStage {
    async fn execute(&self, _ctx: &StageContext, _config: &StageConfig) -> Result<StageResult, StageError> {
        Err(self.error.clone().into())
    }
}

/// A stage that waits on the async scheduler before succeeding.
#[derive(Debug)]
pub struct SlowStage {
    delay: Duration,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Creates a slow stage with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Stage for SlowStage {
    async fn execute(&self, _ctx: &StageContext, _config: &StageConfig) -> Result<StageResult, StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(StageResult::text("slow"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMetadata;

    fn ctx() -> StageContext {
        StageContext::new(RunMetadata::new("r1")).with_output("parse", json!({}))
    }

    #[tokio::test]
    async fn test_mock_stage_records_calls() {
        let stage = MockStage::new("clean").with_provenance("v1");
        let result = stage.execute(&ctx(), &StageConfig::default()).await.unwrap();

        assert_eq!(result.payload["stage"], "clean");
        assert_eq!(result.payload["call"], 1);
        assert_eq!(result.payload["inputs"], json!(["parse"]));
        assert_eq!(result.provenance.as_deref(), Some("v1"));
        assert_eq!(stage.call_count(), 1);
        assert_eq!(stage.seen_inputs(), vec![vec!["parse".to_string()]]);
    }

    #[tokio::test]
    async fn test_mock_stage_scripted_failures() {
        let stage = MockStage::new("summarize");
        stage.fail_next(2);

        assert!(stage.execute(&ctx(), &StageConfig::default()).await.is_err());
        assert!(stage.execute(&ctx(), &StageConfig::default()).await.is_err());
        assert!(stage.execute(&ctx(), &StageConfig::default()).await.is_ok());
        assert_eq!(stage.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_and_slow_stages() {
        let err = FailingStage::new("rate limited")
            .execute(&ctx(), &StageConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "rate limited");

        let start = std::time::Instant::now();
        SlowStage::with_delay_ms(10)
            .execute(&ctx(), &StageConfig::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_gauge_tracks_peak() {
        let gauge = ConcurrencyGauge::new();
        let a = MockStage::new("a")
            .with_delay(Duration::from_millis(20))
            .with_gauge(Arc::clone(&gauge));
        let b = MockStage::new("b")
            .with_delay(Duration::from_millis(20))
            .with_gauge(Arc::clone(&gauge));

        let config = StageConfig::default();
        let context = ctx();
        let (ra, rb) = tokio::join!(a.execute(&context, &config), b.execute(&context, &config));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(gauge.peak(), 2);
    }
}
