//! Concurrent progress estimation.
//!
//! A ticker is a spawned task that wakes at a fixed interval and publishes an
//! overall-progress event. It runs on its own task, independent of the stage
//! it reports on, so a slow stage never delays its own progress reports as
//! long as the stage does not hog the ticker's worker thread (blocking stage
//! work goes through `spawn_blocking`, see [`FnStage`](crate::stages::FnStage)).

use crate::core::{ProgressEvent, ProgressEventKind, ProgressSender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Highest fraction a running stage may report.
pub const MAX_RUNNING_FRACTION: f64 = 0.99;

const COMPLETE_PERCENT: f64 = 100.0;

/// Fraction of a stage completed after `elapsed`, given its cost estimate.
///
/// Clamped to [`MAX_RUNNING_FRACTION`] so a stage that overruns its estimate
/// never reports completion before it has returned.
#[must_use]
pub fn fraction_complete(elapsed: Duration, estimate_seconds: f64) -> f64 {
    if !estimate_seconds.is_finite() || estimate_seconds <= 0.0 {
        return MAX_RUNNING_FRACTION;
    }
    (elapsed.as_secs_f64() / estimate_seconds).clamp(0.0, MAX_RUNNING_FRACTION)
}

#[derive(Debug)]
struct InFlight {
    stage: String,
    started: Instant,
    estimate_seconds: f64,
    weight: f64,
}

impl InFlight {
    fn fraction(&self, now: Instant) -> f64 {
        fraction_complete(now.saturating_duration_since(self.started), self.estimate_seconds)
    }

    fn remaining_seconds(&self, now: Instant) -> f64 {
        (self.estimate_seconds - now.saturating_duration_since(self.started).as_secs_f64()).max(0.0)
    }
}

#[derive(Debug)]
struct ProgressState {
    weights: BTreeMap<String, f64>,
    completed: BTreeSet<String>,
    completed_weight: f64,
    /// In start order; concurrent stages share one combined entry.
    in_flight: Vec<InFlight>,
    /// Cached sum of the in-flight weights.
    group_weight: f64,
    high_water: f64,
    run_started: Instant,
    finished: bool,
    /// Sending under the state lock keeps the channel in computation order.
    sender: Option<ProgressSender>,
}

impl ProgressState {
    fn weight_of(&self, stage: &str) -> f64 {
        self.weights.get(stage).copied().unwrap_or(0.0)
    }

    fn recompute_group_weight(&mut self) {
        self.group_weight = self.in_flight.iter().map(|f| f.weight).sum();
    }

    fn settle(&mut self, stage: &str) {
        if self.completed.insert(stage.to_string()) {
            self.completed_weight += self.weight_of(stage);
        }
    }

    fn overall(&mut self, now: Instant) -> f64 {
        if self.finished {
            return self.high_water;
        }
        let in_flight_fraction = self
            .in_flight
            .iter()
            .map(|f| f.fraction(now))
            .fold(0.0_f64, f64::max);
        let raw = self
            .group_weight
            .mul_add(in_flight_fraction, self.completed_weight)
            .min(COMPLETE_PERCENT);
        if raw > self.high_water {
            self.high_water = raw;
        }
        self.high_water
    }

    fn current_stage(&self) -> Option<String> {
        if self.in_flight.is_empty() {
            None
        } else {
            Some(
                self.in_flight
                    .iter()
                    .map(|f| f.stage.as_str())
                    .collect::<Vec<_>>()
                    .join("+"),
            )
        }
    }

    fn event(&mut self, kind: ProgressEventKind, error: Option<String>) -> ProgressEvent {
        let now = Instant::now();
        let remaining = self
            .in_flight
            .iter()
            .map(|f| f.remaining_seconds(now))
            .reduce(f64::max);
        ProgressEvent {
            kind,
            overall_progress_percent: self.overall(now),
            current_stage: self.current_stage(),
            estimated_seconds_remaining: remaining,
            elapsed_seconds: now.saturating_duration_since(self.run_started).as_secs_f64(),
            error,
        }
    }

    fn emit(&mut self, kind: ProgressEventKind, error: Option<String>) -> ProgressEvent {
        let event = self.event(kind, error);
        if let Some(tx) = &self.sender {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(event.clone());
        }
        event
    }

    /// The first in-flight stage leads; only its ticker publishes.
    fn is_leader(&self, stage: &str) -> bool {
        self.in_flight.first().is_some_and(|f| f.stage == stage)
    }
}

/// Shortest tick interval; `tokio::time::interval` rejects zero.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Computes and periodically publishes overall completion of one run.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    state: Arc<Mutex<ProgressState>>,
    tick_interval: Duration,
}

impl ProgressEstimator {
    /// Creates an estimator over stage weights that sum to 100.
    ///
    /// Intervals below one millisecond are raised to one millisecond.
    #[must_use]
    pub fn new(weights: BTreeMap<String, f64>, tick_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProgressState {
                weights,
                completed: BTreeSet::new(),
                completed_weight: 0.0,
                in_flight: Vec::new(),
                group_weight: 0.0,
                high_water: 0.0,
                run_started: Instant::now(),
                finished: false,
                sender: None,
            })),
            tick_interval: tick_interval.max(MIN_TICK_INTERVAL),
        }
    }

    /// Publishes events to a client channel.
    #[must_use]
    pub fn with_sender(self, sender: ProgressSender) -> Self {
        self.state.lock().sender = Some(sender);
        self
    }

    /// Begins ticking for a stage expected to take `estimate_seconds`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, stage: &str, estimate_seconds: f64) -> TickerHandle {
        {
            let mut state = self.state.lock();
            let weight = state.weight_of(stage);
            state.in_flight.push(InFlight {
                stage: stage.to_string(),
                started: Instant::now(),
                estimate_seconds,
                weight,
            });
            state.recompute_group_weight();
        }

        let state = Arc::clone(&self.state);
        let interval = self.tick_interval;
        let ticker_stage = stage.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let percent = {
                    let mut state = state.lock();
                    if !state.is_leader(&ticker_stage) {
                        continue;
                    }
                    state.emit(ProgressEventKind::Tick, None).overall_progress_percent
                };
                trace!(stage = %ticker_stage, percent, "Progress tick");
            }
        });

        TickerHandle {
            stage: stage.to_string(),
            state: Arc::clone(&self.state),
            task: Some(task),
        }
    }

    /// Stops a ticker.
    ///
    /// On success the stage contributes exactly its full weight from now on;
    /// on failure its partial contribution is dropped (the reported overall
    /// value never goes backwards, it just stops advancing).
    pub fn stop(&self, handle: TickerHandle, success: bool) {
        handle.finish(success);
    }

    /// Records a stage that finished without ticking (served from cache or
    /// skipped) and publishes a `StageFinished` event.
    pub fn mark_settled(&self, stage: &str) {
        let mut state = self.state.lock();
        state.settle(stage);
        state.emit(ProgressEventKind::StageFinished, None);
    }

    /// Publishes a `StageFinished` event for the current state.
    pub fn publish_stage_finished(&self) {
        self.state.lock().emit(ProgressEventKind::StageFinished, None);
    }

    /// Overall completion in percent.
    #[must_use]
    pub fn overall_progress(&self) -> f64 {
        self.state.lock().overall(Instant::now())
    }

    /// Current fraction of an in-flight stage.
    #[must_use]
    pub fn fraction(&self, stage: &str) -> Option<f64> {
        let now = Instant::now();
        self.state
            .lock()
            .in_flight
            .iter()
            .find(|f| f.stage == stage)
            .map(|f| f.fraction(now))
    }

    /// Returns the in-flight stage label, if any.
    #[must_use]
    pub fn current_stage(&self) -> Option<String> {
        self.state.lock().current_stage()
    }

    /// Builds an event describing the current state without publishing it.
    #[must_use]
    pub fn snapshot(&self, kind: ProgressEventKind) -> ProgressEvent {
        self.state.lock().event(kind, None)
    }

    /// Snaps progress to exactly 100 and publishes the terminal `Completed` event.
    pub fn complete(&self) -> ProgressEvent {
        let mut state = self.state.lock();
        state.in_flight.clear();
        state.recompute_group_weight();
        state.high_water = COMPLETE_PERCENT;
        state.finished = true;
        state.emit(ProgressEventKind::Completed, None)
    }

    /// Publishes the terminal `Failed` event.
    pub fn fail(&self, error: impl Into<String>) -> ProgressEvent {
        let mut state = self.state.lock();
        state.overall(Instant::now());
        state.in_flight.clear();
        state.recompute_group_weight();
        state.finished = true;
        state.emit(ProgressEventKind::Failed, Some(error.into()))
    }
}

/// Handle to a running ticker.
///
/// Dropping the handle without calling [`ProgressEstimator::stop`] stops the
/// ticker as a failure.
#[derive(Debug)]
pub struct TickerHandle {
    stage: String,
    state: Arc<Mutex<ProgressState>>,
    task: Option<JoinHandle<()>>,
}

impl TickerHandle {
    /// The stage this ticker reports on.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    fn finish(mut self, success: bool) {
        self.shutdown(success);
    }

    fn shutdown(&mut self, success: bool) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();

        let mut state = self.state.lock();
        let now = Instant::now();
        // Fold the current value into the high-water mark before the group
        // shrinks, so removing an in-flight entry cannot lower the report.
        state.overall(now);
        state.in_flight.retain(|f| f.stage != self.stage);
        state.recompute_group_weight();
        if success {
            state.settle(&self.stage);
        }
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}
