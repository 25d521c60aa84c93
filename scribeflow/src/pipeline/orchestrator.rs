//! Run orchestration.
//!
//! The orchestrator walks an [`ExecutionPlan`] batch by batch. For every
//! stage it either reuses the current cached version (resume), skips it
//! (optional stages only), or executes it with a progress ticker running
//! beside it and commits the result as a new cache version.

use super::{ExecutionPlan, StageDefinition, StageRegistry, Targets};
use crate::cache::{CacheStore, CacheVersion};
use crate::cancellation::CancellationToken;
use crate::config::{PipelineSettings, RunConfig, ScribeflowConfig, StageConfig};
use crate::context::{RunMetadata, StageContext};
use crate::core::{ProgressSender, RunState, StageDisposition, StageResult};
use crate::errors::{
    CacheError, ConfigError, PipelineError, RegistryError, StageCancelledError, StageError,
    StageExecutionError, StageTimeoutError,
};
use crate::events::{kinds, EventSink, NoOpEventSink};
use crate::observability::{run_span, stage_span, SpanTimer, StageSpanAttributes};
use crate::progress::{CalibrationTable, CostModel, MetadataSizeMetric, ProgressEstimator, SizeMetric, WeightTable};
use crate::stages::{NeverSkip, SkipPredicate};
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

/// What a caller asks the orchestrator to do.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Run identity and size hints.
    pub metadata: RunMetadata,
    /// The stages the caller needs.
    pub targets: Targets,
    /// Per-stage configuration for this run.
    pub config: RunConfig,
    /// Stages to execute even if a current cached version exists.
    pub rerun: BTreeSet<String>,
}

impl RunRequest {
    /// Requests every registered stage for a run.
    #[must_use]
    pub fn new(metadata: RunMetadata) -> Self {
        Self {
            metadata,
            targets: Targets::All,
            config: RunConfig::default(),
            rerun: BTreeSet::new(),
        }
    }

    /// Restricts the run to the given targets and their dependencies.
    #[must_use]
    pub fn with_targets(mut self, targets: impl Into<Targets>) -> Self {
        self.targets = targets.into();
        self
    }

    /// Sets the per-stage configuration.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Forces `stage` to execute and produce a new version.
    ///
    /// Stages downstream of it keep their current versions unless they are
    /// named as well.
    #[must_use]
    pub fn rerun(mut self, stage: impl Into<String>) -> Self {
        self.rerun.insert(stage.into());
        self
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The run identifier.
    pub run_id: String,
    /// Always `Completed` for a returned report.
    pub state: RunState,
    /// The final context with every planned, non-skipped output.
    pub context: StageContext,
    /// Stages whose functions ran, in fold order.
    pub executed: Vec<String>,
    /// Stages served from their current cached version.
    pub cached: Vec<String>,
    /// Optional stages that were skipped.
    pub skipped: Vec<String>,
    /// Cache version used for every executed or cached stage.
    pub versions: BTreeMap<String, u32>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunReport {
    fn new(run_id: &str, context: StageContext) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: RunState::Idle,
            context,
            executed: Vec::new(),
            cached: Vec::new(),
            skipped: Vec::new(),
            versions: BTreeMap::new(),
            duration: Duration::ZERO,
        }
    }

    /// How a stage was satisfied, if it was planned.
    #[must_use]
    pub fn disposition(&self, stage: &str) -> Option<StageDisposition> {
        let has = |list: &[String]| list.iter().any(|s| s == stage);
        if has(&self.executed) {
            Some(StageDisposition::Executed)
        } else if has(&self.cached) {
            Some(StageDisposition::Cached)
        } else if has(&self.skipped) {
            Some(StageDisposition::Skipped)
        } else {
            None
        }
    }
}

/// Why a stage invocation did not produce a result.
enum Interruption {
    Failed(StageError),
    Cancelled(String),
    TimedOut(Duration),
}

/// Result of one executed stage, before it is folded into the context.
enum StageOutcome {
    Executed { stage: String, version: u32, payload: serde_json::Value },
    Failed(StageFailure),
}

/// A stage that did not produce a committed result.
enum StageFailure {
    Error { stage: String, cause: StageError },
    Cancelled { stage: String, reason: String },
    Cache { stage: String, error: CacheError },
}

impl StageFailure {
    /// Lower ranks win when several stages of a batch fail.
    fn rank(&self) -> u8 {
        match self {
            Self::Cancelled { .. } => 0,
            Self::Error { .. } => 1,
            Self::Cache { .. } => 2,
        }
    }

    fn into_error(self, last_context: StageContext) -> PipelineError {
        match self {
            Self::Error { stage, cause } => {
                PipelineError::StageExecution(Box::new(StageExecutionError::new(stage, cause, last_context)))
            }
            Self::Cancelled { stage, reason } => {
                let cause = StageCancelledError {
                    stage: stage.clone(),
                    reason,
                };
                PipelineError::Cancelled(Box::new(StageExecutionError::new(
                    stage,
                    Box::new(cause),
                    last_context,
                )))
            }
            Self::Cache { stage, error } => {
                warn!(stage = %stage, error = %error, "Cache access failed");
                PipelineError::StageExecution(Box::new(StageExecutionError::new(
                    stage,
                    Box::new(error),
                    last_context,
                )))
            }
        }
    }
}

/// Drives runs over a stage registry and a cache store.
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    cache: Arc<dyn CacheStore>,
    cost_model: Arc<dyn CostModel>,
    size_metric: Arc<dyn SizeMetric>,
    skip_predicate: Arc<dyn SkipPredicate>,
    weights: WeightTable,
    settings: PipelineSettings,
    event_sink: Arc<dyn EventSink>,
    state: RwLock<RunState>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.registry.len())
            .field("cache", &self.cache)
            .field("weights", &self.weights)
            .field("settings", &self.settings)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with default collaborators.
    ///
    /// Defaults: the default calibration table as cost model, the run
    /// metadata's `input_size` as size metric, no skipping, equal weights,
    /// and no event sink.
    #[must_use]
    pub fn new(registry: StageRegistry, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            registry: Arc::new(registry),
            cache,
            cost_model: Arc::new(CalibrationTable::default()),
            size_metric: Arc::new(MetadataSizeMetric),
            skip_predicate: Arc::new(NeverSkip),
            weights: WeightTable::default(),
            settings: PipelineSettings::default(),
            event_sink: Arc::new(NoOpEventSink),
            state: RwLock::new(RunState::Idle),
        }
    }

    /// Builds an orchestrator from loaded configuration.
    ///
    /// Opens the configured cache and wires up the calibration table,
    /// weights, and pipeline settings.
    pub fn from_config(registry: StageRegistry, config: &ScribeflowConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = crate::cache::open(&config.cache)?;
        Ok(Self::new(registry, cache)
            .with_cost_model(config.calibration_table())
            .with_weights(config.weight_table()?)
            .with_settings(config.pipeline.clone()))
    }

    /// Sets the cost model.
    #[must_use]
    pub fn with_cost_model(mut self, model: impl CostModel + 'static) -> Self {
        self.cost_model = Arc::new(model);
        self
    }

    /// Sets the size metric fed to the cost model.
    #[must_use]
    pub fn with_size_metric(mut self, metric: impl SizeMetric + 'static) -> Self {
        self.size_metric = Arc::new(metric);
        self
    }

    /// Sets the skip predicate consulted for optional stages.
    #[must_use]
    pub fn with_skip_predicate(mut self, predicate: impl SkipPredicate + 'static) -> Self {
        self.skip_predicate = Arc::new(predicate);
        self
    }

    /// Sets the progress weights.
    #[must_use]
    pub fn with_weights(mut self, weights: WeightTable) -> Self {
        self.weights = weights;
        self
    }

    /// Sets the pipeline settings.
    #[must_use]
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// The state of the most recent run.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state.read().clone()
    }

    /// The stage registry.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// The cache store.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Executes a run.
    ///
    /// Stages with a current cached version are reused unless listed in
    /// `request.rerun`, so re-invoking a failed run resumes at the failed
    /// stage. Progress events go to `progress`; the stream ends with a
    /// `Completed` or `Failed` event.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`]. Stage-level failures carry the last
    /// context that was fully produced; nothing is committed for the failing
    /// stage.
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: Arc<CancellationToken>,
        progress: Option<ProgressSender>,
    ) -> Result<RunReport, PipelineError> {
        let span = run_span(&request.metadata.run_id);
        self.run_inner(request, cancel, progress).instrument(span).await
    }

    async fn run_inner(
        &self,
        request: RunRequest,
        cancel: Arc<CancellationToken>,
        progress: Option<ProgressSender>,
    ) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        *self.state.write() = RunState::Idle;
        let run_id = request.metadata.run_id.clone();

        info!(targets = ?request.targets, rerun = ?request.rerun, "Run started");
        self.event_sink
            .emit(
                kinds::RUN_STARTED,
                Some(json!({
                    "run_id": run_id,
                    "targets": format!("{:?}", request.targets),
                    "rerun": request.rerun,
                })),
            )
            .await;

        let plan = self.plan(&request);
        let weights = match &plan {
            Ok(plan) => self.weights.normalized_for(plan.stages().map(|s| s.name.as_str())),
            Err(_) => BTreeMap::new(),
        };
        let mut estimator = ProgressEstimator::new(weights, self.settings.tick_interval());
        if let Some(sender) = progress {
            estimator = estimator.with_sender(sender);
        }

        let result = match plan {
            Ok(plan) => self.execute_plan(&request, &plan, &estimator, &cancel).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(mut report) => {
                estimator.complete();
                self.transition(RunState::Completed);
                report.state = RunState::Completed;
                report.duration = started.elapsed();
                info!(
                    executed = report.executed.len(),
                    cached = report.cached.len(),
                    skipped = report.skipped.len(),
                    duration_ms = report.duration.as_secs_f64() * 1000.0,
                    "Run completed"
                );
                self.event_sink
                    .emit(
                        kinds::RUN_COMPLETED,
                        Some(json!({
                            "run_id": run_id,
                            "executed": report.executed,
                            "cached": report.cached,
                            "skipped": report.skipped,
                            "duration_ms": report.duration.as_secs_f64() * 1000.0,
                        })),
                    )
                    .await;
                Ok(report)
            }
            Err(error) => {
                let message = error.to_string();
                estimator.fail(message.clone());
                let stage = error.failed_stage().map(str::to_string);
                self.transition(RunState::Failed { stage: stage.clone() });
                warn!(stage = ?stage, error = %message, resumable = error.is_resumable(), "Run failed");
                self.event_sink
                    .emit(
                        kinds::RUN_FAILED,
                        Some(json!({
                            "run_id": run_id,
                            "stage": stage,
                            "error": message,
                            "resumable": error.is_resumable(),
                        })),
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Switches the current cached version of one stage.
    ///
    /// Never touches other stages: outputs computed from the previous
    /// version stay current until they are rerun. Returns true if the
    /// current version changed.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownStage` for unregistered stages and
    /// `CacheError::VersionNotFound` if the version does not exist.
    pub async fn select_version(&self, run_id: &str, stage: &str, version: u32) -> Result<bool, PipelineError> {
        if !self.registry.contains(stage) {
            return Err(RegistryError::UnknownStage(stage.to_string()).into());
        }
        let changed = self.cache.set_current(run_id, stage, version).await?;
        if changed {
            info!(run_id, stage, version, "Selected cache version");
            self.event_sink
                .emit(
                    kinds::CACHE_CURRENT_CHANGED,
                    Some(json!({ "run_id": run_id, "stage": stage, "version": version })),
                )
                .await;
        }
        Ok(changed)
    }

    fn plan(&self, request: &RunRequest) -> Result<ExecutionPlan, PipelineError> {
        if let Some(unknown) = request.rerun.iter().find(|s| !self.registry.contains(s)) {
            return Err(RegistryError::UnknownStage(unknown.clone()).into());
        }
        let order = match &request.targets {
            Targets::All => self.registry.resolve(&Targets::All)?,
            Targets::Stages(names) => self
                .registry
                .build_execution_order(names.iter().chain(request.rerun.iter()))?,
        };
        let plan = ExecutionPlan::from_order(order, self.settings.parallel);
        debug!(stages = ?plan.stage_names(), batches = plan.batches().len(), "Resolved execution plan");
        Ok(plan)
    }

    fn transition(&self, next: RunState) {
        let mut state = self.state.write();
        if !state.can_transition_to(&next) {
            warn!(from = %state, to = %next, "Unexpected run state transition");
        }
        *state = next;
    }

    async fn execute_plan(
        &self,
        request: &RunRequest,
        plan: &ExecutionPlan,
        estimator: &ProgressEstimator,
        cancel: &Arc<CancellationToken>,
    ) -> Result<RunReport, PipelineError> {
        let run_id = request.metadata.run_id.as_str();
        let mut ctx = StageContext::new(request.metadata.clone()).with_cancellation(Arc::clone(cancel));
        let mut report = RunReport::new(run_id, ctx.clone());

        for batch in plan.batches() {
            if cancel.is_cancelled() {
                let failure = StageFailure::Cancelled {
                    stage: batch.first().map(|s| s.name.clone()).unwrap_or_default(),
                    reason: cancel.reason().unwrap_or_default(),
                };
                return Err(failure.into_error(ctx));
            }

            let mut pending = Vec::with_capacity(batch.len());
            for def in batch {
                let stage = def.name.as_str();
                if def.optional && self.skip_predicate.should_skip(stage, &ctx) {
                    debug!(stage, "Skipping optional stage");
                    estimator.mark_settled(stage);
                    report.skipped.push(def.name.clone());
                    self.emit_stage(
                        kinds::STAGE_SKIPPED,
                        &StageSpanAttributes::new(run_id, stage).with_disposition(StageDisposition::Skipped),
                    )
                    .await;
                    continue;
                }

                if !request.rerun.contains(stage) {
                    let current = match self.cache.get_current(run_id, stage).await {
                        Ok(current) => current,
                        Err(error) => {
                            let failure = StageFailure::Cache {
                                stage: def.name.clone(),
                                error,
                            };
                            return Err(failure.into_error(ctx));
                        }
                    };
                    if let Some(entry) = current {
                        let version = entry.version.version;
                        debug!(stage, version, "Reusing cached version");
                        ctx = ctx.with_output(stage, entry.payload);
                        estimator.mark_settled(stage);
                        report.cached.push(def.name.clone());
                        report.versions.insert(def.name.clone(), version);
                        self.emit_stage(
                            kinds::STAGE_CACHED,
                            &StageSpanAttributes::new(run_id, stage)
                                .with_disposition(StageDisposition::Cached)
                                .with_version(version),
                        )
                        .await;
                        continue;
                    }
                }

                pending.push(Arc::clone(def));
            }

            if pending.is_empty() {
                continue;
            }

            self.transition(RunState::Running {
                stages: pending.iter().map(|s| s.name.clone()).collect(),
            });

            let base = ctx.clone();
            let outcomes = join_all(
                pending
                    .iter()
                    .map(|def| self.execute_stage(run_id, def, &base, request.config.for_stage(&def.name), estimator)),
            )
            .await;

            let mut failures = Vec::new();
            for outcome in outcomes {
                match outcome {
                    StageOutcome::Executed { stage, version, payload } => {
                        ctx = ctx.with_output(stage.clone(), payload);
                        report.versions.insert(stage.clone(), version);
                        report.executed.push(stage);
                    }
                    StageOutcome::Failed(failure) => failures.push(failure),
                }
            }

            if let Some(failure) = failures.into_iter().min_by_key(StageFailure::rank) {
                return Err(failure.into_error(ctx));
            }
        }

        report.context = ctx;
        Ok(report)
    }

    async fn execute_stage(
        &self,
        run_id: &str,
        def: &StageDefinition,
        ctx: &StageContext,
        config: StageConfig,
        estimator: &ProgressEstimator,
    ) -> StageOutcome {
        let stage = def.name.clone();
        let span = stage_span(run_id, &stage);
        let estimate = self
            .cost_model
            .estimate_seconds(&stage, self.size_metric.measure(&stage, ctx));
        let attributes = StageSpanAttributes::new(run_id, &stage).with_estimate_seconds(estimate);

        let ticker = estimator.start(&stage, estimate);
        let timer = SpanTimer::start();
        debug!(parent: &span, estimate_seconds = estimate, "Stage started");
        self.emit_stage(kinds::STAGE_STARTED, &attributes).await;

        let attempt = invoke(def, ctx, config, span.clone()).await;
        let attributes = attributes.with_duration_ms(timer.elapsed_ms());

        let result = match attempt {
            Ok(_) if ctx.is_cancelled() => {
                // Finished after the cancel signal; the result is discarded.
                estimator.stop(ticker, false);
                let reason = ctx.cancellation().reason().unwrap_or_default();
                return self.stage_cancelled(stage, reason, &attributes, &span).await;
            }
            Ok(result) => result,
            Err(Interruption::Cancelled(reason)) => {
                estimator.stop(ticker, false);
                return self.stage_cancelled(stage, reason, &attributes, &span).await;
            }
            Err(Interruption::TimedOut(timeout)) => {
                estimator.stop(ticker, false);
                let cause = StageTimeoutError {
                    stage: stage.clone(),
                    timeout,
                };
                return self.stage_failed(stage, Box::new(cause), &attributes, &span).await;
            }
            Err(Interruption::Failed(cause)) => {
                estimator.stop(ticker, false);
                return self.stage_failed(stage, cause, &attributes, &span).await;
            }
        };

        estimator.stop(ticker, true);
        let version = match self
            .cache
            .commit(run_id, &stage, &result.payload, result.provenance.as_deref())
            .await
        {
            Ok(version) => version,
            Err(error) => {
                self.emit_stage(
                    kinds::STAGE_FAILED,
                    &attributes.clone().with_error(error.to_string()),
                )
                .await;
                return StageOutcome::Failed(StageFailure::Cache { stage, error });
            }
        };

        self.stage_committed(&attributes, &version, &span).await;
        estimator.publish_stage_finished();
        StageOutcome::Executed {
            stage,
            version: version.version,
            payload: result.payload,
        }
    }

    async fn stage_committed(&self, attributes: &StageSpanAttributes, version: &CacheVersion, span: &Span) {
        span.record("version", version.version);
        info!(
            parent: span,
            version = version.version,
            duration_ms = ?attributes.duration_ms,
            "Stage completed"
        );
        let attributes = attributes
            .clone()
            .with_disposition(StageDisposition::Executed)
            .with_version(version.version);
        self.event_sink
            .emit(
                kinds::CACHE_COMMITTED,
                Some(json!({
                    "run_id": attributes.run_id,
                    "stage": attributes.stage,
                    "version": version.version,
                    "digest": version.digest,
                    "size_bytes": version.size_bytes,
                })),
            )
            .await;
        self.emit_stage(kinds::STAGE_COMPLETED, &attributes).await;
    }

    async fn stage_failed(
        &self,
        stage: String,
        cause: StageError,
        attributes: &StageSpanAttributes,
        span: &Span,
    ) -> StageOutcome {
        warn!(parent: span, error = %cause, "Stage failed");
        self.emit_stage(kinds::STAGE_FAILED, &attributes.clone().with_error(cause.to_string()))
            .await;
        StageOutcome::Failed(StageFailure::Error { stage, cause })
    }

    async fn stage_cancelled(
        &self,
        stage: String,
        reason: String,
        attributes: &StageSpanAttributes,
        span: &Span,
    ) -> StageOutcome {
        info!(parent: span, reason = %reason, "Stage cancelled");
        self.emit_stage(kinds::STAGE_CANCELLED, &attributes.clone().with_error(reason.clone()))
            .await;
        StageOutcome::Failed(StageFailure::Cancelled { stage, reason })
    }

    async fn emit_stage(&self, kind: &str, attributes: &StageSpanAttributes) {
        self.event_sink.emit(kind, Some(attributes.to_event_data())).await;
    }
}

/// Runs the stage function on its own task and waits for it, the run's
/// cancel signal, or the stage timeout, whichever comes first.
///
/// The task is aborted when the wait is abandoned. Work already handed to
/// the blocking pool finishes in the background and its result is dropped.
async fn invoke(
    def: &StageDefinition,
    ctx: &StageContext,
    config: StageConfig,
    span: Span,
) -> Result<StageResult, Interruption> {
    let runner = Arc::clone(&def.runner);
    let task_ctx = ctx.clone();
    let mut task = tokio::spawn(
        async move { runner.execute(&task_ctx, &config).await }.instrument(span),
    );

    let cancel = ctx.cancellation();
    let timeout = def.timeout;
    let deadline = async move {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(cause)) => Err(Interruption::Failed(cause)),
            Err(join_error) => Err(Interruption::Failed(
                format!("stage '{}' task failed: {join_error}", def.name).into(),
            )),
        },
        () = cancel.cancelled() => {
            task.abort();
            Err(Interruption::Cancelled(cancel.reason().unwrap_or_default()))
        }
        () = deadline => {
            task.abort();
            Err(Interruption::TimedOut(timeout.unwrap_or_default()))
        }
    }
}
