//! # Scribeflow
//!
//! The execution core of a recording-to-text pipeline.
//!
//! Scribeflow turns a long recording into derived artifacts (transcript,
//! cleaned transcript, summary, chunks) through dependency-ordered stages,
//! several of which call slow external services. It provides:
//!
//! - **Stage registry**: typed registration with duplicate, unknown-dependency
//!   and cycle detection, and deterministic topological ordering
//! - **Versioned cache**: every stage output is kept as a numbered version;
//!   failed runs resume from the last committed stage and any stage can be
//!   rerun or switched back to an earlier version
//! - **Progress estimation**: a ticker per in-flight stage that never blocks
//!   on the work it reports on
//! - **Cancellation**: cooperative, with no partial commits
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scribeflow::prelude::*;
//!
//! let registry = StageRegistry::builder()
//!     .stage(StageDefinition::new("parse", ParseStage::new()))?
//!     .stage(StageDefinition::new("transcribe", TranscribeStage::new()).with_dependency("parse"))?
//!     .stage(StageDefinition::new("summarize", SummarizeStage::new()).with_dependency("transcribe"))?
//!     .build()?;
//!
//! let orchestrator = Orchestrator::new(registry, Arc::new(scribeflow::cache::filesystem("cache")));
//! let report = orchestrator
//!     .run(RunRequest::new(RunMetadata::new("meeting-42")), Arc::new(CancellationToken::new()), None)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheEntry, CacheManifest, CacheStore, CacheVersion, VersionedCache};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{RunConfig, ScribeflowConfig, StageConfig};
    pub use crate::context::{RunMetadata, StageContext};
    pub use crate::core::{
        progress_channel, ProgressEvent, ProgressEventKind, RunState, StageDisposition, StageResult,
    };
    pub use crate::errors::{
        CacheError, MissingDependencyOutputError, PipelineError, RegistryError, ScribeflowError,
        StageError, StageExecutionError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        ExecutionPlan, Orchestrator, RunReport, RunRequest, StageDefinition, StageRegistry, Targets,
    };
    pub use crate::progress::{CalibrationTable, CostModel, SizeMetric, WeightTable};
    pub use crate::stages::{AsyncFnStage, BlockingStage, FnStage, SkipPredicate, Stage};
}
