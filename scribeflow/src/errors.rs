//! Error types for the scribeflow pipeline core.
//!
//! Configuration-time errors (`RegistryError` and the types it wraps) are
//! fatal and indicate a registration bug. Runtime errors (`PipelineError`)
//! abort only the current run; everything committed before the failure stays
//! in the cache and the run can be resumed.

use crate::context::StageContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by stage functions.
pub type StageError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The crate-wide error type.
#[derive(Debug, Error)]
pub enum ScribeflowError {
    /// Stage registration or ordering failed.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The cache store failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// A pipeline run failed.
    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "REGISTRY-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Raised when a stage name is registered twice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' is already registered")]
pub struct DuplicateStageError {
    /// The duplicated stage name.
    pub stage: String,
}

/// Raised when a stage depends on a name that was never registered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
pub struct UnknownDependencyError {
    /// The stage declaring the dependency.
    pub stage: String,
    /// The unregistered dependency name.
    pub dependency: String,
}

/// Raised when the dependency graph contains a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CycleError {
    /// The stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CycleError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

/// Errors raised while registering stages or resolving an execution order.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A stage name was registered twice.
    #[error("{0}")]
    Duplicate(#[from] DuplicateStageError),

    /// A dependency does not resolve to a registered stage.
    #[error("{0}")]
    UnknownDependency(#[from] UnknownDependencyError),

    /// The dependency graph is cyclic.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// A requested stage was never registered.
    #[error("Requested stage '{0}' is not registered")]
    UnknownStage(String),

    /// A stage definition is malformed.
    #[error("Invalid stage definition '{stage}': {reason}")]
    InvalidDefinition {
        /// The stage name.
        stage: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl RegistryError {
    /// Returns diagnostic information for this error.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        match self {
            Self::Duplicate(e) => ContractErrorInfo::new("REGISTRY-DUPLICATE", e.to_string())
                .with_fix_hint("Give every stage a unique name or drop the second registration.")
                .with_context_entry("stage", &e.stage),
            Self::UnknownDependency(e) => {
                ContractErrorInfo::new("REGISTRY-UNKNOWN-DEP", e.to_string())
                    .with_fix_hint("Register the dependency or fix the typo in `depends_on`.")
                    .with_context_entry("stage", &e.stage)
                    .with_context_entry("dependency", &e.dependency)
            }
            Self::Cycle(e) => ContractErrorInfo::new("REGISTRY-CYCLE", e.to_string())
                .with_fix_hint("Remove one of the dependencies in the cycle to break it.")
                .with_context_entry("cycle", e.cycle_path.join(" -> ")),
            Self::UnknownStage(stage) => {
                ContractErrorInfo::new("REGISTRY-UNKNOWN-STAGE", self.to_string())
                    .with_fix_hint("Only request stages that were registered at startup.")
                    .with_context_entry("stage", stage)
            }
            Self::InvalidDefinition { stage, .. } => {
                ContractErrorInfo::new("REGISTRY-INVALID", self.to_string())
                    .with_context_entry("stage", stage)
            }
        }
    }
}

/// Raised by a stage that needs the output of a skipped optional stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' requires output of '{dependency}', which is not in the context")]
pub struct MissingDependencyOutputError {
    /// The stage that needed the output.
    pub stage: String,
    /// The dependency whose output is absent.
    pub dependency: String,
}

/// Raised when a stage invocation exceeds its configured timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' timed out after {timeout:?}")]
pub struct StageTimeoutError {
    /// The stage name.
    pub stage: String,
    /// The timeout that expired.
    pub timeout: Duration,
}

/// Raised when a run is cancelled while a stage is in flight.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' cancelled: {reason}")]
pub struct StageCancelledError {
    /// The stage name.
    pub stage: String,
    /// The cancellation reason.
    pub reason: String,
}

/// Raised when a requested cache version does not exist.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Version {version} of stage '{stage}' not found for run '{run_id}'")]
pub struct VersionNotFoundError {
    /// The run identifier.
    pub run_id: String,
    /// The stage name.
    pub stage: String,
    /// The missing version.
    pub version: u32,
}

/// Raised when two commits allocate the same version.
///
/// The per-key critical section in the cache makes this unreachable within a
/// process; seeing it means the storage was written concurrently from outside.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Commit race on run '{run_id}' stage '{stage}': version {version} already exists")]
pub struct CommitRaceError {
    /// The run identifier.
    pub run_id: String,
    /// The stage name.
    pub stage: String,
    /// The contested version.
    pub version: u32,
}

/// Errors raised by the versioned cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested version does not exist.
    #[error("{0}")]
    VersionNotFound(#[from] VersionNotFoundError),

    /// Two commits allocated the same version.
    #[error("{0}")]
    CommitRace(#[from] CommitRaceError),

    /// A run id or stage name cannot be used as a storage key.
    #[error("Invalid cache key component '{0}'")]
    InvalidKey(String),

    /// A stored blob does not match the digest recorded in the manifest.
    #[error("Cache entry '{key}' is corrupted: expected digest {expected}, found {actual}")]
    Corrupted {
        /// The storage key.
        key: String,
        /// Digest recorded in the manifest.
        expected: String,
        /// Digest of the bytes read.
        actual: String,
    },

    /// The manifest references a blob that is missing from storage.
    #[error("Cache blob '{0}' referenced by the manifest is missing")]
    MissingBlob(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stage failed; carries the last context that was fully produced.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed: {cause}")]
pub struct StageExecutionError {
    /// The failing stage.
    pub stage: String,
    /// The underlying cause.
    #[source]
    pub cause: StageError,
    /// The context as it was before the failing stage ran.
    pub last_context: StageContext,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(stage: impl Into<String>, cause: StageError, last_context: StageContext) -> Self {
        Self {
            stage: stage.into(),
            cause,
            last_context,
        }
    }

    /// Returns the cause downcast to a concrete error type, if it matches.
    #[must_use]
    pub fn cause_as<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.cause.downcast_ref::<E>()
    }
}

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The execution order could not be resolved.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The cache store failed outside stage execution, e.g. selecting a
    /// version.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// A stage failed, timed out, or its output could not be read from or
    /// committed to the cache.
    #[error("{0}")]
    StageExecution(Box<StageExecutionError>),

    /// The run was cancelled while a stage was in flight.
    #[error("Run cancelled: {0}")]
    Cancelled(Box<StageExecutionError>),

    /// Configuration could not be turned into a runnable plan.
    #[error("{0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Returns the failing stage, for stage-level failures.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::StageExecution(e) | Self::Cancelled(e) => Some(&e.stage),
            _ => None,
        }
    }

    /// Returns the last successful context, for stage-level failures.
    #[must_use]
    pub fn last_context(&self) -> Option<&StageContext> {
        match self {
            Self::StageExecution(e) | Self::Cancelled(e) => Some(&e.last_context),
            _ => None,
        }
    }

    /// Returns true if re-invoking the run may succeed.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::StageExecution(_) | Self::Cancelled(_) | Self::Cache(_))
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for the schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}
