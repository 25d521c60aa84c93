//! Pipeline definition and execution.
//!
//! This module provides:
//! - Stage definitions and the dependency-checked registry
//! - Execution plans that batch independent stages
//! - The orchestrator that runs, resumes, and reruns stages

mod orchestrator;
mod plan;
mod registry;
mod spec;


pub use orchestrator::{Orchestrator, RunReport, RunRequest};
pub use plan::ExecutionPlan;
pub use registry::{RegistryBuilder, StageRegistry, Targets};
pub use spec::StageDefinition;
