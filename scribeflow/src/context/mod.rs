//! Context management for pipeline runs.
//!
//! This module provides:
//! - The immutable `StageContext` chain of stage outputs
//! - Run-scoped metadata
//! - Serializable snapshots

mod metadata;
mod stage_context;

pub use metadata::RunMetadata;
pub use stage_context::{ContextSnapshot, StageContext};
