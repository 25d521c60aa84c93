//! Testing utilities for scribeflow pipelines.
//!
//! This module provides:
//! - Scripted mock stages
//! - A transcript pipeline fixture
//! - Assertions over orders, cache versions and progress streams

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_progress_completed, assert_topological, assert_versions_consistent};
pub use fixtures::{TranscriptFixture, TRANSCRIPT_STAGES};
pub use mocks::{ConcurrencyGauge, FailingStage, MockStage, SlowStage};
