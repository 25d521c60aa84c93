//! Progress estimation for in-flight runs.
//!
//! This module provides:
//! - The per-stage weight table
//! - Pluggable cost and size collaborators
//! - The ticking estimator that runs beside each stage

mod cost;
mod estimator;
mod weights;

pub use cost::{Calibration, CalibrationTable, CostModel, MetadataSizeMetric, SizeMetric};
#[cfg(test)]
pub use cost::MockCostModel;
pub use estimator::{fraction_complete, ProgressEstimator, TickerHandle, MAX_RUNNING_FRACTION};
pub use weights::WeightTable;
