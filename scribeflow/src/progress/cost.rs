//! Duration estimation collaborators.
//!
//! The estimator never reasons about audio length or token counts; it asks a
//! [`CostModel`] for a number of seconds, fed by a [`SizeMetric`].

use crate::context::StageContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Estimates how long a stage will take.
#[cfg_attr(test, mockall::automock)]
pub trait CostModel: Send + Sync {
    /// Returns the expected duration of `stage`, in seconds, for an input of
    /// the given size.
    fn estimate_seconds(&self, stage: &str, input_size: f64) -> f64;
}

impl<F> CostModel for F
where
    F: Fn(&str, f64) -> f64 + Send + Sync,
{
    fn estimate_seconds(&self, stage: &str, input_size: f64) -> f64 {
        self(stage, input_size)
    }
}

/// Extracts the size of a stage's input from the context.
pub trait SizeMetric: Send + Sync {
    /// Returns the input size metric for `stage`.
    fn measure(&self, stage: &str, ctx: &StageContext) -> f64;
}

impl<F> SizeMetric for F
where
    F: Fn(&str, &StageContext) -> f64 + Send + Sync,
{
    fn measure(&self, stage: &str, ctx: &StageContext) -> f64 {
        self(stage, ctx)
    }
}

/// Reads [`RunMetadata::input_size`](crate::context::RunMetadata::input_size).
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataSizeMetric;

impl SizeMetric for MetadataSizeMetric {
    fn measure(&self, _stage: &str, ctx: &StageContext) -> f64 {
        ctx.metadata().input_size.unwrap_or(0.0)
    }
}

/// Linear cost: `base_time_seconds + factor_per_unit * size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Fixed overhead in seconds.
    pub base_time_seconds: f64,
    /// Seconds per unit of input.
    pub factor_per_unit: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            base_time_seconds: 10.0,
            factor_per_unit: 0.0,
        }
    }
}

impl Calibration {
    /// Creates a calibration entry.
    #[must_use]
    pub fn new(base_time_seconds: f64, factor_per_unit: f64) -> Self {
        Self {
            base_time_seconds,
            factor_per_unit,
        }
    }

    /// Evaluates the linear model.
    #[must_use]
    pub fn estimate(&self, input_size: f64) -> f64 {
        (self.factor_per_unit.mul_add(input_size.max(0.0), self.base_time_seconds)).max(0.0)
    }

    /// Checks that both coefficients are finite and non-negative.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("base_time_seconds", self.base_time_seconds),
            ("factor_per_unit", self.factor_per_unit),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        Ok(())
    }
}

/// A per-stage calibration table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationTable {
    entries: BTreeMap<String, Calibration>,
    default: Calibration,
}

impl CalibrationTable {
    /// Creates a table from per-stage entries.
    #[must_use]
    pub fn new(entries: BTreeMap<String, Calibration>) -> Self {
        Self {
            entries,
            default: Calibration::default(),
        }
    }

    /// Sets the calibration used for stages without an entry.
    #[must_use]
    pub fn with_default(mut self, default: Calibration) -> Self {
        self.default = default;
        self
    }

    /// Adds or replaces one entry.
    #[must_use]
    pub fn with_entry(mut self, stage: impl Into<String>, calibration: Calibration) -> Self {
        self.entries.insert(stage.into(), calibration);
        self
    }
}

impl CostModel for CalibrationTable {
    fn estimate_seconds(&self, stage: &str, input_size: f64) -> f64 {
        self.entries
            .get(stage)
            .unwrap_or(&self.default)
            .estimate(input_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMetadata;

    #[test]
    fn test_linear_estimate() {
        let table = CalibrationTable::default()
            .with_entry("transcribe", Calibration::new(2.4, 0.05));

        assert!((table.estimate_seconds("transcribe", 1800.0) - 92.4).abs() < 1e-9);
        assert!((table.estimate_seconds("unknown", 1800.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_input_clamped() {
        let calibration = Calibration::new(1.0, 2.0);
        assert!((calibration.estimate(-5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_closure_cost_model() {
        let model = |stage: &str, size: f64| if stage == "clean" { size / 10.0 } else { 1.0 };
        assert!((model.estimate_seconds("clean", 50.0) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_metadata_size_metric() {
        let ctx = StageContext::new(RunMetadata::new("r1").with_input_size(42.0));
        assert!((MetadataSizeMetric.measure("transcribe", &ctx) - 42.0).abs() < 1e-9);

        let empty = StageContext::new(RunMetadata::new("r2"));
        assert_eq!(MetadataSizeMetric.measure("transcribe", &empty), 0.0);
    }

    #[test]
    fn test_mock_cost_model() {
        let mut mock = MockCostModel::new();
        mock.expect_estimate_seconds()
            .withf(|stage, size| stage.to_string() == "summarize" && (*size - 3.0).abs() < 1e-9)
            .times(1)
            .return_const(7.5);

        assert!((mock.estimate_seconds("summarize", 3.0) - 7.5).abs() < 1e-9);
    }
}
