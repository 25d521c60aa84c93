//! Static stage weights.

use crate::errors::ConfigError;
use std::collections::BTreeMap;

const WEIGHT_TOTAL: f64 = 100.0;
const WEIGHT_TOLERANCE: f64 = 0.01;

/// Maps stage names to their percentage share of a full run.
///
/// A non-empty table must contain only finite, non-negative weights that sum
/// to 100. An empty table is allowed and means "equal shares".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeightTable {
    weights: BTreeMap<String, f64>,
}

impl WeightTable {
    /// Creates a validated weight table.
    pub fn new(weights: BTreeMap<String, f64>) -> Result<Self, ConfigError> {
        if let Some((stage, w)) = weights.iter().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(ConfigError::Invalid(format!(
                "weight of stage '{stage}' must be a non-negative number, got {w}"
            )));
        }

        if !weights.is_empty() {
            let total: f64 = weights.values().sum();
            if (total - WEIGHT_TOTAL).abs() > WEIGHT_TOLERANCE {
                return Err(ConfigError::Invalid(format!(
                    "stage weights must sum to 100, got {total}"
                )));
            }
        }

        Ok(Self { weights })
    }

    /// Builds a table from `(stage, weight)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(s, w)| (s.into(), w)).collect())
    }

    /// Returns the weight of a stage; unknown stages weigh 0.
    #[must_use]
    pub fn weight(&self, stage: &str) -> f64 {
        self.weights.get(stage).copied().unwrap_or(0.0)
    }

    /// Returns true if the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Rescales the weights of the planned stages so they sum to 100.
    ///
    /// If every planned stage weighs 0 (or the table is empty) the planned
    /// stages share equally.
    #[must_use]
    pub fn normalized_for<'a, I>(&self, stages: I) -> BTreeMap<String, f64>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let planned: Vec<&str> = stages.into_iter().collect();
        if planned.is_empty() {
            return BTreeMap::new();
        }

        let total: f64 = planned.iter().map(|s| self.weight(s)).sum();
        if total <= 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let share = WEIGHT_TOTAL / planned.len() as f64;
            return planned.into_iter().map(|s| (s.to_string(), share)).collect();
        }

        planned
            .into_iter()
            .map(|s| (s.to_string(), self.weight(s) * WEIGHT_TOTAL / total))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> WeightTable {
        WeightTable::from_pairs([
            ("parse", 5.0),
            ("transcribe", 60.0),
            ("clean", 15.0),
            ("summarize", 10.0),
            ("chunk", 10.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_negative_and_bad_sum() {
        assert!(WeightTable::from_pairs([("a", -1.0), ("b", 101.0)]).is_err());
        assert!(WeightTable::from_pairs([("a", 50.0), ("b", 40.0)]).is_err());
        assert!(WeightTable::from_pairs([("a", f64::NAN)]).is_err());
        assert!(WeightTable::new(BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_unknown_stage_weighs_zero() {
        assert_eq!(table().weight("narrative"), 0.0);
        assert_eq!(table().weight("transcribe"), 60.0);
    }

    #[test]
    fn test_full_plan_keeps_weights() {
        let normalized =
            table().normalized_for(["parse", "transcribe", "clean", "summarize", "chunk"]);
        assert!((normalized["transcribe"] - 60.0).abs() < 1e-9);
        let total: f64 = normalized.values().sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_plan_is_rescaled() {
        let normalized = table().normalized_for(["parse", "transcribe"]);
        let total: f64 = normalized.values().sum();
        assert!((total - 100.0).abs() < 1e-9);
        assert!((normalized["parse"] - 100.0 * 5.0 / 65.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weights_share_equally() {
        let normalized = WeightTable::default().normalized_for(["a", "b", "c", "d"]);
        assert!(normalized.values().all(|w| (*w - 25.0).abs() < 1e-9));
        assert!(WeightTable::default().normalized_for([]).is_empty());
    }
}
