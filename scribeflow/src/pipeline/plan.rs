//! Grouping of an execution order into concurrently runnable batches.

use super::StageDefinition;
use std::collections::HashMap;
use std::sync::Arc;

/// An execution order split into batches.
///
/// Batches run one after another. Stages inside one batch share the same
/// dependency depth, so no path connects any two of them and they may run
/// concurrently.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    batches: Vec<Vec<Arc<StageDefinition>>>,
}

impl ExecutionPlan {
    /// Builds a plan from a topologically sorted order.
    ///
    /// With `parallel = false` every stage gets its own batch and the plan
    /// replays `order` exactly.
    #[must_use]
    pub fn from_order(order: Vec<Arc<StageDefinition>>, parallel: bool) -> Self {
        if !parallel {
            return Self {
                batches: order.into_iter().map(|stage| vec![stage]).collect(),
            };
        }

        let mut depth: HashMap<String, usize> = HashMap::with_capacity(order.len());
        let mut batches: Vec<Vec<Arc<StageDefinition>>> = Vec::new();
        for stage in order {
            let level = stage
                .depends_on
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(stage.name.clone(), level);
            if batches.len() <= level {
                batches.resize_with(level + 1, Vec::new);
            }
            batches[level].push(stage);
        }
        Self { batches }
    }

    /// The batches, in execution order.
    #[must_use]
    pub fn batches(&self) -> &[Vec<Arc<StageDefinition>>] {
        &self.batches
    }

    /// All planned stages, batch by batch.
    pub fn stages(&self) -> impl Iterator<Item = &Arc<StageDefinition>> {
        self.batches.iter().flatten()
    }

    /// Names of all planned stages.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages().map(|s| s.name.clone()).collect()
    }

    /// Number of planned stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing is planned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
