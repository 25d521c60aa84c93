//! A ready-made transcript pipeline for tests and benchmarks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::mocks::MockStage;
use crate::errors::RegistryError;
use crate::pipeline::{StageDefinition, StageRegistry};
use crate::progress::WeightTable;
use crate::stages::Stage;

/// The stages of [`TranscriptFixture`] with their dependencies, in
/// registration order.
pub const TRANSCRIPT_STAGES: [(&str, &[&str]); 5] = [
    ("parse", &[]),
    ("transcribe", &["parse"]),
    ("clean", &["transcribe"]),
    ("summarize", &["clean"]),
    ("chunk", &["clean"]),
];

/// `parse -> transcribe -> clean -> {summarize, chunk}` backed by mock
/// stages, plus an optional `narrative` stage after `clean`.
#[derive(Debug)]
pub struct TranscriptFixture {
    stages: BTreeMap<String, Arc<MockStage>>,
}

impl Default for TranscriptFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptFixture {
    /// Creates the fixture with instant stages.
    #[must_use]
    pub fn new() -> Self {
        Self::build(|name| MockStage::new(name))
    }

    /// Creates the fixture where every stage sleeps for `delay`.
    #[must_use]
    pub fn with_delay(delay: Duration) -> Self {
        Self::build(|name| MockStage::new(name).with_delay(delay))
    }

    /// Creates the fixture with a custom stage factory.
    #[must_use]
    pub fn build(make: impl Fn(&str) -> MockStage) -> Self {
        let stages = TRANSCRIPT_STAGES
            .iter()
            .map(|(name, _)| *name)
            .chain(std::iter::once("narrative"))
            .map(|name| (name.to_string(), Arc::new(make(name))))
            .collect();
        Self { stages }
    }

    /// The mock behind a stage.
    ///
    /// # Panics
    ///
    /// Panics if the fixture has no such stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> &Arc<MockStage> {
        match self.stages.get(name) {
            Some(stage) => stage,
            None => panic!("fixture has no stage '{name}'"),
        }
    }

    /// Call counts of every stage.
    #[must_use]
    pub fn call_counts(&self) -> BTreeMap<String, usize> {
        self.stages
            .iter()
            .map(|(name, stage)| (name.clone(), stage.call_count()))
            .collect()
    }

    /// Builds a registry over the fixture's mocks.
    pub fn registry(&self) -> Result<StageRegistry, RegistryError> {
        let mut builder = StageRegistry::builder();
        for (name, deps) in TRANSCRIPT_STAGES {
            builder = builder.stage(
                StageDefinition::from_arc(name, Arc::clone(self.stage(name)) as Arc<dyn Stage>)
                    .with_dependencies(deps.iter().copied()),
            )?;
        }
        builder = builder.stage(
            StageDefinition::from_arc("narrative", Arc::clone(self.stage("narrative")) as Arc<dyn Stage>)
                .with_dependency("clean")
                .optional(),
        )?;
        builder.build()
    }

    /// Weights where transcription dominates.
    pub fn weights() -> Result<WeightTable, crate::errors::ConfigError> {
        WeightTable::from_pairs([
            ("parse", 5.0),
            ("transcribe", 55.0),
            ("clean", 15.0),
            ("summarize", 10.0),
            ("chunk", 5.0),
            ("narrative", 10.0),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_registry() {
        let fixture = TranscriptFixture::new();
        let registry = fixture.registry().unwrap();
        assert_eq!(registry.len(), 6);
        assert!(registry.get("narrative").unwrap().optional);
        assert!(fixture.call_counts().values().all(|&c| c == 0));
    }

    #[test]
    fn test_fixture_weights_sum_to_hundred() {
        let weights = TranscriptFixture::weights().unwrap();
        assert_eq!(weights.weight("transcribe"), 55.0);
    }
}
