//! The immutable context threaded through a run.

use super::RunMetadata;
use crate::cancellation::CancellationToken;
use crate::errors::MissingDependencyOutputError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Accumulated stage outputs of a run.
///
/// A context is never mutated: [`StageContext::with_output`] returns a new
/// value and leaves `self` untouched, so any earlier context can be kept and
/// reused (for a retry, or as the base for concurrently running stages).
/// Cloning is cheap; outputs are shared behind `Arc`s.
#[derive(Clone)]
pub struct StageContext {
    outputs: Arc<BTreeMap<String, Arc<serde_json::Value>>>,
    metadata: Arc<RunMetadata>,
    cancellation: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates an empty context for a run.
    #[must_use]
    pub fn new(metadata: RunMetadata) -> Self {
        Self {
            outputs: Arc::new(BTreeMap::new()),
            metadata: Arc::new(metadata),
            cancellation: Arc::new(CancellationToken::new()),
        }
    }

    /// Attaches the run's cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Returns a new context with one more stage output.
    ///
    /// An existing output for the same stage is replaced in the new context.
    #[must_use]
    pub fn with_output(&self, stage: impl Into<String>, value: serde_json::Value) -> Self {
        let mut outputs = (*self.outputs).clone();
        outputs.insert(stage.into(), Arc::new(value));
        Self {
            outputs: Arc::new(outputs),
            metadata: Arc::clone(&self.metadata),
            cancellation: Arc::clone(&self.cancellation),
        }
    }

    /// Gets the output of a stage, if present.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<&serde_json::Value> {
        self.outputs.get(stage).map(AsRef::as_ref)
    }

    /// Gets the output of a stage that `requester` cannot do without.
    ///
    /// # Errors
    ///
    /// Returns `MissingDependencyOutputError` if the stage has no output,
    /// typically because it was an optional stage that got skipped.
    pub fn require(
        &self,
        requester: &str,
        stage: &str,
    ) -> Result<&serde_json::Value, MissingDependencyOutputError> {
        self.get(stage).ok_or_else(|| MissingDependencyOutputError {
            stage: requester.to_string(),
            dependency: stage.to_string(),
        })
    }

    /// Decodes the output of a stage into a typed value.
    ///
    /// Returns `Ok(None)` if the stage has no output.
    pub fn decode<T: DeserializeOwned>(&self, stage: &str) -> Result<Option<T>, serde_json::Error> {
        self.get(stage)
            .map(|value| T::deserialize(value))
            .transpose()
    }

    /// Returns true if the stage has an output.
    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.outputs.contains_key(stage)
    }

    /// Returns the stage names with outputs, sorted.
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// Returns the number of stage outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Returns true if no stage has produced output yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Returns the run metadata.
    #[must_use]
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Returns the run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.metadata.run_id
    }

    /// Returns the cancellation token of the run.
    #[must_use]
    pub fn cancellation(&self) -> &Arc<CancellationToken> {
        &self.cancellation
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Captures a serializable snapshot of the context.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            metadata: (*self.metadata).clone(),
            outputs: self
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), (**v).clone()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.metadata.run_id)
            .field("stages", &self.outputs.keys().collect::<Vec<_>>())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A point-in-time, serializable copy of a [`StageContext`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSnapshot {
    /// Run metadata.
    pub metadata: RunMetadata,
    /// Stage outputs keyed by stage name.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl From<ContextSnapshot> for StageContext {
    fn from(snapshot: ContextSnapshot) -> Self {
        Self {
            outputs: Arc::new(
                snapshot
                    .outputs
                    .into_iter()
                    .map(|(k, v)| (k, Arc::new(v)))
                    .collect(),
            ),
            metadata: Arc::new(snapshot.metadata),
            cancellation: Arc::new(CancellationToken::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn base() -> StageContext {
        StageContext::new(RunMetadata::new("r1").with_classification("lecture"))
    }

    #[test]
    fn test_new_context_is_empty() {
        let ctx = base();
        assert!(ctx.is_empty());
        assert_eq!(ctx.run_id(), "r1");
        assert_eq!(ctx.metadata().classification.as_deref(), Some("lecture"));
    }

    #[test]
    fn test_with_output_leaves_original_untouched() {
        let empty = base();
        let one = empty.with_output("transcribe", json!({"text": "hello"}));
        let two = one.with_output("clean", json!({"text": "Hello."}));

        assert!(empty.is_empty());
        assert_eq!(one.len(), 1);
        assert!(!one.contains("clean"));
        assert_eq!(two.stages().collect::<Vec<_>>(), vec!["clean", "transcribe"]);
        assert_eq!(two.get("transcribe"), Some(&json!({"text": "hello"})));
    }

    #[test]
    fn test_sibling_contexts_do_not_alias() {
        let parent = base().with_output("clean", json!("text"));
        let left = parent.with_output("summarize", json!("short"));
        let right = parent.with_output("chunk", json!(["a", "b"]));

        assert!(!left.contains("chunk"));
        assert!(!right.contains("summarize"));
        assert_eq!(parent.len(), 1);
    }

    #[test]
    fn test_require_reports_missing_dependency() {
        let ctx = base();
        let err = ctx.require("summarize", "narrative").unwrap_err();
        assert_eq!(err.stage, "summarize");
        assert_eq!(err.dependency, "narrative");
    }

    #[test]
    fn test_decode_typed_output() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Chunk {
            title: String,
        }

        let ctx = base().with_output("chunk", json!([{"title": "Intro"}]));
        let chunks: Vec<Chunk> = ctx.decode("chunk").unwrap().unwrap();
        assert_eq!(chunks, vec![Chunk { title: "Intro".into() }]);

        let missing: Option<Vec<Chunk>> = ctx.decode("nope").unwrap();
        assert!(missing.is_none());
        assert!(ctx.decode::<u32>("chunk").is_err());
    }

    #[test]
    fn test_snapshot_round_trip_preserves_outputs() {
        let ctx = base().with_output("parse", json!({"title": "Talk"}));
        let snapshot = ctx.snapshot();
        let restored = StageContext::from(snapshot.clone());

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.run_id(), "r1");
    }

    #[test]
    fn test_cancellation_shared_across_derived_contexts() {
        let token = Arc::new(CancellationToken::new());
        let ctx = base().with_cancellation(Arc::clone(&token));
        let derived = ctx.with_output("parse", json!(1));

        token.cancel("user");
        assert!(derived.is_cancelled());
    }
}
