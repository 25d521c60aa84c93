//! Stage trait and implementations.
//!
//! A stage is an opaque transformation: it reads the outputs of its
//! dependencies from the [`StageContext`] and returns one [`StageResult`].
//! Stages must be safe to call more than once with the same context, since
//! reruns replay them.

mod adapters;

pub use adapters::{AsyncFnStage, BlockingStage, FnStage};

use crate::config::StageConfig;
use crate::context::StageContext;
use crate::core::StageResult;
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
///
/// The future returned by `execute` runs on the async scheduler next to the
/// progress tickers. Synchronous functions wrapped in [`FnStage`] (or its
/// [`BlockingStage`] alias) are moved to the blocking pool automatically; a
/// hand-written implementation that calls blocking code must hand it to
/// `tokio::task::spawn_blocking` itself.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Executes the stage.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Outputs of every stage that ran before this one
    /// * `config` - Effective configuration for this stage in this run
    async fn execute(&self, ctx: &StageContext, config: &StageConfig) -> Result<StageResult, StageError>;
}

/// Decides whether an optional stage is skipped.
#[cfg_attr(test, mockall::automock)]
pub trait SkipPredicate: Send + Sync {
    /// Returns true if `stage` should not run for this context.
    fn should_skip(&self, stage: &str, ctx: &StageContext) -> bool;
}

impl<F> SkipPredicate for F
where
    F: Fn(&str, &StageContext) -> bool + Send + Sync,
{
    fn should_skip(&self, stage: &str, ctx: &StageContext) -> bool {
        self(stage, ctx)
    }
}

/// Never skips anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSkip;

impl SkipPredicate for NeverSkip {
    fn should_skip(&self, _stage: &str, _ctx: &StageContext) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMetadata;

    #[test]
    fn test_closure_predicate() {
        let predicate = |stage: &str, ctx: &StageContext| {
            stage == "narrative" && ctx.metadata().classification.as_deref() != Some("lecture")
        };
        let meeting = StageContext::new(RunMetadata::new("r1").with_classification("meeting"));
        let lecture = StageContext::new(RunMetadata::new("r2").with_classification("lecture"));

        assert!(predicate.should_skip("narrative", &meeting));
        assert!(!predicate.should_skip("narrative", &lecture));
        assert!(!predicate.should_skip("summarize", &meeting));
        assert!(!NeverSkip.should_skip("narrative", &meeting));
    }
}
