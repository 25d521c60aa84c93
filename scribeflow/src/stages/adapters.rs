//! Closure-backed stages.

use super::Stage;
use crate::config::StageConfig;
use crate::context::StageContext;
use crate::core::StageResult;
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A stage backed by a synchronous function.
///
/// The orchestrator cannot tell a cheap function from one that blocks on a
/// model or a synchronous HTTP client, so every call runs on Tokio's blocking
/// pool. Progress tickers keep firing even on a current-thread runtime. The
/// call itself cannot be interrupted; on cancellation the orchestrator stops
/// waiting for it and discards its result.
pub struct FnStage<F>
where
    F: Fn(&StageContext, &StageConfig) -> Result<StageResult, StageError> + Send + Sync + 'static,
{
    name: String,
    func: Arc<F>,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext, &StageConfig) -> Result<StageResult, StageError> + Send + Sync + 'static,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext, &StageConfig) -> Result<StageResult, StageError> + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext, &StageConfig) -> Result<StageResult, StageError> + Send + Sync + 'static,
{
    async fn execute(&self, ctx: &StageContext, config: &StageConfig) -> Result<StageResult, StageError> {
        let func = Arc::clone(&self.func);
        let ctx = ctx.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || func(&ctx, &config))
            .await
            .map_err(|e| -> StageError { format!("stage '{}' worker failed: {e}", self.name).into() })?
    }
}

/// A synchronous stage whose function is known to block, such as local
/// model inference. Same behavior as [`FnStage`].
pub type BlockingStage<F> = FnStage<F>;

/// A stage backed by an async function.
///
/// The function receives owned copies of the context and config; both are
/// cheap to clone.
pub struct AsyncFnStage<F, Fut>
where
    F: Fn(StageContext, StageConfig) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnStage<F, Fut>
where
    F: Fn(StageContext, StageConfig) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    /// Creates a new async function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnStage<F, Fut>
where
    F: Fn(StageContext, StageConfig) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Stage for AsyncFnStage<F, Fut>
where
    F: Fn(StageContext, StageConfig) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, StageError>> + Send,
{
    async fn execute(&self, ctx: &StageContext, config: &StageConfig) -> Result<StageResult, StageError> {
        (self.func)(ctx.clone(), config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMetadata;
    use serde_json::json;
    use std::time::Duration;

    fn ctx() -> StageContext {
        StageContext::new(RunMetadata::new("r1")).with_output("clean", json!("some text"))
    }

    #[tokio::test]
    async fn test_fn_stage_reads_context_and_config() {
        let stage = FnStage::new("summarize", |ctx: &StageContext, config: &StageConfig| {
            let text = ctx.require("summarize", "clean")?;
            let model = config.model.clone().unwrap_or_default();
            Ok(StageResult::new(json!({ "summary": text, "model": model })))
        });

        let config = StageConfig::new().with_model("gpt-4o-mini");
        let result = stage.execute(&ctx(), &config).await.unwrap();
        assert_eq!(result.payload["model"], "gpt-4o-mini");
        assert_eq!(result.payload["summary"], "some text");

        let empty = StageContext::new(RunMetadata::new("r2"));
        assert!(stage.execute(&empty, &config).await.is_err());
    }

    #[tokio::test]
    async fn test_async_fn_stage() {
        let stage = AsyncFnStage::new("chunk", |ctx: StageContext, _config: StageConfig| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(StageResult::new(json!(ctx.len())))
        });

        let result = stage.execute(&ctx(), &StageConfig::default()).await.unwrap();
        assert_eq!(result.payload, json!(1));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_stage_runs_off_the_scheduler() {
        let stage = BlockingStage::new("transcribe", |_ctx: &StageContext, _config: &StageConfig| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(StageResult::text("hello"))
        });

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let result = stage.execute(&ctx(), &StageConfig::default()).await.unwrap();
        ticker.abort();

        assert_eq!(result.payload, json!("hello"));
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_fn_stage_that_blocks_does_not_starve_the_scheduler() {
        let stage = FnStage::new("clean", |_ctx: &StageContext, _config: &StageConfig| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(StageResult::text("cleaned"))
        });

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let result = stage.execute(&ctx(), &StageConfig::default()).await.unwrap();
        ticker.abort();

        assert_eq!(result.payload, json!("cleaned"));
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_blocking_stage_panic_becomes_error() {
        let stage = BlockingStage::new("transcribe", |_ctx: &StageContext, _config: &StageConfig| {
            panic!("model crashed")
        });

        let err = stage.execute(&ctx(), &StageConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("transcribe"));
    }
}
