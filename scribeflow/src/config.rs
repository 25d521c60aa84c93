//! Configuration for the pipeline core.
//!
//! Settings load from TOML; every section and field has a default, so an
//! empty file is a valid configuration.
//!
//! ```toml
//! [pipeline]
//! tick_interval_ms = 1000
//! parallel = true
//!
//! [cache]
//! backend = "filesystem"
//! root = "/var/lib/scribeflow"
//!
//! [progress.weights]
//! transcribe = 60
//! clean = 20
//! summarize = 20
//!
//! [calibration.transcribe]
//! base_time_seconds = 5.0
//! factor_per_unit = 0.08
//!
//! [stages.summarize]
//! model = "gpt-4o-mini"
//! prompt = "summary-v3"
//! ```

use crate::errors::ConfigError;
use crate::progress::{Calibration, CalibrationTable, WeightTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ScribeflowConfig {
    /// Orchestrator settings.
    pub pipeline: PipelineSettings,
    /// Cache store settings.
    pub cache: CacheSettings,
    /// Progress reporting settings.
    pub progress: ProgressSettings,
    /// Per-stage cost calibration.
    pub calibration: BTreeMap<String, Calibration>,
    /// Calibration used for stages missing from `calibration`.
    pub calibration_default: Calibration,
    /// Per-stage configuration passed to stage functions.
    pub stages: BTreeMap<String, StageConfig>,
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Interval between progress ticks, in milliseconds.
    pub tick_interval_ms: u64,
    /// Whether independent stages run concurrently.
    pub parallel: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            parallel: true,
        }
    }
}

impl PipelineSettings {
    /// Returns the tick interval as a `Duration`.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

/// Which storage medium backs the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// Process-local memory; lost on exit.
    Memory,
    /// One directory per run under `root`.
    #[default]
    Filesystem,
}

/// Cache store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// The backend.
    pub backend: CacheBackendKind,
    /// Root directory for the filesystem backend.
    pub root: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            root: PathBuf::from(".scribeflow-cache"),
        }
    }
}

/// Progress reporting settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ProgressSettings {
    /// Stage name to percentage share of a full run.
    pub weights: BTreeMap<String, f64>,
}

/// Configuration handed to a single stage function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StageConfig {
    /// External model the stage should call.
    pub model: Option<String>,
    /// Prompt identifier or template.
    pub prompt: Option<String>,
    /// Free-form options.
    pub options: BTreeMap<String, serde_json::Value>,
}

impl StageConfig {
    /// Creates an empty stage configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Adds an option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Gets an option.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&serde_json::Value> {
        self.options.get(key)
    }
}

/// The effective configuration of one run, built once and passed down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunConfig {
    stages: BTreeMap<String, StageConfig>,
}

impl RunConfig {
    /// Creates an empty run configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration of one stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>, config: StageConfig) -> Self {
        self.stages.insert(stage.into(), config);
        self
    }

    /// Returns the configuration of a stage, or the default if none was set.
    #[must_use]
    pub fn for_stage(&self, stage: &str) -> StageConfig {
        self.stages.get(stage).cloned().unwrap_or_default()
    }
}

impl ScribeflowConfig {
    /// Loads configuration from a TOML file.
    ///
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from a file, falling back to defaults if the file
    /// is missing or invalid.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Using default configuration");
                Self::default()
            }
        }
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        self.weight_table()?;
        for (stage, calibration) in &self.calibration {
            calibration
                .validate()
                .map_err(|reason| ConfigError::Invalid(format!("calibration.{stage}: {reason}")))?;
        }
        self.calibration_default
            .validate()
            .map_err(|reason| ConfigError::Invalid(format!("calibration_default: {reason}")))?;
        Ok(())
    }

    /// Builds the validated weight table.
    pub fn weight_table(&self) -> Result<WeightTable, ConfigError> {
        WeightTable::new(self.progress.weights.clone())
    }

    /// Builds the calibration-backed cost model.
    #[must_use]
    pub fn calibration_table(&self) -> CalibrationTable {
        CalibrationTable::new(self.calibration.clone()).with_default(self.calibration_default)
    }

    /// Builds the per-run stage configuration.
    #[must_use]
    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            stages: self.stages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::CostModel;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ScribeflowConfig::from_toml_str("").unwrap();
        assert_eq!(config, ScribeflowConfig::default());
        assert_eq!(config.pipeline.tick_interval(), Duration::from_secs(1));
        assert!(config.pipeline.parallel);
        assert_eq!(config.cache.backend, CacheBackendKind::Filesystem);
    }

    #[test]
    fn test_full_config_parses() {
        let toml = r#"
            [pipeline]
            tick_interval_ms = 250
            parallel = false

            [cache]
            backend = "memory"

            [progress.weights]
            transcribe = 60
            clean = 20
            summarize = 20

            [calibration.transcribe]
            base_time_seconds = 5.0
            factor_per_unit = 0.08

            [stages.summarize]
            model = "gpt-4o-mini"
            prompt = "summary-v3"

            [stages.summarize.options]
            max_bullets = 7
        "#;

        let config = ScribeflowConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.pipeline.tick_interval_ms, 250);
        assert!(!config.pipeline.parallel);
        assert_eq!(config.cache.backend, CacheBackendKind::Memory);

        let weights = config.weight_table().unwrap();
        assert_eq!(weights.weight("transcribe"), 60.0);

        let cost = config.calibration_table();
        assert!((cost.estimate_seconds("transcribe", 100.0) - 13.0).abs() < 1e-9);

        let run = config.run_config();
        let summarize = run.for_stage("summarize");
        assert_eq!(summarize.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(summarize.option("max_bullets"), Some(&serde_json::json!(7)));
        assert_eq!(run.for_stage("chunk"), StageConfig::default());
    }

    #[test]
    fn test_weights_must_sum_to_hundred() {
        let toml = r#"
            [progress.weights]
            transcribe = 60
            clean = 20
        "#;
        assert!(matches!(
            ScribeflowConfig::from_toml_str(toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let toml = "[pipeline]\ntick_interval_ms = 0\n";
        assert!(ScribeflowConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_negative_calibration_rejected() {
        let toml = "[calibration.clean]\nbase_time_seconds = -1.0\nfactor_per_unit = 0.0\n";
        let err = ScribeflowConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("calibration.clean"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        assert!(matches!(
            ScribeflowConfig::from_toml_str("[pipeline"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file_and_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\ntick_interval_ms = 500").unwrap();

        let config = ScribeflowConfig::load(file.path()).unwrap();
        assert_eq!(config.pipeline.tick_interval_ms, 500);

        let missing = ScribeflowConfig::load_or_default(Path::new("/nonexistent/scribeflow.toml"));
        assert_eq!(missing, ScribeflowConfig::default());
    }
}
