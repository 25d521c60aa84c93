//! Per-run version manifest.

use crate::errors::VersionNotFoundError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One committed output of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheVersion {
    /// Version number, starting at 1 and never reused.
    pub version: u32,
    /// When the version was committed.
    pub created_at: DateTime<Utc>,
    /// Free-form origin (model, prompt revision, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    /// Whether downstream stages consume this version.
    pub is_current: bool,
    /// Hex SHA-256 of the stored blob.
    pub digest: String,
    /// Size of the stored blob.
    pub size_bytes: u64,
}

/// Index of every version of every stage in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    /// The run this manifest belongs to.
    pub run_id: String,
    /// Versions per stage, ascending.
    #[serde(default)]
    pub stages: BTreeMap<String, Vec<CacheVersion>>,
}

impl CacheManifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stages: BTreeMap::new(),
        }
    }

    /// All versions of a stage, ascending.
    #[must_use]
    pub fn versions(&self, stage: &str) -> &[CacheVersion] {
        self.stages.get(stage).map_or(&[], Vec::as_slice)
    }

    /// The version marked current, if any.
    #[must_use]
    pub fn current(&self, stage: &str) -> Option<&CacheVersion> {
        self.versions(stage).iter().find(|v| v.is_current)
    }

    /// Looks up one version.
    #[must_use]
    pub fn version(&self, stage: &str, version: u32) -> Option<&CacheVersion> {
        self.versions(stage).iter().find(|v| v.version == version)
    }

    /// The number the next commit of `stage` will get.
    #[must_use]
    pub fn next_version(&self, stage: &str) -> u32 {
        self.versions(stage)
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// Appends a version and makes it the only current one.
    pub fn push_current(&mut self, stage: &str, mut entry: CacheVersion) {
        let versions = self.stages.entry(stage.to_string()).or_default();
        for v in versions.iter_mut() {
            v.is_current = false;
        }
        entry.is_current = true;
        versions.push(entry);
    }

    /// Marks an existing version as the only current one.
    ///
    /// Returns whether the current version changed.
    pub fn set_current(&mut self, stage: &str, version: u32) -> Result<bool, VersionNotFoundError> {
        let run_id = &self.run_id;
        let Some(versions) = self
            .stages
            .get_mut(stage)
            .filter(|versions| versions.iter().any(|v| v.version == version))
        else {
            return Err(VersionNotFoundError {
                run_id: run_id.clone(),
                stage: stage.to_string(),
                version,
            });
        };

        let mut changed = false;
        for v in versions.iter_mut() {
            let is_target = v.version == version;
            if v.is_current != is_target {
                changed = true;
            }
            v.is_current = is_target;
        }
        Ok(changed)
    }
}
