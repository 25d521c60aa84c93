//! The versioned cache store.
//!
//! Layout, relative to the backend root:
//!
//! ```text
//! <run_id>/manifest.json
//! <run_id>/<stage>/v<N>.json
//! ```
//!
//! Blobs are write-once. The manifest is the only record that is ever
//! replaced, and it is the single source of truth for which version of a
//! stage is current.

use super::backend::CacheBackend;
use super::manifest::{CacheManifest, CacheVersion};
use crate::errors::{CacheError, CommitRaceError, VersionNotFoundError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[allow(clippy::expect_used)]
static KEY_COMPONENT: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("key pattern is valid")
});

/// A stored stage output together with its version record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The run identifier.
    pub run_id: String,
    /// The stage name.
    pub stage: String,
    /// The version record from the manifest.
    pub version: CacheVersion,
    /// The stored output.
    pub payload: serde_json::Value,
}

/// Durable, versioned storage of stage outputs.
///
/// Changing the current version of a stage never touches the versions of
/// other stages; downstream outputs computed from an older upstream version
/// stay current until they are rerun.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug {
    /// Returns the current version of a stage, if any.
    async fn get_current(&self, run_id: &str, stage: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Returns a specific version of a stage.
    async fn get_version(
        &self,
        run_id: &str,
        stage: &str,
        version: u32,
    ) -> Result<CacheEntry, CacheError>;

    /// Stores a new version and makes it current.
    async fn commit(
        &self,
        run_id: &str,
        stage: &str,
        payload: &serde_json::Value,
        provenance: Option<&str>,
    ) -> Result<CacheVersion, CacheError>;

    /// Makes an existing version current.
    ///
    /// Returns whether the current pointer moved.
    async fn set_current(&self, run_id: &str, stage: &str, version: u32) -> Result<bool, CacheError>;

    /// Lists all versions of a stage, ascending.
    async fn list_versions(&self, run_id: &str, stage: &str) -> Result<Vec<CacheVersion>, CacheError>;

    /// Returns the whole manifest of a run (empty if the run is unknown).
    async fn manifest(&self, run_id: &str) -> Result<CacheManifest, CacheError>;
}

type LockMap<K> = DashMap<K, Arc<Mutex<()>>>;

/// [`CacheStore`] over any [`CacheBackend`].
///
/// Version allocation for one `(run_id, stage)` is serialized by a per-key
/// lock; commits to different stages only contend briefly on the run's
/// manifest lock. Locks are process-local.
#[derive(Debug)]
pub struct VersionedCache<B> {
    backend: B,
    stage_locks: LockMap<(String, String)>,
    manifest_locks: LockMap<String>,
}

impl<B: CacheBackend> VersionedCache<B> {
    /// Wraps a backend.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            stage_locks: DashMap::new(),
            manifest_locks: DashMap::new(),
        }
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn stage_lock(&self, run_id: &str, stage: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.stage_locks
                .entry((run_id.to_string(), stage.to_string()))
                .or_default()
                .value(),
        )
    }

    fn manifest_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.manifest_locks.entry(run_id.to_string()).or_default().value())
    }

    async fn load_manifest(&self, run_id: &str) -> Result<CacheManifest, CacheError> {
        match self.backend.read(&manifest_key(run_id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(CacheManifest::new(run_id)),
        }
    }

    async fn save_manifest(&self, manifest: &CacheManifest) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        self.backend.write(&manifest_key(&manifest.run_id), &bytes).await
    }

    async fn load_entry(
        &self,
        run_id: &str,
        stage: &str,
        version: CacheVersion,
    ) -> Result<CacheEntry, CacheError> {
        let key = blob_key(run_id, stage, version.version);
        let bytes = self
            .backend
            .read(&key)
            .await?
            .ok_or_else(|| CacheError::MissingBlob(key.clone()))?;

        let actual = digest(&bytes);
        if actual != version.digest {
            return Err(CacheError::Corrupted {
                key,
                expected: version.digest,
                actual,
            });
        }

        Ok(CacheEntry {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            payload: serde_json::from_slice(&bytes)?,
            version,
        })
    }
}

#[async_trait]
impl<B: CacheBackend> CacheStore for VersionedCache<B> {
    async fn get_current(&self, run_id: &str, stage: &str) -> Result<Option<CacheEntry>, CacheError> {
        validate_key(run_id)?;
        validate_key(stage)?;

        let manifest = self.load_manifest(run_id).await?;
        match manifest.current(stage) {
            Some(version) => Ok(Some(self.load_entry(run_id, stage, version.clone()).await?)),
            None => Ok(None),
        }
    }

    async fn get_version(
        &self,
        run_id: &str,
        stage: &str,
        version: u32,
    ) -> Result<CacheEntry, CacheError> {
        validate_key(run_id)?;
        validate_key(stage)?;

        let manifest = self.load_manifest(run_id).await?;
        let record = manifest
            .version(stage, version)
            .cloned()
            .ok_or_else(|| VersionNotFoundError {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
                version,
            })?;
        self.load_entry(run_id, stage, record).await
    }

    async fn commit(
        &self,
        run_id: &str,
        stage: &str,
        payload: &serde_json::Value,
        provenance: Option<&str>,
    ) -> Result<CacheVersion, CacheError> {
        validate_key(run_id)?;
        validate_key(stage)?;

        let bytes = serde_json::to_vec(payload)?;
        let stage_lock = self.stage_lock(run_id, stage);
        let _stage_guard = stage_lock.lock().await;

        let version = self.load_manifest(run_id).await?.next_version(stage);
        let key = blob_key(run_id, stage, version);
        if !self.backend.write_new(&key, &bytes).await? {
            // Left behind by a commit that died before updating the manifest.
            warn!(key = %key, "Replacing orphaned cache blob");
            self.backend.write(&key, &bytes).await?;
        }

        let record = CacheVersion {
            version,
            created_at: Utc::now(),
            provenance: provenance.map(str::to_string),
            is_current: true,
            digest: digest(&bytes),
            size_bytes: bytes.len() as u64,
        };

        let manifest_lock = self.manifest_lock(run_id);
        let _manifest_guard = manifest_lock.lock().await;
        let mut manifest = self.load_manifest(run_id).await?;
        if manifest.next_version(stage) != version {
            return Err(CommitRaceError {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
                version,
            }
            .into());
        }
        manifest.push_current(stage, record.clone());
        self.save_manifest(&manifest).await?;

        debug!(run_id, stage, version, size_bytes = record.size_bytes, "Committed cache version");
        Ok(record)
    }

    async fn set_current(&self, run_id: &str, stage: &str, version: u32) -> Result<bool, CacheError> {
        validate_key(run_id)?;
        validate_key(stage)?;

        let stage_lock = self.stage_lock(run_id, stage);
        let _stage_guard = stage_lock.lock().await;
        let manifest_lock = self.manifest_lock(run_id);
        let _manifest_guard = manifest_lock.lock().await;

        let mut manifest = self.load_manifest(run_id).await?;
        let changed = manifest.set_current(stage, version)?;
        if changed {
            self.save_manifest(&manifest).await?;
            debug!(run_id, stage, version, "Switched current cache version");
        }
        Ok(changed)
    }

    async fn list_versions(&self, run_id: &str, stage: &str) -> Result<Vec<CacheVersion>, CacheError> {
        validate_key(run_id)?;
        validate_key(stage)?;
        Ok(self.load_manifest(run_id).await?.versions(stage).to_vec())
    }

    async fn manifest(&self, run_id: &str) -> Result<CacheManifest, CacheError> {
        validate_key(run_id)?;
        self.load_manifest(run_id).await
    }
}

/// Whether `component` can name a run or a stage in cache keys.
pub(crate) fn is_valid_key_component(component: &str) -> bool {
    KEY_COMPONENT.is_match(component)
}

fn validate_key(component: &str) -> Result<(), CacheError> {
    if is_valid_key_component(component) {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(component.to_string()))
    }
}

fn manifest_key(run_id: &str) -> String {
    format!("{run_id}/manifest.json")
}

fn blob_key(run_id: &str, stage: &str, version: u32) -> String {
    format!("{run_id}/{stage}/v{version}.json")
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn store() -> VersionedCache<MemoryBackend> {
        VersionedCache::new(MemoryBackend::new())
    }

    #[tokio::test]
    async fn test_commit_twice_keeps_both_versions() {
        let cache = store();
        cache.commit("r1", "clean", &json!("A"), None).await.unwrap();
        cache
            .commit("r1", "clean", &json!("B"), Some("gpt-4o"))
            .await
            .unwrap();

        let current = cache.get_current("r1", "clean").await.unwrap().unwrap();
        assert_eq!(current.payload, json!("B"));
        assert_eq!(current.version.version, 2);
        assert_eq!(current.version.provenance.as_deref(), Some("gpt-4o"));

        let first = cache.get_version("r1", "clean", 1).await.unwrap();
        assert_eq!(first.payload, json!("A"));
        assert!(!first.version.is_current);

        let versions = cache.list_versions("r1", "clean").await.unwrap();
        assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);
        assert!(versions[1].is_current);
    }

    #[tokio::test]
    async fn test_sequential_commits_number_from_one() {
        let cache = store();
        for i in 1..=5u32 {
            let version = cache.commit("r1", "parse", &json!(i), None).await.unwrap();
            assert_eq!(version.version, i);
            let versions = cache.list_versions("r1", "parse").await.unwrap();
            assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_set_current_does_not_touch_versions_or_dependents() {
        let cache = store();
        cache.commit("r1", "clean", &json!("A"), None).await.unwrap();
        cache.commit("r1", "clean", &json!("B"), None).await.unwrap();
        cache.commit("r1", "summarize", &json!("S(B)"), None).await.unwrap();

        assert!(cache.set_current("r1", "clean", 1).await.unwrap());
        assert!(!cache.set_current("r1", "clean", 1).await.unwrap());

        let current = cache.get_current("r1", "clean").await.unwrap().unwrap();
        assert_eq!(current.payload, json!("A"));
        assert_eq!(cache.list_versions("r1", "clean").await.unwrap().len(), 2);
        assert_eq!(
            cache.get_version("r1", "clean", 2).await.unwrap().payload,
            json!("B")
        );

        let summary = cache.get_current("r1", "summarize").await.unwrap().unwrap();
        assert_eq!(summary.payload, json!("S(B)"));
    }

    #[tokio::test]
    async fn test_missing_versions() {
        let cache = store();
        assert!(cache.get_current("r1", "clean").await.unwrap().is_none());
        assert!(cache.list_versions("r1", "clean").await.unwrap().is_empty());

        let err = assert_err!(cache.get_version("r1", "clean", 1).await);
        assert!(matches!(err, CacheError::VersionNotFound(_)));

        cache.commit("r1", "clean", &json!(1), None).await.unwrap();
        let err = assert_err!(cache.set_current("r1", "clean", 7).await);
        assert!(matches!(err, CacheError::VersionNotFound(ref e) if e.version == 7));
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let cache = store();
        for bad in ["", "../etc", "a/b", ".hidden", "white space"] {
            let err = assert_err!(cache.commit(bad, "clean", &json!(1), None).await);
            assert!(matches!(err, CacheError::InvalidKey(_)));
        }
        assert_ok!(cache.commit("run-2024.01_a", "clean", &json!(1), None).await);
    }

    #[tokio::test]
    async fn test_corrupted_blob_detected() {
        let cache = store();
        cache.commit("r1", "clean", &json!("A"), None).await.unwrap();
        cache
            .backend()
            .overwrite_raw("r1/clean/v1.json", b"\"tampered\"".to_vec());

        let err = assert_err!(cache.get_current("r1", "clean").await);
        assert!(matches!(err, CacheError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn test_orphaned_blob_is_replaced() {
        let cache = store();
        cache
            .backend()
            .overwrite_raw("r1/clean/v1.json", b"\"orphan\"".to_vec());

        let version = cache.commit("r1", "clean", &json!("fresh"), None).await.unwrap();
        assert_eq!(version.version, 1);
        let current = cache.get_current("r1", "clean").await.unwrap().unwrap();
        assert_eq!(current.payload, json!("fresh"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_get_distinct_versions() {
        let cache = Arc::new(store());
        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = Arc::clone(&cache);
            let stage = if i % 2 == 0 { "summarize" } else { "chunk" };
            handles.push(tokio::spawn(async move {
                cache.commit("r1", stage, &json!(i), None).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for stage in ["summarize", "chunk"] {
            let versions = cache.list_versions("r1", stage).await.unwrap();
            let numbers: Vec<u32> = versions.iter().map(|v| v.version).collect();
            assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
            assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let cache = store();
        cache.commit("r1", "clean", &json!("one"), None).await.unwrap();
        cache.commit("r2", "clean", &json!("two"), None).await.unwrap();

        assert_eq!(cache.manifest("r1").await.unwrap().versions("clean").len(), 1);
        assert_eq!(
            cache.get_current("r2", "clean").await.unwrap().unwrap().payload,
            json!("two")
        );
    }
}
