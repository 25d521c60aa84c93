//! Versioned, durable storage of stage outputs.
//!
//! Every commit appends a new version of a stage; nothing is updated in
//! place. A per-run manifest records which version of each stage is current,
//! and switching that pointer never cascades to other stages.

mod backend;
mod manifest;
mod store;

#[cfg(feature = "filesystem")]
pub use backend::FsBackend;
pub use backend::{CacheBackend, MemoryBackend};
pub use manifest::{CacheManifest, CacheVersion};
pub(crate) use store::is_valid_key_component;
pub use store::{CacheEntry, CacheStore, VersionedCache};

use crate::config::{CacheBackendKind, CacheSettings};
use crate::errors::ConfigError;
use std::sync::Arc;

/// A cache kept in process memory.
pub type MemoryCache = VersionedCache<MemoryBackend>;

/// A cache stored under a local directory.
#[cfg(feature = "filesystem")]
pub type FsCache = VersionedCache<FsBackend>;

/// Creates an empty in-memory cache.
#[must_use]
pub fn in_memory() -> MemoryCache {
    VersionedCache::new(MemoryBackend::new())
}

/// Creates a cache rooted at `root`.
#[cfg(feature = "filesystem")]
#[must_use]
pub fn filesystem(root: impl Into<std::path::PathBuf>) -> FsCache {
    VersionedCache::new(FsBackend::new(root))
}

/// Opens the cache described by the configuration.
pub fn open(settings: &CacheSettings) -> Result<Arc<dyn CacheStore>, ConfigError> {
    match settings.backend {
        CacheBackendKind::Memory => Ok(Arc::new(in_memory())),
        #[cfg(feature = "filesystem")]
        CacheBackendKind::Filesystem => Ok(Arc::new(filesystem(settings.root.clone()))),
        #[cfg(not(feature = "filesystem"))]
        CacheBackendKind::Filesystem => Err(ConfigError::Invalid(
            "cache.backend = \"filesystem\" requires the `filesystem` feature".to_string(),
        )),
    }
}
