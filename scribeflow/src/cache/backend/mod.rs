//! Storage media behind the versioned cache.
//!
//! A backend only stores opaque bytes under slash-separated keys; versioning,
//! manifests and locking live in [`VersionedCache`](super::VersionedCache).

#[cfg(feature = "filesystem")]
mod fs;
mod memory;

#[cfg(feature = "filesystem")]
pub use fs::FsBackend;
pub use memory::MemoryBackend;

use crate::errors::CacheError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Byte storage with read-after-write consistency per key.
#[async_trait]
pub trait CacheBackend: Send + Sync + Debug {
    /// Reads a key; `None` if it was never written.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Writes a key, replacing any previous value atomically.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError>;

    /// Writes a key only if it does not exist yet.
    ///
    /// Returns `false` without touching storage if the key is taken.
    async fn write_new(&self, key: &str, bytes: &[u8]) -> Result<bool, CacheError>;
}
