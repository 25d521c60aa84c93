//! In-process backend.

use super::CacheBackend;
use crate::errors::CacheError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Keeps every key in a concurrent map; contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Replaces a key's bytes without any checks.
    ///
    /// Used in tests to simulate damaged storage.
    pub fn overwrite_raw(&self, key: &str, bytes: Vec<u8>) {
        self.blobs.insert(key.to_string(), bytes);
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.blobs.get(key).map(|v| v.value().clone()))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        self.blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn write_new(&self, key: &str, bytes: &[u8]) -> Result<bool, CacheError> {
        match self.blobs.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(bytes.to_vec());
                Ok(true)
            }
        }
    }
}
