//! Key/value cache backends.
//!
//! Everything above this module talks to a store through [`CacheBackend`]:
//! raw bytes under string keys, each entry independently expirable. The
//! trait is object safe so engines hold an injected `Arc<dyn CacheBackend>`
//! instead of reaching for a process-wide client.
//!
//! Bundled implementations:
//!
//! - [`InMemoryBackend`]: a `HashMap` behind a lock, for tests and
//!   single-process use
//! - [`LmdbBackend`]: memory-mapped persistent store (heed)
//! - [`NamespacedBackend`]: key-prefixing wrapper so several engines can
//!   share one store without seeing each other's entries

pub mod lmdb;
pub mod memory;
pub mod namespaced;

pub use lmdb::{LmdbBackend, LmdbBackendError};
pub use memory::InMemoryBackend;
pub use namespaced::NamespacedBackend;

use std::time::Duration;

use async_trait::async_trait;
use cairn_core::CairnResult;

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be safe for concurrent use from many callers. Each
/// single-key operation is expected to be atomic; nothing here spans keys.
///
/// Deleting or probing an absent key is never an error. Failing to reach the
/// store is, and must surface as `StorageError::Unavailable`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short backend name used in errors and logs.
    fn name(&self) -> &str;

    /// Get the value stored at `key`, if present and not expired.
    async fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>>;

    /// Store `value` at `key`. `None` means no expiry.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()>;

    /// Remove `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> CairnResult<bool>;

    /// Whether a live entry exists at `key`.
    async fn contains(&self, key: &str) -> CairnResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Remove every entry.
    async fn flush_all(&self) -> CairnResult<()>;

    /// Remove every entry whose key starts with `prefix`.
    ///
    /// Returns the number of entries removed.
    async fn flush_prefix(&self, prefix: &str) -> CairnResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> CairnResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently stored (expired entries may be included
    /// until they are next touched).
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub memory_bytes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
