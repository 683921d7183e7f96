//! Tag registry: which cache keys were produced under which tag.
//!
//! Each tag owns one backend entry at `registered:<tag>` holding a JSON
//! array of cache keys. Appends are a read-modify-write against the
//! backend. Writers sharing one `ListRegistry` are serialized, but nothing
//! coordinates separate processes on a shared store, so two of them
//! appending to the same tag can lose one member. The engine tolerates
//! that: a lost member only means its key outlives an invalidation until
//! its own TTL.

use std::sync::Arc;

use cairn_core::{CacheKey, CairnResult, StorageError};

use tokio::sync::Mutex;

use crate::backend::CacheBackend;

/// Prefix of every registry entry key.
pub const REGISTRY_PREFIX: &str = "registered:";

/// Backend key of the registry entry for `tag`.
pub fn registry_key(tag: &str) -> String {
    format!("{}{}", REGISTRY_PREFIX, tag)
}

/// Append-only lists of cache keys, one per tag.
#[derive(Clone)]
pub struct ListRegistry {
    backend: Arc<dyn CacheBackend>,
    write_lock: Arc<Mutex<()>>,
}

impl ListRegistry {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn backend(&self) -> &dyn CacheBackend {
        self.backend.as_ref()
    }

    /// Add `member` to the list for `tag`, creating the list if needed.
    ///
    /// Duplicates are kept.
    pub async fn append(&self, tag: &str, member: &str) -> CairnResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut members = self.members(tag).await?;
        members.push(member.to_string());

        let bytes = serde_json::to_vec(&members).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
        self.backend.set(&registry_key(tag), &bytes, None).await
    }

    /// Members registered under `tag`, in registration order.
    ///
    /// A tag that was never registered (or was dropped) has no members.
    pub async fn members(&self, tag: &str) -> CairnResult<Vec<CacheKey>> {
        match self.backend.get(&registry_key(tag)).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::Serialization {
                    reason: format!("registry entry for {}: {}", tag, e),
                }
                .into()
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Remove the list for `tag`. Dropping a missing tag is a no-op.
    pub async fn drop_tag(&self, tag: &str) -> CairnResult<()> {
        let _guard = self.write_lock.lock().await;
        self.backend.delete(&registry_key(tag)).await.map(|_| ())
    }

    /// Remove every registry entry held by the backend.
    pub async fn clear(&self) -> CairnResult<()> {
        self.backend.flush_all().await
    }
}

impl std::fmt::Debug for ListRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListRegistry")
            .field("backend", &self.backend.name())
            .finish()
    }
}
