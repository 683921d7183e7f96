//! Cascading invalidation over a result cache and its tag registry.
//!
//! A *tag* is an entity instance key (`app-user:42`) or an entity class key
//! (`app-user`). Cached results are registered under every tag they depend
//! on; invalidating a tag deletes:
//!
//! 1. the entry stored directly at the tag (an entity's own cached snapshot)
//! 2. every cache key registered under the tag
//! 3. the registry entry itself
//!
//! All three steps always run. The contract is the post-condition (tag and
//! members absent), so deleting keys that are already gone is success and
//! repeating an invalidation changes nothing.
//!
//! The sequence is not atomic. A `register` racing an in-flight
//! `invalidate` can re-create the registry entry right after it is
//! dropped; the late member then survives until its own TTL or the next
//! invalidation of the tag.
//!
//! Instance and class tags are independent: invalidating `app-user:42`
//! leaves keys registered under `app-user` listed there, even if one of
//! them was just deleted through the instance tag.

use std::sync::Arc;

use cairn_core::{CairnResult, ClassRef, Entity, IdentityKeying};

use crate::backend::CacheBackend;
use crate::registry::ListRegistry;

/// What an invalidation touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    pub tag: String,
    /// Whether a live entry was stored directly at the tag.
    pub direct_entry_deleted: bool,
    /// Registered member keys visited, duplicates included.
    pub members_visited: usize,
    /// Member keys that were still live when deleted.
    pub members_deleted: usize,
}

/// Registers cached results under tags and invalidates them by tag.
///
/// Holds no mutable state of its own; every piece of coordination lives
/// in the backends, so one engine can be shared freely behind an `Arc`.
#[derive(Clone)]
pub struct InvalidationEngine {
    results: Arc<dyn CacheBackend>,
    registry: ListRegistry,
    keying: IdentityKeying,
}

impl InvalidationEngine {
    /// Create an engine over separate result and registry backends.
    pub fn new(
        results: Arc<dyn CacheBackend>,
        registry: Arc<dyn CacheBackend>,
        keying: IdentityKeying,
    ) -> Self {
        Self {
            results,
            registry: ListRegistry::new(registry),
            keying,
        }
    }

    /// Create an engine whose results and registry share one backend.
    pub fn with_shared_backend(backend: Arc<dyn CacheBackend>, keying: IdentityKeying) -> Self {
        Self::new(backend.clone(), backend, keying)
    }

    pub fn keying(&self) -> &IdentityKeying {
        &self.keying
    }

    pub fn results(&self) -> &dyn CacheBackend {
        self.results.as_ref()
    }

    pub fn registry(&self) -> &ListRegistry {
        &self.registry
    }

    /// Record that `cache_key` depends on `tag`.
    pub async fn register(&self, tag: &str, cache_key: &str) -> CairnResult<()> {
        tracing::trace!(tag, cache_key, "Registering cache key");
        self.registry
            .append(tag, cache_key)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, tag, cache_key, "Failed to register cache key"))
    }

    /// Register `cache_key` under the instance tag of `entity`.
    pub async fn register_query_result(&self, entity: &dyn Entity, cache_key: &str) -> CairnResult<()> {
        let tag = self.keying.instance_key_of(entity)?;
        self.register(&tag, cache_key).await
    }

    /// Register `cache_key` under the class tag of `class`.
    pub async fn register_query_for_type(&self, class: ClassRef<'_>, cache_key: &str) -> CairnResult<()> {
        let tag = self.keying.class_key_of(class)?;
        self.register(&tag, cache_key).await
    }

    /// Whether the result cache currently holds `cache_key`.
    pub async fn has(&self, cache_key: &str) -> CairnResult<bool> {
        self.results.contains(cache_key).await
    }

    /// Cache keys registered under `tag`.
    pub async fn members(&self, tag: &str) -> CairnResult<Vec<String>> {
        self.registry.members(tag).await
    }

    /// Delete the entry at `tag`, every key registered under it, and the
    /// registration list.
    pub async fn invalidate(&self, tag: &str) -> CairnResult<InvalidationReport> {
        let direct_entry_deleted = self
            .results
            .delete(tag)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, tag, "Failed to delete tagged entry"))?;

        let members = self.registry.members(tag).await?;
        let mut members_deleted = 0;
        for member in &members {
            let deleted = self.results.delete(member).await.inspect_err(|e| {
                tracing::warn!(error = %e, tag, member = %member, "Failed to delete registered key")
            })?;
            if deleted {
                members_deleted += 1;
            }
        }

        self.registry.drop_tag(tag).await?;

        tracing::debug!(
            tag,
            direct_entry_deleted,
            members = members.len(),
            members_deleted,
            "Invalidated tag"
        );

        Ok(InvalidationReport {
            tag: tag.to_string(),
            direct_entry_deleted,
            members_visited: members.len(),
            members_deleted,
        })
    }

    /// Invalidate everything cached for one entity instance.
    pub async fn invalidate_entity(&self, entity: &dyn Entity) -> CairnResult<InvalidationReport> {
        let tag = self.keying.instance_key_of(entity)?;
        self.invalidate(&tag).await
    }

    /// Invalidate every query registered against an entity type.
    pub async fn invalidate_entity_class(&self, class: ClassRef<'_>) -> CairnResult<InvalidationReport> {
        let tag = self.keying.class_key_of(class)?;
        self.invalidate(&tag).await
    }

    /// Flush the result cache and the registry.
    ///
    /// A full reset, not a selective invalidation.
    pub async fn clear(&self) -> CairnResult<()> {
        self.results.flush_all().await?;
        self.registry.clear().await?;
        tracing::info!(backend = self.results.name(), "Cleared result cache and tag registry");
        Ok(())
    }
}

impl std::fmt::Debug for InvalidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationEngine")
            .field("results", &self.results.name())
            .field("registry", &self.registry)
            .finish()
    }
}
