//! Entity lifecycle hooks.
//!
//! The persistence layer reports committed changes here and the bridge
//! turns them into invalidations:
//!
//! | event   | instance tag | class tag |
//! |---------|--------------|-----------|
//! | created |              | yes       |
//! | updated | yes          |           |
//! | deleted | yes          | yes       |
//!
//! A new row cannot be in any cached result yet, but it can change what a
//! type-wide query would return. An update changes the row in place, so
//! only results containing it go stale.

use std::sync::Arc;

use async_trait::async_trait;
use cairn_core::{CairnResult, ClassRef, Entity};

use crate::engine::InvalidationEngine;

/// A committed change to one entity.
#[derive(Clone, Copy)]
pub enum LifecycleEvent<'a> {
    Created(&'a dyn Entity),
    Updated(&'a dyn Entity),
    Deleted(&'a dyn Entity),
}

impl<'a> LifecycleEvent<'a> {
    pub fn entity(&self) -> &'a dyn Entity {
        match *self {
            LifecycleEvent::Created(e) | LifecycleEvent::Updated(e) | LifecycleEvent::Deleted(e) => e,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Created(_) => "created",
            LifecycleEvent::Updated(_) => "updated",
            LifecycleEvent::Deleted(_) => "deleted",
        }
    }
}

impl std::fmt::Debug for LifecycleEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEvent")
            .field("kind", &self.kind())
            .field("type_name", &self.entity().type_name())
            .finish()
    }
}

/// Receiver of entity lifecycle notifications.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn on_created(&self, entity: &dyn Entity) -> CairnResult<()>;
    async fn on_updated(&self, entity: &dyn Entity) -> CairnResult<()>;
    async fn on_deleted(&self, entity: &dyn Entity) -> CairnResult<()>;

    /// Dispatch an event to the matching hook.
    async fn handle(&self, event: LifecycleEvent<'_>) -> CairnResult<()> {
        match event {
            LifecycleEvent::Created(entity) => self.on_created(entity).await,
            LifecycleEvent::Updated(entity) => self.on_updated(entity).await,
            LifecycleEvent::Deleted(entity) => self.on_deleted(entity).await,
        }
    }
}

/// Invalidates cached results as entities change.
#[derive(Debug, Clone)]
pub struct LifecycleBridge {
    engine: Arc<InvalidationEngine>,
}

impl LifecycleBridge {
    pub fn new(engine: Arc<InvalidationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<InvalidationEngine> {
        &self.engine
    }
}

#[async_trait]
impl LifecycleListener for LifecycleBridge {
    async fn on_created(&self, entity: &dyn Entity) -> CairnResult<()> {
        let report = self
            .engine
            .invalidate_entity_class(ClassRef::Instance(entity))
            .await?;
        tracing::debug!(tag = %report.tag, members = report.members_visited, "Entity created");
        Ok(())
    }

    async fn on_updated(&self, entity: &dyn Entity) -> CairnResult<()> {
        let report = self.engine.invalidate_entity(entity).await?;
        tracing::debug!(tag = %report.tag, members = report.members_visited, "Entity updated");
        Ok(())
    }

    async fn on_deleted(&self, entity: &dyn Entity) -> CairnResult<()> {
        let instance = self.engine.invalidate_entity(entity).await?;
        let class = self
            .engine
            .invalidate_entity_class(ClassRef::Instance(entity))
            .await?;
        tracing::debug!(
            instance_tag = %instance.tag,
            class_tag = %class.tag,
            members = instance.members_visited + class.members_visited,
            "Entity deleted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheBackend, InMemoryBackend};
    use cairn_core::{Identifier, IdentityKeying, StaticTypeResolver};

    struct Comment(i64);

    impl Entity for Comment {
        fn type_name(&self) -> &str {
            "Blog.Comment"
        }

        fn identifier(&self) -> Option<Identifier> {
            Some(Identifier::single("id", self.0))
        }
    }

    async fn setup() -> (LifecycleBridge, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let keying = IdentityKeying::new(Arc::new(StaticTypeResolver::new()));
        let engine = Arc::new(InvalidationEngine::with_shared_backend(backend.clone(), keying));

        for key in ["by-instance", "by-class", "blog-comment:1"] {
            backend.set(key, b"[]", None).await.unwrap();
        }
        engine.register("blog-comment:1", "by-instance").await.unwrap();
        engine.register("blog-comment", "by-class").await.unwrap();

        (LifecycleBridge::new(engine), backend)
    }

    #[tokio::test]
    async fn test_created_invalidates_class_only() {
        let (bridge, backend) = setup().await;
        bridge.on_created(&Comment(2)).await.unwrap();

        assert!(!backend.contains("by-class").await.unwrap());
        assert!(backend.contains("by-instance").await.unwrap());
    }

    #[tokio::test]
    async fn test_updated_invalidates_instance_only() {
        let (bridge, backend) = setup().await;
        bridge.on_updated(&Comment(1)).await.unwrap();

        assert!(!backend.contains("by-instance").await.unwrap());
        assert!(!backend.contains("blog-comment:1").await.unwrap());
        assert!(backend.contains("by-class").await.unwrap());
    }

    #[tokio::test]
    async fn test_deleted_invalidates_both() {
        let (bridge, backend) = setup().await;
        bridge.handle(LifecycleEvent::Deleted(&Comment(1))).await.unwrap();

        assert!(!backend.contains("by-instance").await.unwrap());
        assert!(!backend.contains("by-class").await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_dispatches() {
        let (bridge, backend) = setup().await;
        bridge.handle(LifecycleEvent::Updated(&Comment(1))).await.unwrap();
        assert!(backend.contains("by-class").await.unwrap());

        bridge.handle(LifecycleEvent::Created(&Comment(3))).await.unwrap();
        assert!(!backend.contains("by-class").await.unwrap());
    }

    #[test]
    fn test_event_debug() {
        let comment = Comment(1);
        let rendered = format!("{:?}", LifecycleEvent::Created(&comment));
        assert!(rendered.contains("created"));
        assert!(rendered.contains("Blog.Comment"));
    }
}
