//! Query-level entry point of the result cache.
//!
//! [`ResultCacheFacade::lookup`] runs a query through a [`QueryExecutor`],
//! passing it the cache key and TTL to read through, and on the first
//! write of a key registers that key under the class tag of the result
//! type and the instance tag of every returned row. Later invalidation of
//! any of those entities (or of the type) evicts the cached result.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CacheKey, CairnResult, ClassRef, Entity, EntityCacheConfig, IdValue, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::backend::CacheBackend;
use crate::engine::{InvalidationEngine, InvalidationReport};

/// Shape the executor materializes rows into. Part of the fingerprint:
/// the same query hydrated two ways caches two different results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationMode {
    #[default]
    Entity,
    Array,
    Scalar,
    SingleScalar,
}

/// Everything that distinguishes one query execution from another.
///
/// Query text is kept verbatim; two texts that differ in any byte, whitespace
/// included, are different queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub text: String,
    pub parameters: BTreeMap<String, Value>,
    pub positional: Vec<Value>,
    pub first_result: Option<u64>,
    pub max_results: Option<u64>,
    pub hydration: HydrationMode,
    pub hints: BTreeMap<String, Value>,
}

impl QueryDescriptor {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    /// Bind a named parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Bind the next positional parameter.
    pub fn with_positional(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn with_first_result(mut self, first: u64) -> Self {
        self.first_result = Some(first);
        self
    }

    pub fn with_max_results(mut self, max: u64) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn with_hydration(mut self, hydration: HydrationMode) -> Self {
        self.hydration = hydration;
        self
    }

    pub fn with_hint(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.hints.insert(name.into(), value.into());
        self
    }
}

/// Deterministic cache key for a query: SHA-256 (hex) of its canonical
/// JSON form.
pub fn fingerprint_of(query: &QueryDescriptor) -> CacheKey {
    let canonical = serde_json::to_value(query)
        .map(canonicalize)
        .map(|value| value.to_string())
        .unwrap_or_else(|_| query.text.clone());
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Rebuild every object with its keys in sorted order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Per-call caching choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheTtl {
    /// Execute without caching and without registering anything.
    Disabled,
    /// Cache with the facade's configured default TTL.
    #[default]
    Default,
    /// Cache for exactly this long.
    Expires(Duration),
}

/// What the executor is asked to read through: the key and how long to
/// keep a freshly stored result (`None` = no expiry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCachePolicy {
    pub key: CacheKey,
    pub ttl: Option<Duration>,
}

/// Runs queries against the system of record.
///
/// Implementations own read-through: given a policy they return the cached
/// result under `policy.key` when present and otherwise execute, store the
/// result with `policy.ttl`, and return it. [`read_through`] and
/// [`read_through_optional`] do exactly that for serde-serializable rows.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    type Row: Entity;

    async fn execute(
        &self,
        query: &QueryDescriptor,
        policy: Option<&ResultCachePolicy>,
    ) -> CairnResult<Vec<Self::Row>>;

    /// Load one entity of `class` by primary key.
    async fn find(
        &self,
        class: ClassRef<'_>,
        id: &IdValue,
        policy: Option<&ResultCachePolicy>,
    ) -> CairnResult<Option<Self::Row>>;
}

/// Serve `policy.key` from `backend` or run `load` and store its output.
///
/// Without a policy `load` runs and nothing is stored. A cached payload
/// that no longer decodes as `T` is treated as a miss and overwritten.
pub async fn read_through<T, F, Fut>(
    backend: &dyn CacheBackend,
    policy: Option<&ResultCachePolicy>,
    load: F,
) -> CairnResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CairnResult<T>>,
{
    let Some(policy) = policy else {
        return load().await;
    };
    if let Some(value) = cached(backend, &policy.key).await? {
        return Ok(value);
    }
    let value = load().await?;
    store(backend, policy, &value).await?;
    Ok(value)
}

/// Like [`read_through`], but a `None` from `load` is not cached, so a
/// later insert of the missing entity is seen on the next read.
pub async fn read_through_optional<T, F, Fut>(
    backend: &dyn CacheBackend,
    policy: Option<&ResultCachePolicy>,
    load: F,
) -> CairnResult<Option<T>>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CairnResult<Option<T>>>,
{
    let Some(policy) = policy else {
        return load().await;
    };
    if let Some(value) = cached(backend, &policy.key).await? {
        return Ok(Some(value));
    }
    let value = load().await?;
    if let Some(found) = &value {
        store(backend, policy, found).await?;
    }
    Ok(value)
}

async fn cached<T: DeserializeOwned>(backend: &dyn CacheBackend, key: &str) -> CairnResult<Option<T>> {
    let Some(bytes) = backend.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding undecodable cached result");
            Ok(None)
        }
    }
}

async fn store<T: Serialize>(
    backend: &dyn CacheBackend,
    policy: &ResultCachePolicy,
    value: &T,
) -> CairnResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
        reason: e.to_string(),
    })?;
    backend.set(&policy.key, &bytes, policy.ttl).await
}

/// Configuration for the result cache facade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultCacheConfig {
    /// TTL applied for [`CacheTtl::Default`]; `None` keeps entries until
    /// invalidated.
    pub default_ttl: Option<Duration>,
}

impl ResultCacheConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Resolve a per-call choice to a TTL, or `None` when caching is off.
    pub fn resolve(&self, ttl: CacheTtl) -> Option<Option<Duration>> {
        match ttl {
            CacheTtl::Disabled => None,
            CacheTtl::Default => Some(self.default_ttl),
            CacheTtl::Expires(ttl) => Some(Some(ttl)),
        }
    }
}

impl From<&EntityCacheConfig> for ResultCacheConfig {
    fn from(config: &EntityCacheConfig) -> Self {
        Self {
            default_ttl: config.default_ttl(),
        }
    }
}

/// Outcome of [`ResultCacheFacade::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub struct Lookup<R> {
    pub results: Vec<R>,
    /// Key the result is (or would be) cached under.
    pub cache_key: CacheKey,
    /// Whether the key was already cached before the call.
    pub was_hit: bool,
}

/// Cached query execution with tag registration.
pub struct ResultCacheFacade<X> {
    engine: Arc<InvalidationEngine>,
    executor: Arc<X>,
    config: ResultCacheConfig,
}

impl<X> ResultCacheFacade<X>
where
    X: QueryExecutor,
{
    pub fn new(engine: Arc<InvalidationEngine>, executor: Arc<X>, config: ResultCacheConfig) -> Self {
        Self {
            engine,
            executor,
            config,
        }
    }

    /// Facade with no default TTL.
    pub fn with_defaults(engine: Arc<InvalidationEngine>, executor: Arc<X>) -> Self {
        Self::new(engine, executor, ResultCacheConfig::default())
    }

    pub fn engine(&self) -> &Arc<InvalidationEngine> {
        &self.engine
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    pub fn config(&self) -> &ResultCacheConfig {
        &self.config
    }

    /// Execute `query`, caching under `key` (or its fingerprint) when `ttl`
    /// allows it.
    ///
    /// Tags are registered only when this call wrote the key: caching is
    /// enabled, the key was absent beforehand and at least one row came
    /// back. The first row's type becomes the class tag.
    pub async fn lookup(
        &self,
        query: &QueryDescriptor,
        ttl: CacheTtl,
        key: Option<CacheKey>,
    ) -> CairnResult<Lookup<X::Row>> {
        let cache_key = key.unwrap_or_else(|| fingerprint_of(query));
        let policy = self.config.resolve(ttl).map(|ttl| ResultCachePolicy {
            key: cache_key.clone(),
            ttl,
        });

        let was_hit = match &policy {
            Some(_) => self.engine.has(&cache_key).await?,
            None => false,
        };

        let results = self.executor.execute(query, policy.as_ref()).await?;

        if policy.is_some() && !was_hit && !results.is_empty() {
            if let Err(e) = self.register_rows(&results, &cache_key).await {
                // An untagged entry would outlive every invalidation.
                if let Err(cleanup) = self.engine.results().delete(&cache_key).await {
                    tracing::warn!(
                        cache_key = %cache_key,
                        error = %cleanup,
                        "Failed to drop unregistered query result"
                    );
                }
                return Err(e);
            }
            tracing::debug!(
                cache_key = %cache_key,
                rows = results.len(),
                "Registered query result"
            );
        }

        Ok(Lookup {
            results,
            cache_key,
            was_hit,
        })
    }

    async fn register_rows(&self, rows: &[X::Row], cache_key: &str) -> CairnResult<()> {
        let Some(first) = rows.first() else {
            return Ok(());
        };
        self.engine
            .register_query_for_type(ClassRef::Instance(first), cache_key)
            .await?;
        for row in rows {
            self.engine.register_query_result(row, cache_key).await?;
        }
        Ok(())
    }

    /// Load one entity by id, cached under its own instance key.
    ///
    /// Nothing is registered: `invalidate_entity` deletes the entry at the
    /// instance key directly.
    pub async fn find(&self, class: ClassRef<'_>, id: IdValue, ttl: CacheTtl) -> CairnResult<Option<X::Row>> {
        let policy = match self.config.resolve(ttl) {
            Some(ttl) => Some(ResultCachePolicy {
                key: self.engine.keying().entity_key_for(class, &id)?,
                ttl,
            }),
            None => None,
        };
        self.executor.find(class, &id, policy.as_ref()).await
    }

    pub async fn has(&self, cache_key: &str) -> CairnResult<bool> {
        self.engine.has(cache_key).await
    }

    pub async fn invalidate_entity(&self, entity: &dyn Entity) -> CairnResult<InvalidationReport> {
        self.engine.invalidate_entity(entity).await
    }

    pub async fn invalidate_entity_class(&self, class: ClassRef<'_>) -> CairnResult<InvalidationReport> {
        self.engine.invalidate_entity_class(class).await
    }

    pub async fn clear(&self) -> CairnResult<()> {
        self.engine.clear().await
    }
}

impl<X> Clone for ResultCacheFacade<X> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            executor: self.executor.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use cairn_core::{Identifier, IdentityKeying, StaticTypeResolver};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        id: i64,
    }

    impl Entity for Post {
        fn type_name(&self) -> &str {
            "Blog.Post"
        }

        fn identifier(&self) -> Option<Identifier> {
            Some(Identifier::single("id", self.id))
        }
    }

    struct Posts {
        cache: Arc<dyn CacheBackend>,
        rows: Vec<Post>,
        executions: AtomicUsize,
    }

    #[async_trait]
    impl QueryExecutor for Posts {
        type Row = Post;

        async fn execute(
            &self,
            _query: &QueryDescriptor,
            policy: Option<&ResultCachePolicy>,
        ) -> CairnResult<Vec<Post>> {
            read_through(self.cache.as_ref(), policy, || async {
                self.executions.fetch_add(1, Ordering::SeqCst);
                Ok(self.rows.clone())
            })
            .await
        }

        async fn find(
            &self,
            _class: ClassRef<'_>,
            id: &IdValue,
            policy: Option<&ResultCachePolicy>,
        ) -> CairnResult<Option<Post>> {
            read_through_optional(self.cache.as_ref(), policy, || async {
                self.executions.fetch_add(1, Ordering::SeqCst);
                Ok(self.rows.iter().find(|p| IdValue::Int(p.id) == *id).cloned())
            })
            .await
        }
    }

    fn facade(rows: Vec<Post>) -> ResultCacheFacade<Posts> {
        let backend: Arc<dyn CacheBackend> = Arc::new(InMemoryBackend::new());
        let keying = IdentityKeying::new(Arc::new(StaticTypeResolver::new()));
        let engine = Arc::new(InvalidationEngine::with_shared_backend(backend.clone(), keying));
        let executor = Arc::new(Posts {
            cache: backend,
            rows,
            executions: AtomicUsize::new(0),
        });
        ResultCacheFacade::with_defaults(engine, executor)
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let a = QueryDescriptor::new("SELECT p FROM Post p WHERE p.a = :a AND p.b = :b")
            .with_parameter("a", 1)
            .with_parameter("b", "x")
            .with_hint("fetch", "eager")
            .with_hint("lock", false);
        let b = QueryDescriptor::new("SELECT p FROM Post p WHERE p.a = :a AND p.b = :b")
            .with_hint("lock", false)
            .with_hint("fetch", "eager")
            .with_parameter("b", "x")
            .with_parameter("a", 1);

        assert_eq!(fingerprint_of(&a), fingerprint_of(&b));
        assert_eq!(fingerprint_of(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_keeps_whitespace_inside_literals() {
        let wide = QueryDescriptor::new("SELECT u FROM User u WHERE u.name = 'a  b'");
        let narrow = QueryDescriptor::new("SELECT u FROM User u WHERE u.name = 'a b'");

        assert_eq!(wide.text, "SELECT u FROM User u WHERE u.name = 'a  b'");
        assert_ne!(fingerprint_of(&wide), fingerprint_of(&narrow));
    }

    #[test]
    fn test_fingerprint_differs_on_pagination_and_hydration() {
        let base = QueryDescriptor::new("SELECT p FROM Post p");
        let paged = base.clone().with_first_result(10).with_max_results(10);
        let arrays = base.clone().with_hydration(HydrationMode::Array);
        let positional = base.clone().with_positional(json!([1, 2]));

        assert_ne!(fingerprint_of(&base), fingerprint_of(&paged));
        assert_ne!(fingerprint_of(&base), fingerprint_of(&arrays));
        assert_ne!(fingerprint_of(&base), fingerprint_of(&positional));
    }

    #[test]
    fn test_ttl_resolution() {
        let config = ResultCacheConfig::new().with_default_ttl(Duration::from_secs(60));
        assert_eq!(config.resolve(CacheTtl::Disabled), None);
        assert_eq!(config.resolve(CacheTtl::Default), Some(Some(Duration::from_secs(60))));
        assert_eq!(
            config.resolve(CacheTtl::Expires(Duration::from_secs(5))),
            Some(Some(Duration::from_secs(5)))
        );
        assert_eq!(ResultCacheConfig::new().resolve(CacheTtl::Default), Some(None));
    }

    #[tokio::test]
    async fn test_first_lookup_registers_and_second_hits() {
        let facade = facade(vec![Post { id: 1 }, Post { id: 2 }]);
        let query = QueryDescriptor::new("SELECT p FROM Post p");

        let first = facade.lookup(&query, CacheTtl::Default, None).await.unwrap();
        assert!(!first.was_hit);
        assert_eq!(first.results.len(), 2);
        assert!(facade.has(&first.cache_key).await.unwrap());

        let engine = facade.engine();
        assert_eq!(engine.members("blog-post").await.unwrap(), vec![first.cache_key.clone()]);
        assert_eq!(engine.members("blog-post:1").await.unwrap(), vec![first.cache_key.clone()]);
        assert_eq!(engine.members("blog-post:2").await.unwrap(), vec![first.cache_key.clone()]);

        let second = facade.lookup(&query, CacheTtl::Default, None).await.unwrap();
        assert!(second.was_hit);
        assert_eq!(second.results, first.results);
        assert_eq!(facade.executor().executions.load(Ordering::SeqCst), 1);
        assert_eq!(engine.members("blog-post").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_key_is_used() {
        let facade = facade(vec![Post { id: 1 }]);
        let query = QueryDescriptor::new("SELECT p FROM Post p");

        let lookup = facade
            .lookup(&query, CacheTtl::Default, Some("recent-posts".to_string()))
            .await
            .unwrap();

        assert_eq!(lookup.cache_key, "recent-posts");
        assert!(facade.has("recent-posts").await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_caching_registers_nothing() {
        let facade = facade(vec![Post { id: 1 }]);
        let query = QueryDescriptor::new("SELECT p FROM Post p");

        let lookup = facade.lookup(&query, CacheTtl::Disabled, None).await.unwrap();

        assert!(!lookup.was_hit);
        assert!(!facade.has(&lookup.cache_key).await.unwrap());
        assert!(facade.engine().members("blog-post").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_result_is_not_registered() {
        let facade = facade(Vec::new());
        let query = QueryDescriptor::new("SELECT p FROM Post p");

        let lookup = facade.lookup(&query, CacheTtl::Default, None).await.unwrap();

        assert!(lookup.results.is_empty());
        assert!(facade.engine().members("blog-post").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidating_a_row_evicts_the_query() {
        let facade = facade(vec![Post { id: 1 }, Post { id: 2 }]);
        let query = QueryDescriptor::new("SELECT p FROM Post p");
        let lookup = facade.lookup(&query, CacheTtl::Default, None).await.unwrap();

        facade.invalidate_entity(&Post { id: 2 }).await.unwrap();

        assert!(!facade.has(&lookup.cache_key).await.unwrap());
        let again = facade.lookup(&query, CacheTtl::Default, None).await.unwrap();
        assert!(!again.was_hit);
        assert_eq!(facade.executor().executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_find_caches_under_instance_key() {
        let facade = facade(vec![Post { id: 7 }]);

        let found = facade
            .find(ClassRef::Type("Blog.Post"), IdValue::Int(7), CacheTtl::Default)
            .await
            .unwrap();
        assert_eq!(found, Some(Post { id: 7 }));
        assert!(facade.has("blog-post:7").await.unwrap());

        facade
            .find(ClassRef::Type("Blog.Post"), IdValue::Int(7), CacheTtl::Default)
            .await
            .unwrap();
        assert_eq!(facade.executor().executions.load(Ordering::SeqCst), 1);

        facade.invalidate_entity(&Post { id: 7 }).await.unwrap();
        assert!(!facade.has("blog-post:7").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_does_not_cache_missing_entity() {
        let facade = facade(Vec::new());

        let found = facade
            .find(ClassRef::Type("Blog.Post"), IdValue::Int(9), CacheTtl::Default)
            .await
            .unwrap();

        assert_eq!(found, None);
        assert!(!facade.has("blog-post:9").await.unwrap());
    }
}
