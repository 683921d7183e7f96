//! End-to-end tests: facade, lifecycle hooks and backends working together.

use std::sync::Arc;
use std::time::Duration;

use cairn_core::{CairnConfig, ClassRef, IdValue};
use cairn_storage::{
    BackendSet, CacheBackend, CacheTtl, InMemoryBackend, InvalidationEngine, LifecycleBridge,
    LifecycleEvent, LifecycleListener, LmdbBackend, NamespacedBackend, QueryDescriptor,
    ResultCacheConfig, ResultCacheFacade,
};
use cairn_test_utils::{
    assertions, fixtures, init_test_tracing, FailingBackend, InMemoryExecutor, Membership, Record,
};
use uuid::Uuid;

struct Harness {
    facade: ResultCacheFacade<InMemoryExecutor>,
    bridge: LifecycleBridge,
    executor: Arc<InMemoryExecutor>,
}

fn harness_over(backend: Arc<dyn CacheBackend>, rows: Vec<Record>) -> Harness {
    init_test_tracing();
    let engine = Arc::new(InvalidationEngine::with_shared_backend(
        backend.clone(),
        fixtures::keying(),
    ));
    let executor = Arc::new(InMemoryExecutor::new(backend, fixtures::keying(), rows));
    Harness {
        facade: ResultCacheFacade::with_defaults(engine.clone(), executor.clone()),
        bridge: LifecycleBridge::new(engine),
        executor,
    }
}

fn harness() -> Harness {
    harness_over(Arc::new(InMemoryBackend::new()), fixtures::sample_records())
}

fn users() -> QueryDescriptor {
    QueryDescriptor::new("SELECT u FROM Acme:User u")
}

#[tokio::test]
async fn test_two_row_scenario() {
    let rows = vec![fixtures::user(1, "ada"), fixtures::user(2, "brian")];
    let h = harness_over(Arc::new(InMemoryBackend::new()), rows);
    let engine = h.facade.engine().clone();

    let lookup = h
        .facade
        .lookup(&users(), CacheTtl::Default, Some("q1".to_string()))
        .await
        .unwrap();
    assert_eq!(lookup.results.len(), 2);

    assertions::assert_registered(&engine, "acme-entity-user", "q1").await;
    assertions::assert_registered(&engine, "acme-entity-user:1", "q1").await;
    assertions::assert_registered(&engine, "acme-entity-user:2", "q1").await;

    engine
        .invalidate_entity(&fixtures::user(1, "ada"))
        .await
        .unwrap();

    assert!(!engine.has("q1").await.unwrap());
    // The class tag is not cleaned up by an instance invalidation.
    assertions::assert_registered(&engine, "acme-entity-user", "q1").await;
    assertions::assert_registered(&engine, "acme-entity-user:2", "q1").await;
    assert!(engine.members("acme-entity-user:1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_refreshes_stale_results() {
    let h = harness();

    let before = h.facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert!(before.results.contains(&fixtures::user(2, "brian")));

    let renamed = fixtures::user(2, "bruno");
    h.executor.upsert(renamed.clone());
    h.bridge.handle(LifecycleEvent::Updated(&renamed)).await.unwrap();

    let after = h.facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert!(!after.was_hit);
    assert!(after.results.contains(&renamed));
    assert_eq!(h.executor.executions(), 2);
}

#[tokio::test]
async fn test_create_refreshes_type_wide_queries() {
    let h = harness();
    let before = h.facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert_eq!(before.results.len(), 3);

    let created = fixtures::user(4, "dora");
    h.executor.upsert(created.clone());
    h.bridge.on_created(&created).await.unwrap();

    let after = h.facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert_eq!(after.results.len(), 4);
}

#[tokio::test]
async fn test_delete_evicts_find_and_queries() {
    let h = harness();
    let user = h
        .facade
        .find(ClassRef::Type("Acme:User"), IdValue::Int(3), CacheTtl::Default)
        .await
        .unwrap()
        .unwrap();
    let listing = h.facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert!(h.facade.has("acme-entity-user:3").await.unwrap());

    h.executor.remove(&user);
    h.bridge.on_deleted(&user).await.unwrap();

    assertions::assert_evicted(h.facade.engine(), &["acme-entity-user:3", &listing.cache_key]).await;
    let gone = h
        .facade
        .find(ClassRef::Type("Acme:User"), IdValue::Int(3), CacheTtl::Default)
        .await
        .unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn test_unrelated_type_survives() {
    let h = harness();
    let posts = QueryDescriptor::new("SELECT p FROM Acme.Entity.Post p");
    let cached_posts = h.facade.lookup(&posts, CacheTtl::Default, None).await.unwrap();

    h.facade
        .invalidate_entity_class(ClassRef::Type("Acme:User"))
        .await
        .unwrap();

    assert!(h.facade.has(&cached_posts.cache_key).await.unwrap());
}

#[tokio::test]
async fn test_proxy_rows_share_tags_with_real_type() {
    let h = harness();
    let engine = h.facade.engine().clone();
    let proxy = Record::new("Proxies.__CG__.Acme.Entity.User", 1, "ada");
    engine.register_query_result(&proxy, "via-proxy").await.unwrap();

    assertions::assert_registered(&engine, "acme-entity-user:1", "via-proxy").await;
}

#[tokio::test]
async fn test_composite_identity_tags() {
    let h = harness();
    let engine = h.facade.engine().clone();
    let membership = Membership {
        group_id: Uuid::nil(),
        user_id: 9,
    };
    engine
        .register_query_result(&membership, "members-of-nil")
        .await
        .unwrap();

    let report = engine.invalidate_entity(&membership).await.unwrap();
    assert_eq!(report.members_visited, 1);
    assert!(report.tag.starts_with("acme-entity-membership:{"));
}

#[tokio::test]
async fn test_expired_result_is_recomputed_and_reregistered() {
    let backend = Arc::new(InMemoryBackend::new());
    let engine = Arc::new(InvalidationEngine::with_shared_backend(
        backend.clone(),
        fixtures::keying(),
    ));
    let executor = Arc::new(InMemoryExecutor::new(
        backend,
        fixtures::keying(),
        fixtures::sample_records(),
    ));
    let facade = ResultCacheFacade::new(
        engine.clone(),
        executor.clone(),
        ResultCacheConfig::new().with_default_ttl(Duration::from_millis(30)),
    );

    let first = facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!facade.has(&first.cache_key).await.unwrap());

    let second = facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert!(!second.was_hit);
    assert_eq!(executor.executions(), 2);
    // Absent before the call, so registered again; duplicates are harmless.
    assert_eq!(engine.members("acme-entity-user").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unavailable_backend_propagates() {
    let h = harness_over(Arc::new(FailingBackend::default()), fixtures::sample_records());

    assertions::assert_unavailable(&h.facade.lookup(&users(), CacheTtl::Default, None).await);
    assertions::assert_unavailable(&h.facade.invalidate_entity(&fixtures::user(1, "ada")).await);
    assertions::assert_unavailable(&h.facade.clear().await);
}

#[tokio::test]
async fn test_failed_registration_drops_the_stored_result() {
    init_test_tracing();
    let results = Arc::new(InMemoryBackend::new());
    let engine = Arc::new(InvalidationEngine::new(
        results.clone(),
        Arc::new(FailingBackend::default()),
        fixtures::keying(),
    ));
    let executor = Arc::new(InMemoryExecutor::new(
        results.clone(),
        fixtures::keying(),
        fixtures::sample_records(),
    ));
    let facade = ResultCacheFacade::with_defaults(engine, executor.clone());

    assertions::assert_unavailable(
        &facade
            .lookup(&users(), CacheTtl::Default, Some("q1".to_string()))
            .await,
    );
    assert!(!results.contains("q1").await.unwrap());

    // The next call executes again instead of trusting an untagged entry.
    assertions::assert_unavailable(
        &facade
            .lookup(&users(), CacheTtl::Default, Some("q1".to_string()))
            .await,
    );
    assert_eq!(executor.executions(), 2);
}

#[tokio::test]
async fn test_uncached_lookup_works_without_backend() {
    let h = harness_over(Arc::new(FailingBackend::default()), fixtures::sample_records());

    let lookup = h.facade.lookup(&users(), CacheTtl::Disabled, None).await.unwrap();
    assert_eq!(lookup.results.len(), 3);
}

#[tokio::test]
async fn test_unsaved_entity_is_rejected() {
    let h = harness();
    assertions::assert_missing_identity(
        &h.facade
            .invalidate_entity(&cairn_test_utils::Unsaved)
            .await,
    );
}

#[tokio::test]
async fn test_lmdb_backed_cache_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let backend = Arc::new(LmdbBackend::open(dir.path(), 16).unwrap());
        let h = harness_over(backend, fixtures::sample_records());
        h.facade
            .lookup(&users(), CacheTtl::Default, Some("users".to_string()))
            .await
            .unwrap();
    }

    let backend: Arc<dyn CacheBackend> = Arc::new(LmdbBackend::open(dir.path(), 16).unwrap());
    let engine = InvalidationEngine::with_shared_backend(backend, fixtures::keying());
    assert!(engine.has("users").await.unwrap());
    assertions::assert_registered(&engine, "acme-entity-user:2", "users").await;

    engine
        .invalidate_entity(&fixtures::user(2, "brian"))
        .await
        .unwrap();
    assert!(!engine.has("users").await.unwrap());
}

#[tokio::test]
async fn test_engines_on_shared_store_are_isolated() {
    let shared = Arc::new(InMemoryBackend::new());
    let first = harness_over(
        Arc::new(NamespacedBackend::new(shared.clone(), "first").unwrap()),
        fixtures::sample_records(),
    );
    let second = harness_over(
        Arc::new(NamespacedBackend::new(shared.clone(), "second").unwrap()),
        fixtures::sample_records(),
    );

    let a = first.facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    let b = second.facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert_eq!(a.cache_key, b.cache_key);

    first.facade.clear().await.unwrap();

    assert!(!first.facade.has(&a.cache_key).await.unwrap());
    assert!(second.facade.has(&b.cache_key).await.unwrap());
}

#[tokio::test]
async fn test_wired_from_config() {
    let config = CairnConfig::from_toml_str(
        r#"
[clients.default]
type = "memory"
prefix = "app"

[entity_cache]
client = "default"
default_ttl = 3600

[entity_cache.aliases]
Acme = "Acme.Entity"
"#,
    )
    .unwrap();
    let backends = BackendSet::from_config(&config, Default::default()).unwrap();
    let executor = Arc::new(InMemoryExecutor::new(
        backends.get("default").unwrap(),
        fixtures::keying(),
        fixtures::sample_records(),
    ));

    let (facade, bridge) = backends.entity_cache(&config, executor).unwrap();
    assert_eq!(facade.config().default_ttl, Some(Duration::from_secs(3600)));

    let lookup = facade.lookup(&users(), CacheTtl::Default, None).await.unwrap();
    assert!(facade.has(&lookup.cache_key).await.unwrap());

    bridge.on_updated(&fixtures::user(1, "ada")).await.unwrap();
    assert!(!facade.has(&lookup.cache_key).await.unwrap());
}
