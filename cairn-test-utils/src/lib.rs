//! Cairn Test Utilities
//!
//! Shared test infrastructure for the Cairn workspace:
//! - Fixture entities and an in-memory query executor
//! - A backend that always fails, for error propagation tests
//! - Proptest generators
//! - Assertions on cache state

pub use cairn_core::{
    CairnError, CairnResult, ClassRef, Entity, IdValue, Identifier, IdentityKeying, KeyingError,
    StaticTypeResolver, StorageError,
};
pub use cairn_storage::{
    read_through, read_through_optional, CacheBackend, CacheStats, InMemoryBackend,
    InvalidationEngine, QueryDescriptor, QueryExecutor, ResultCachePolicy,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

/// Generic persisted row: a type name, an integer key and one column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub type_name: String,
    pub id: i64,
    pub name: String,
}

impl Record {
    pub fn new(type_name: impl Into<String>, id: i64, name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id,
            name: name.into(),
        }
    }
}

impl Entity for Record {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn identifier(&self) -> Option<Identifier> {
        Some(Identifier::single("id", self.id))
    }
}

/// Join-table row identified by two columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub group_id: Uuid,
    pub user_id: i64,
}

impl Entity for Membership {
    fn type_name(&self) -> &str {
        "Acme.Entity.Membership"
    }

    fn identifier(&self) -> Option<Identifier> {
        Some(Identifier::composite([
            ("group_id", IdValue::Uuid(self.group_id)),
            ("user_id", IdValue::Int(self.user_id)),
        ]))
    }
}

/// Entity that has not been assigned an identity yet.
#[derive(Debug, Clone, Default)]
pub struct Unsaved;

impl Entity for Unsaved {
    fn type_name(&self) -> &str {
        "Acme.Entity.Draft"
    }

    fn identifier(&self) -> Option<Identifier> {
        None
    }
}

// ============================================================================
// MOCK EXECUTOR AND BACKENDS
// ============================================================================

/// Query executor over an in-memory table of [`Record`]s.
///
/// Understands `... FROM <Type> ...` query text, `id`/`name` named
/// parameters and pagination, and reads through `cache` when given a
/// policy. Counts how often it actually hit the table.
pub struct InMemoryExecutor {
    cache: Arc<dyn CacheBackend>,
    keying: IdentityKeying,
    rows: RwLock<Vec<Record>>,
    executions: AtomicUsize,
}

impl InMemoryExecutor {
    pub fn new(cache: Arc<dyn CacheBackend>, keying: IdentityKeying, rows: Vec<Record>) -> Self {
        Self {
            cache,
            keying,
            rows: RwLock::new(rows),
            executions: AtomicUsize::new(0),
        }
    }

    /// Times the table was scanned (cache misses and uncached calls).
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Insert or replace a row, as a write to the system of record would.
    pub fn upsert(&self, record: Record) {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        match rows
            .iter_mut()
            .find(|r| r.type_name == record.type_name && r.id == record.id)
        {
            Some(existing) => *existing = record,
            None => rows.push(record),
        }
    }

    pub fn remove(&self, record: &Record) {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.retain(|r| !(r.type_name == record.type_name && r.id == record.id));
    }

    fn scan(&self, query: &QueryDescriptor) -> CairnResult<Vec<Record>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let class_key = match from_clause(&query.text) {
            Some(type_name) => Some(self.keying.class_key_of(ClassRef::Type(type_name))?),
            None => None,
        };

        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let mut matched = Vec::new();
        for row in rows.iter() {
            if let Some(class_key) = &class_key {
                if self.keying.class_key_of(ClassRef::Instance(row))? != *class_key {
                    continue;
                }
            }
            if let Some(id) = query.parameters.get("id") {
                if id.as_i64() != Some(row.id) {
                    continue;
                }
            }
            if let Some(name) = query.parameters.get("name") {
                if name.as_str() != Some(row.name.as_str()) {
                    continue;
                }
            }
            matched.push(row.clone());
        }

        let first = query.first_result.unwrap_or(0) as usize;
        let max = query.max_results.map_or(usize::MAX, |m| m as usize);
        Ok(matched.into_iter().skip(first).take(max).collect())
    }
}

/// Type name following `FROM`, if any.
fn from_clause(text: &str) -> Option<&str> {
    let mut words = text.split_whitespace();
    words.find(|w| w.eq_ignore_ascii_case("from"))?;
    words.next()
}

#[async_trait]
impl QueryExecutor for InMemoryExecutor {
    type Row = Record;

    async fn execute(
        &self,
        query: &QueryDescriptor,
        policy: Option<&ResultCachePolicy>,
    ) -> CairnResult<Vec<Record>> {
        read_through(self.cache.as_ref(), policy, || async { self.scan(query) }).await
    }

    async fn find(
        &self,
        class: ClassRef<'_>,
        id: &IdValue,
        policy: Option<&ResultCachePolicy>,
    ) -> CairnResult<Option<Record>> {
        let class_key = self.keying.class_key_of(class)?;
        read_through_optional(self.cache.as_ref(), policy, || async {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
            for row in rows.iter() {
                if IdValue::Int(row.id) == *id
                    && self.keying.class_key_of(ClassRef::Instance(row))? == class_key
                {
                    return Ok(Some(row.clone()));
                }
            }
            Ok(None)
        })
        .await
    }
}

/// Backend whose every operation fails as unreachable.
#[derive(Debug, Clone)]
pub struct FailingBackend {
    reason: String,
}

impl FailingBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> CairnResult<T> {
        Err(StorageError::Unavailable {
            backend: "failing".to_string(),
            reason: self.reason.clone(),
        }
        .into())
    }
}

impl Default for FailingBackend {
    fn default() -> Self {
        Self::new("connection refused")
    }
}

#[async_trait]
impl CacheBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn get(&self, _key: &str) -> CairnResult<Option<Vec<u8>>> {
        self.unavailable()
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> CairnResult<()> {
        self.unavailable()
    }

    async fn delete(&self, _key: &str) -> CairnResult<bool> {
        self.unavailable()
    }

    async fn flush_all(&self) -> CairnResult<()> {
        self.unavailable()
    }

    async fn flush_prefix(&self, _prefix: &str) -> CairnResult<u64> {
        self.unavailable()
    }

    async fn stats(&self) -> CairnResult<CacheStats> {
        self.unavailable()
    }
}

/// Install a test log subscriber once; honours `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Cairn types.

    use super::*;
    use proptest::prelude::*;

    /// Dotted type name such as `Shop.Entity.Order`.
    pub fn arb_type_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,8}(\\.[A-Z][a-z]{1,8}){0,2}"
    }

    pub fn arb_id_value() -> impl Strategy<Value = IdValue> {
        prop_oneof![
            any::<i64>().prop_map(IdValue::Int),
            any::<[u8; 16]>().prop_map(|b| IdValue::Uuid(Uuid::from_bytes(b))),
            "[a-z0-9-]{1,12}".prop_map(IdValue::Str),
        ]
    }

    pub fn arb_record() -> impl Strategy<Value = Record> {
        (arb_type_name(), 1i64..10_000, "[a-z]{1,10}")
            .prop_map(|(type_name, id, name)| Record::new(type_name, id, name))
    }

    /// Cache key shaped like a fingerprint.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        "[0-9a-f]{16}"
    }

    /// Tag shaped like a class or instance key.
    pub fn arb_tag() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}(-[a-z]{1,8}){0,2}", proptest::option::of(1u32..1000)).prop_map(
            |(class, id)| match id {
                Some(id) => format!("{}:{}", class, id),
                None => class,
            },
        )
    }

    pub fn arb_query() -> impl Strategy<Value = QueryDescriptor> {
        (
            arb_type_name(),
            proptest::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..4),
            proptest::option::of(0u64..100),
            proptest::option::of(1u64..100),
        )
            .prop_map(|(type_name, params, first, max)| {
                let mut query = QueryDescriptor::new(&format!("SELECT e FROM {} e", type_name));
                for (name, value) in params {
                    query = query.with_parameter(name, value);
                }
                if let Some(first) = first {
                    query = query.with_first_result(first);
                }
                if let Some(max) = max {
                    query = query.with_max_results(max);
                }
                query
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    /// Keying with the `Acme` alias for `Acme.Entity` and a proxy prefix.
    pub fn keying() -> IdentityKeying {
        let resolver = StaticTypeResolver::new()
            .with_alias("Acme", "Acme.Entity")
            .with_proxy_prefix("Proxies.__CG__.");
        IdentityKeying::new(Arc::new(resolver))
    }

    /// Engine over a single in-memory store, plus the store itself.
    pub fn memory_engine() -> (Arc<InvalidationEngine>, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        let engine = InvalidationEngine::with_shared_backend(backend.clone(), keying());
        (Arc::new(engine), backend)
    }

    pub fn user(id: i64, name: &str) -> Record {
        Record::new("Acme.Entity.User", id, name)
    }

    pub fn post(id: i64, name: &str) -> Record {
        Record::new("Acme.Entity.Post", id, name)
    }

    /// Three users and two posts.
    pub fn sample_records() -> Vec<Record> {
        vec![
            user(1, "ada"),
            user(2, "brian"),
            user(3, "cleo"),
            post(1, "hello"),
            post(2, "again"),
        ]
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on cache and registry state.

    use super::*;

    /// Assert that a CairnResult is an unavailable-backend error.
    #[track_caller]
    pub fn assert_unavailable<T: std::fmt::Debug>(result: &CairnResult<T>) {
        match result {
            Err(err) if err.is_unavailable() => {}
            other => panic!("Expected Unavailable storage error, got: {:?}", other),
        }
    }

    /// Assert that a CairnResult is a MissingIdentity keying error.
    #[track_caller]
    pub fn assert_missing_identity<T: std::fmt::Debug>(result: &CairnResult<T>) {
        match result {
            Err(CairnError::Keying(KeyingError::MissingIdentity { .. })) => {}
            other => panic!("Expected MissingIdentity error, got: {:?}", other),
        }
    }

    /// Assert that none of `keys` is cached.
    pub async fn assert_evicted(engine: &InvalidationEngine, keys: &[&str]) {
        for key in keys {
            assert!(
                !engine.has(key).await.expect("backend reachable"),
                "Expected {} to be evicted",
                key
            );
        }
    }

    /// Assert that `tag` lists `key`.
    pub async fn assert_registered(engine: &InvalidationEngine, tag: &str, key: &str) {
        let members = engine.members(tag).await.expect("backend reachable");
        assert!(
            members.iter().any(|m| m == key),
            "Expected {} registered under {}, members: {:?}",
            key,
            tag,
            members
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
