//! Cairn Storage - Tagged Result Cache and Invalidation
//!
//! Query results are cached under a key and registered under *tags*: the
//! class key of the result type and the instance key of every row. When an
//! entity changes, invalidating its tags deletes every result that could
//! contain stale data.
//!
//! Layers, bottom up:
//!
//! - [`backend`]: the key/value store contract and bundled stores
//! - [`registry`]: per-tag member lists kept in a backend
//! - [`engine`]: register and cascade-invalidate by tag
//! - [`facade`]: cached query execution that registers what it writes
//! - [`lifecycle`]: entity create/update/delete hooks
//! - [`session`]: session handler over the same backends
//! - [`wiring`]: assemble all of the above from configuration

pub mod backend;
pub mod engine;
pub mod facade;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod wiring;

pub use backend::{
    CacheBackend, CacheStats, InMemoryBackend, LmdbBackend, LmdbBackendError, NamespacedBackend,
};
pub use engine::{InvalidationEngine, InvalidationReport};
pub use facade::{
    fingerprint_of, read_through, read_through_optional, CacheTtl, HydrationMode, Lookup,
    QueryDescriptor, QueryExecutor, ResultCacheConfig, ResultCacheFacade, ResultCachePolicy,
};
pub use lifecycle::{LifecycleBridge, LifecycleEvent, LifecycleListener};
pub use registry::{registry_key, ListRegistry, REGISTRY_PREFIX};
pub use session::{CachedSessionStore, SessionOptions};
pub use wiring::{BackendSet, RemoteClient};
