//! Cairn Core - Keys, Errors and Configuration
//!
//! Pure types shared by every Cairn crate. Nothing here touches a cache
//! backend; I/O lives in `cairn-storage`.

pub mod config;
pub mod dsn;
pub mod error;
pub mod identity;

pub use config::{
    CairnConfig, ClientConfig, ClientKind, ConnectionConfig, EntityCacheConfig, SessionConfig,
};
pub use dsn::{Dsn, DsnEndpoint, DsnScheme};
pub use error::{CairnError, CairnResult, ConfigError, KeyingError, StorageError};
pub use identity::{
    entity_key, is_alias, normalize_type_name, CacheKey, ClassRef, Entity, IdValue, Identifier,
    IdentityKeying, StaticTypeResolver, TypeResolver, ENTITY_KEY_SEPARATOR,
};
