//! Key-prefixing backend wrapper.
//!
//! A `NamespacedBackend` can only address keys under its own
//! `<namespace>:` prefix, so two engines sharing one store cannot read,
//! delete or flush each other's entries. Namespaces may not contain the
//! separator, otherwise `app` would be a prefix of `app:sess`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CairnResult, ConfigError};

use super::{CacheBackend, CacheStats};

const NAMESPACE_SEPARATOR: char = ':';

/// Wraps a backend and scopes every key to a namespace.
#[derive(Clone)]
pub struct NamespacedBackend {
    inner: Arc<dyn CacheBackend>,
    prefix: String,
}

impl NamespacedBackend {
    /// Scope `inner` to `namespace`, which must be non-empty and free of
    /// the `:` separator.
    pub fn new(inner: Arc<dyn CacheBackend>, namespace: &str) -> Result<Self, ConfigError> {
        validate_namespace(namespace).map_err(|reason| ConfigError::InvalidValue {
            field: "prefix".to_string(),
            value: namespace.to_string(),
            reason: reason.to_string(),
        })?;
        Ok(Self {
            inner,
            prefix: format!("{}{}", namespace, NAMESPACE_SEPARATOR),
        })
    }

    /// The full key prefix, separator included.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn validate_namespace(namespace: &str) -> Result<(), &'static str> {
    if namespace.is_empty() {
        return Err("must not be empty");
    }
    if namespace.contains(NAMESPACE_SEPARATOR) {
        return Err("must not contain ':'");
    }
    Ok(())
}

impl std::fmt::Debug for NamespacedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedBackend")
            .field("inner", &self.inner.name())
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl CacheBackend for NamespacedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>> {
        self.inner.get(&self.scoped(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()> {
        self.inner.set(&self.scoped(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> CairnResult<bool> {
        self.inner.delete(&self.scoped(key)).await
    }

    async fn contains(&self, key: &str) -> CairnResult<bool> {
        self.inner.contains(&self.scoped(key)).await
    }

    /// Flushes this namespace only.
    async fn flush_all(&self) -> CairnResult<()> {
        self.inner.flush_prefix(&self.prefix).await.map(|_| ())
    }

    async fn flush_prefix(&self, prefix: &str) -> CairnResult<u64> {
        self.inner.flush_prefix(&self.scoped(prefix)).await
    }

    /// Statistics of the shared store, not of this namespace alone.
    async fn stats(&self) -> CairnResult<CacheStats> {
        self.inner.stats().await
    }
}
