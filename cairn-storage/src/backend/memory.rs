//! In-process cache backend.
//!
//! Expired entries are dropped lazily when touched; there is no sweeper.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CairnResult, StorageError};
use chrono::{DateTime, TimeDelta, Utc};

use super::{CacheBackend, CacheStats};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    hits: u64,
    misses: u64,
}

/// `HashMap`-backed cache.
#[derive(Debug)]
pub struct InMemoryBackend {
    name: String,
    inner: RwLock<Inner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Snapshot of all live keys, sorted. Intended for tests and debugging.
    pub fn keys(&self) -> CairnResult<Vec<String>> {
        let now = Utc::now();
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute expiry for a TTL; overflowing TTLs never expire.
pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>> {
        let now = Utc::now();
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;

        let found = match inner.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        Ok(found)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()> {
        let entry = Entry {
            value: value.to_vec(),
            expires_at: expiry_from(Utc::now(), ttl),
        };
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        inner.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CairnResult<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner
            .entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn contains(&self, key: &str) -> CairnResult<bool> {
        let now = Utc::now();
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner.entries.get(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn flush_all(&self) -> CairnResult<()> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        inner.entries.clear();
        Ok(())
    }

    async fn flush_prefix(&self, prefix: &str) -> CairnResult<u64> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - inner.entries.len()) as u64)
    }

    async fn stats(&self) -> CairnResult<CacheStats> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entry_count: inner.entries.len() as u64,
            memory_bytes: inner
                .entries
                .iter()
                .map(|(k, e)| (k.len() + e.value.len()) as u64)
                .sum(),
        })
    }
}
