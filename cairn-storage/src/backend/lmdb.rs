//! LMDB-backed cache implementation.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a persistent,
//! memory-mapped key-value store that survives process restarts.
//!
//! # Value Layout
//!
//! ```text
//! [expires_at: i64 LE unix millis, 0 = never][payload bytes]
//! ```
//!
//! Expired entries read as absent and are physically removed the next time
//! they are deleted, overwritten or flushed.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get` and `contains`
//! - Write transactions for `set`, `delete` and the flush operations
//! - Hit/miss counters are atomics

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CairnError, CairnResult, StorageError};
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::memory::expiry_from;
use super::{CacheBackend, CacheStats};

const HEADER_LEN: usize = 8;

/// Error type for LMDB backend operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbBackendError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbBackendError> for CairnError {
    fn from(e: LmdbBackendError) -> Self {
        CairnError::Storage(StorageError::Unavailable {
            backend: "lmdb".to_string(),
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> LmdbBackendError {
    LmdbBackendError::Transaction(e.to_string())
}

/// LMDB-backed cache.
///
/// # Example
///
/// ```ignore
/// use cairn_storage::backend::{CacheBackend, LmdbBackend};
///
/// let backend = LmdbBackend::open("/var/cache/app", 64)?;
/// backend.set("greeting", b"hello", None).await?;
/// assert!(backend.contains("greeting").await?);
/// ```
pub struct LmdbBackend {
    env: Env,
    db: Database<Bytes, Bytes>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LmdbBackend {
    /// Open (or create) an LMDB cache under `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbBackendError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per directory by this
        // process; heed requires the caller to uphold that.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbBackendError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbBackendError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn encode(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
        let expires_at = expiry_from(Utc::now(), ttl)
            .map(|at| at.timestamp_millis())
            .unwrap_or(0);

        let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
        bytes.extend_from_slice(&expires_at.to_le_bytes());
        bytes.extend_from_slice(value);
        bytes
    }

    /// Payload of a stored value, or `None` if it is expired or malformed.
    fn decode_live(bytes: &[u8], now_millis: i64) -> Option<&[u8]> {
        let header: [u8; HEADER_LEN] = bytes.get(..HEADER_LEN)?.try_into().ok()?;
        let expires_at = i64::from_le_bytes(header);
        if expires_at != 0 && now_millis >= expires_at {
            return None;
        }
        Some(&bytes[HEADER_LEN..])
    }

    fn read_live(&self, key: &str) -> Result<Option<Vec<u8>>, LmdbBackendError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let now = Utc::now().timestamp_millis();
        Ok(self
            .db
            .get(&rtxn, key.as_bytes())
            .map_err(txn_err)?
            .and_then(|bytes| Self::decode_live(bytes, now))
            .map(<[u8]>::to_vec))
    }

    /// Keys starting with `prefix`.
    fn collect_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbBackendError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let iter = self.db.prefix_iter(&rtxn, prefix).map_err(txn_err)?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, _) = result.map_err(txn_err)?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

#[async_trait]
impl CacheBackend for LmdbBackend {
    fn name(&self) -> &str {
        "lmdb"
    }

    async fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>> {
        let found = self.read_live(key)?;
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()> {
        let bytes = Self::encode(value, ttl);

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, key.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CairnResult<bool> {
        let was_live = self.read_live(key)?.is_some();

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(was_live)
    }

    async fn contains(&self, key: &str) -> CairnResult<bool> {
        Ok(self.read_live(key)?.is_some())
    }

    async fn flush_all(&self) -> CairnResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db.clear(&mut wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn flush_prefix(&self, prefix: &str) -> CairnResult<u64> {
        let keys_to_delete = self.collect_keys_with_prefix(prefix.as_bytes())?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0u64;
        for key in &keys_to_delete {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        Ok(deleted)
    }

    async fn stats(&self) -> CairnResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let entry_count = self.db.len(&rtxn).map_err(txn_err)?;

        let mut memory_bytes = 0u64;
        for result in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, value) = result.map_err(txn_err)?;
            memory_bytes += (key.len() + value.len().saturating_sub(HEADER_LEN)) as u64;
        }

        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            memory_bytes,
        })
    }
}
