//! HTTP session storage on top of a cache backend.
//!
//! Session payloads are opaque strings stored at `<prefix><session id>`
//! with a fixed lifetime. Expiry is left to the backend, so `gc` has
//! nothing to do.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::config::{default_expire_time, default_session_prefix};
use cairn_core::{CairnResult, ConfigError, SessionConfig, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::CacheBackend;

const SUPPORTED_OPTIONS: [&str; 2] = ["prefix", "expire_time"];

/// Session store options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionOptions {
    /// Key prefix, keeps sessions apart from other data in a shared store
    #[serde(default = "default_session_prefix")]
    pub prefix: String,
    /// Session lifetime in seconds
    #[serde(default = "default_expire_time")]
    pub expire_time: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            prefix: default_session_prefix(),
            expire_time: default_expire_time(),
        }
    }
}

impl SessionOptions {
    /// Build options from loosely typed key/value pairs.
    ///
    /// Every unsupported key is reported at once.
    pub fn from_map(options: &BTreeMap<String, Value>) -> Result<Self, ConfigError> {
        let unsupported: Vec<&str> = options
            .keys()
            .map(String::as_str)
            .filter(|key| !SUPPORTED_OPTIONS.contains(key))
            .collect();
        if !unsupported.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "session".to_string(),
                value: unsupported.join(", "),
                reason: "unsupported options".to_string(),
            });
        }

        let object = options.clone().into_iter().collect();
        serde_json::from_value(Value::Object(object)).map_err(|e| ConfigError::InvalidValue {
            field: "session".to_string(),
            value: Value::Object(options.clone().into_iter().collect()).to_string(),
            reason: e.to_string(),
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.expire_time)
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            prefix: config.prefix.clone(),
            expire_time: config.expire_time,
        }
    }
}

/// Session handler backed by a [`CacheBackend`].
#[derive(Clone)]
pub struct CachedSessionStore {
    backend: Arc<dyn CacheBackend>,
    options: SessionOptions,
}

impl CachedSessionStore {
    pub fn new(backend: Arc<dyn CacheBackend>, options: SessionOptions) -> Self {
        Self { backend, options }
    }

    /// Store configured from an option map; unknown options are rejected.
    pub fn with_options(
        backend: Arc<dyn CacheBackend>,
        options: &BTreeMap<String, Value>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(backend, SessionOptions::from_map(options)?))
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.options.prefix, session_id)
    }

    pub fn open(&self, _save_path: &str, _session_name: &str) -> bool {
        true
    }

    pub fn close(&self) -> bool {
        true
    }

    /// Session payload, or an empty string for an unknown session.
    pub async fn read(&self, session_id: &str) -> CairnResult<String> {
        match self.backend.get(&self.key(session_id)).await? {
            Some(bytes) => String::from_utf8(bytes).map_err(|e| {
                StorageError::Serialization {
                    reason: format!("session {}: {}", session_id, e),
                }
                .into()
            }),
            None => Ok(String::new()),
        }
    }

    pub async fn write(&self, session_id: &str, data: &str) -> CairnResult<()> {
        self.backend
            .set(&self.key(session_id), data.as_bytes(), Some(self.options.ttl()))
            .await
    }

    /// Returns whether a live session was removed.
    pub async fn destroy(&self, session_id: &str) -> CairnResult<bool> {
        self.backend.delete(&self.key(session_id)).await
    }

    pub fn gc(&self, _max_lifetime: Duration) -> bool {
        true
    }
}

impl std::fmt::Debug for CachedSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSessionStore")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .finish()
    }
}
