//! Configuration types
//!
//! Parsed from TOML. Structural checks happen in [`CairnConfig::validate`],
//! which [`CairnConfig::from_toml_str`] always runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dsn::{Dsn, DsnScheme};
use crate::identity::StaticTypeResolver;
use crate::ConfigError;

/// Kind of store behind a cache client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Memory,
    Lmdb,
    Redis,
    Memcached,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Memory => "memory",
            ClientKind::Lmdb => "lmdb",
            ClientKind::Redis => "redis",
            ClientKind::Memcached => "memcached",
        }
    }

    fn dsn_scheme(&self) -> Option<DsnScheme> {
        match self {
            ClientKind::Redis => Some(DsnScheme::Redis),
            ClientKind::Memcached => Some(DsnScheme::Memcached),
            ClientKind::Memory | ClientKind::Lmdb => None,
        }
    }
}

/// Connection options for remote clients.
///
/// Remote clients are built by the embedding application; these settings
/// reach it through `BackendSet::remote_clients` in `cairn-storage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub persistent: bool,
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    5
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            persistent: false,
            timeout: default_timeout(),
        }
    }
}

/// One named cache client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(rename = "type")]
    pub kind: ClientKind,
    #[serde(default)]
    pub dsn: Option<String>,
    /// Storage directory, lmdb only
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Map size in megabytes, lmdb only
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: usize,
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Namespace prepended to every key
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_max_size_mb() -> usize {
    64
}

impl ClientConfig {
    /// Parsed DSN for remote kinds; `None` for local ones.
    pub fn parsed_dsn(&self) -> Result<Option<Dsn>, ConfigError> {
        let Some(scheme) = self.kind.dsn_scheme() else {
            return Ok(None);
        };
        let raw = self.dsn.as_deref().ok_or_else(|| ConfigError::MissingRequired {
            field: "dsn".to_string(),
        })?;
        Dsn::parse_as(scheme, raw).map(Some)
    }
}

/// Entity cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityCacheConfig {
    /// Client holding cached results
    pub client: String,
    /// Client holding the tag registry; defaults to `client`
    #[serde(default)]
    pub registry_client: Option<String>,
    /// Default TTL in seconds for populated results
    #[serde(default)]
    pub default_ttl: Option<u64>,
    /// Namespace aliases for `Alias:Name` type references
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Prefixes marking lazy-loading proxy type names
    #[serde(default)]
    pub proxy_prefixes: Vec<String>,
}

impl EntityCacheConfig {
    pub fn registry_client(&self) -> &str {
        self.registry_client.as_deref().unwrap_or(&self.client)
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl.map(Duration::from_secs)
    }

    /// Type resolver built from the alias and proxy tables.
    pub fn type_resolver(&self) -> StaticTypeResolver {
        let resolver = self
            .aliases
            .iter()
            .fold(StaticTypeResolver::new(), |r, (alias, namespace)| {
                r.with_alias(alias.clone(), namespace.clone())
            });
        self.proxy_prefixes
            .iter()
            .fold(resolver, |r, prefix| r.with_proxy_prefix(prefix.clone()))
    }
}

/// Session store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub client: String,
    #[serde(default = "default_session_prefix")]
    pub prefix: String,
    /// Session lifetime in seconds
    #[serde(default = "default_expire_time")]
    pub expire_time: u64,
}

pub fn default_session_prefix() -> String {
    "sess_".to_string()
}

pub fn default_expire_time() -> u64 {
    86_400
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CairnConfig {
    pub clients: BTreeMap<String, ClientConfig>,
    #[serde(default)]
    pub entity_cache: Option<EntityCacheConfig>,
    #[serde(default)]
    pub session: Option<SessionConfig>,
}

impl CairnConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: CairnConfig = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn client(&self, name: &str) -> Result<&ClientConfig, ConfigError> {
        self.clients.get(name).ok_or_else(|| ConfigError::UnknownClient {
            client: name.to_string(),
        })
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "clients".to_string(),
            });
        }

        for (name, client) in &self.clients {
            client.parsed_dsn().map_err(|e| match e {
                ConfigError::MissingRequired { field } => ConfigError::MissingRequired {
                    field: format!("clients.{}.{}", name, field),
                },
                other => other,
            })?;

            if client.kind == ClientKind::Lmdb && client.directory.is_none() {
                return Err(ConfigError::MissingRequired {
                    field: format!("clients.{}.directory", name),
                });
            }

            if client.max_size_mb == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("clients.{}.max_size_mb", name),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }

            if let Some(prefix) = &client.prefix {
                if prefix.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: format!("clients.{}.prefix", name),
                        value: String::new(),
                        reason: "must not be empty when set".to_string(),
                    });
                }
                if prefix.contains(':') {
                    return Err(ConfigError::InvalidValue {
                        field: format!("clients.{}.prefix", name),
                        value: prefix.clone(),
                        reason: "must not contain ':'".to_string(),
                    });
                }
            }
        }

        if let Some(entity_cache) = &self.entity_cache {
            self.client(&entity_cache.client)?;
            self.client(entity_cache.registry_client())?;
        }

        if let Some(session) = &self.session {
            self.client(&session.client)?;
        }

        Ok(())
    }
}
