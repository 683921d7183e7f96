//! Building engines and stores from a [`CairnConfig`].
//!
//! Local client kinds (`memory`, `lmdb`) are constructed here. Remote kinds
//! have no bundled client: the embedding application passes its own
//! [`CacheBackend`] for them under the client's name, built from the
//! [`RemoteClient`] settings [`BackendSet::remote_clients`] lists. A
//! configured prefix wraps the client in a [`NamespacedBackend`].

use std::collections::BTreeMap;
use std::sync::Arc;

use cairn_core::{
    CairnConfig, CairnResult, ClientConfig, ClientKind, ConfigError, ConnectionConfig, Dsn,
    IdentityKeying,
};

use crate::backend::{CacheBackend, InMemoryBackend, LmdbBackend, NamespacedBackend};
use crate::engine::InvalidationEngine;
use crate::facade::{QueryExecutor, ResultCacheConfig, ResultCacheFacade};
use crate::lifecycle::LifecycleBridge;
use crate::session::{CachedSessionStore, SessionOptions};

/// Settings for a remote client the embedder has to construct.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteClient {
    pub name: String,
    pub kind: ClientKind,
    pub dsn: Dsn,
    pub connection: ConnectionConfig,
}

/// One backend per configured client.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: BTreeMap<String, Arc<dyn CacheBackend>>,
}

impl BackendSet {
    /// Build every client in `config`.
    ///
    /// `external` supplies backends by client name and takes precedence
    /// over local construction.
    pub fn from_config(
        config: &CairnConfig,
        mut external: BTreeMap<String, Arc<dyn CacheBackend>>,
    ) -> CairnResult<Self> {
        let mut backends = BTreeMap::new();
        for (name, client) in &config.clients {
            let backend = match external.remove(name) {
                Some(backend) => backend,
                None => build_local(name, client)?,
            };
            let backend: Arc<dyn CacheBackend> = match &client.prefix {
                Some(prefix) => Arc::new(NamespacedBackend::new(backend, prefix)?),
                None => backend,
            };
            tracing::info!(
                client = %name,
                kind = client.kind.as_str(),
                prefix = client.prefix.as_deref().unwrap_or(""),
                "Configured cache client"
            );
            backends.insert(name.clone(), backend);
        }

        for name in external.keys() {
            tracing::warn!(client = %name, "Ignoring backend for unconfigured client");
        }

        Ok(Self { backends })
    }

    /// Remote clients in `config`, with parsed DSN and connection options,
    /// for building the `external` backends passed to [`Self::from_config`].
    pub fn remote_clients(config: &CairnConfig) -> Result<Vec<RemoteClient>, ConfigError> {
        let mut remote = Vec::new();
        for (name, client) in &config.clients {
            if let Some(dsn) = client.parsed_dsn()? {
                remote.push(RemoteClient {
                    name: name.clone(),
                    kind: client.kind,
                    dsn,
                    connection: client.connection.clone(),
                });
            }
        }
        Ok(remote)
    }

    pub fn get(&self, client: &str) -> Result<Arc<dyn CacheBackend>, ConfigError> {
        self.backends
            .get(client)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownClient {
                client: client.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Invalidation engine for the `[entity_cache]` section.
    pub fn entity_engine(&self, config: &CairnConfig) -> CairnResult<InvalidationEngine> {
        let entity_cache = config
            .entity_cache
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "entity_cache".to_string(),
            })?;

        let results = self.get(&entity_cache.client)?;
        let registry = self.get(entity_cache.registry_client())?;
        let keying = IdentityKeying::new(Arc::new(entity_cache.type_resolver()));

        tracing::info!(
            client = %entity_cache.client,
            registry_client = entity_cache.registry_client(),
            aliases = entity_cache.aliases.len(),
            "Built entity cache engine"
        );
        Ok(InvalidationEngine::new(results, registry, keying))
    }

    /// Facade and lifecycle bridge sharing one engine.
    pub fn entity_cache<X: QueryExecutor>(
        &self,
        config: &CairnConfig,
        executor: Arc<X>,
    ) -> CairnResult<(ResultCacheFacade<X>, LifecycleBridge)> {
        let engine = Arc::new(self.entity_engine(config)?);
        let facade_config = config
            .entity_cache
            .as_ref()
            .map(ResultCacheConfig::from)
            .unwrap_or_default();
        Ok((
            ResultCacheFacade::new(engine.clone(), executor, facade_config),
            LifecycleBridge::new(engine),
        ))
    }

    /// Session store for the `[session]` section.
    pub fn session_store(&self, config: &CairnConfig) -> CairnResult<CachedSessionStore> {
        let session = config
            .session
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "session".to_string(),
            })?;
        let backend = self.get(&session.client)?;
        tracing::info!(client = %session.client, prefix = %session.prefix, "Built session store");
        Ok(CachedSessionStore::new(backend, SessionOptions::from(session)))
    }
}

impl std::fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.backends.keys()).finish()
    }
}

fn build_local(name: &str, client: &ClientConfig) -> CairnResult<Arc<dyn CacheBackend>> {
    match client.kind {
        ClientKind::Memory => Ok(Arc::new(InMemoryBackend::named(name))),
        ClientKind::Lmdb => {
            let directory = client
                .directory
                .as_ref()
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: format!("clients.{}.directory", name),
                })?;
            Ok(Arc::new(LmdbBackend::open(directory, client.max_size_mb)?))
        }
        ClientKind::Redis | ClientKind::Memcached => Err(ConfigError::ProviderNotSupported {
            provider: client.kind.as_str().to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::CairnError;

    const CONFIG: &str = r#"
[clients.results]
type = "memory"
prefix = "app"

[clients.sessions]
type = "memory"

[entity_cache]
client = "results"
default_ttl = 60

[entity_cache.aliases]
Shop = "Shop.Entity"

[session]
client = "sessions"
prefix = "web_"
"#;

    #[tokio::test]
    async fn test_builds_memory_clients() {
        let config = CairnConfig::from_toml_str(CONFIG).unwrap();
        let set = BackendSet::from_config(&config, BTreeMap::new()).unwrap();

        assert_eq!(set.names().collect::<Vec<_>>(), vec!["results", "sessions"]);

        let engine = set.entity_engine(&config).unwrap();
        assert_eq!(
            engine.keying().class_key_of("Shop:Order".into()).unwrap(),
            "shop-entity-order"
        );

        let store = set.session_store(&config).unwrap();
        store.write("abc", "x").await.unwrap();
        assert!(set.get("sessions").unwrap().contains("web_abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_namespaces_client() {
        let config = CairnConfig::from_toml_str(CONFIG).unwrap();
        let shared = Arc::new(InMemoryBackend::new());
        let mut external: BTreeMap<String, Arc<dyn CacheBackend>> = BTreeMap::new();
        external.insert("results".to_string(), shared.clone());

        let set = BackendSet::from_config(&config, external).unwrap();
        set.entity_engine(&config)
            .unwrap()
            .register("shop-entity-order", "q1")
            .await
            .unwrap();

        assert!(shared.contains("app:registered:shop-entity-order").await.unwrap());
    }

    #[test]
    fn test_remote_client_without_backend_is_unsupported() {
        let config = CairnConfig::from_toml_str(
            r#"
[clients.default]
type = "redis"
dsn = "redis://localhost"
"#,
        )
        .unwrap();

        let err = BackendSet::from_config(&config, BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            CairnError::Config(ConfigError::ProviderNotSupported { ref provider }) if provider == "redis"
        ));
    }

    #[test]
    fn test_remote_client_with_injected_backend() {
        let config = CairnConfig::from_toml_str(
            r#"
[clients.default]
type = "memcached"
dsn = "memcached://localhost"
"#,
        )
        .unwrap();
        let mut external: BTreeMap<String, Arc<dyn CacheBackend>> = BTreeMap::new();
        external.insert("default".to_string(), Arc::new(InMemoryBackend::new()));

        let set = BackendSet::from_config(&config, external).unwrap();
        assert!(set.get("default").is_ok());
    }

    #[test]
    fn test_remote_clients_carry_connection_settings() {
        let config = CairnConfig::from_toml_str(
            r#"
[clients.local]
type = "memory"

[clients.remote]
type = "redis"
dsn = "redis://secret@cache.internal:6380/2"

[clients.remote.connection]
persistent = true
timeout = 2
"#,
        )
        .unwrap();

        let remote = BackendSet::remote_clients(&config).unwrap();

        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "remote");
        assert_eq!(remote[0].kind, ClientKind::Redis);
        assert_eq!(remote[0].dsn.database, Some(2));
        assert!(remote[0].connection.persistent);
        assert_eq!(remote[0].connection.connect_timeout(), std::time::Duration::from_secs(2));
    }

    #[test]
    fn test_lmdb_client() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = format!(
            "[clients.disk]\ntype = \"lmdb\"\ndirectory = {:?}\nmax_size_mb = 16\n",
            dir.path().join("cache").display().to_string()
        );
        let config = CairnConfig::from_toml_str(&source).unwrap();

        let set = BackendSet::from_config(&config, BTreeMap::new()).unwrap();
        assert!(set.get("disk").is_ok());
    }

    #[test]
    fn test_missing_sections() {
        let config = CairnConfig::from_toml_str("[clients.default]\ntype = \"memory\"\n").unwrap();
        let set = BackendSet::from_config(&config, BTreeMap::new()).unwrap();

        assert!(set.entity_engine(&config).is_err());
        assert!(set.session_store(&config).is_err());
        assert!(matches!(set.get("other"), Err(ConfigError::UnknownClient { .. })));
    }
}
