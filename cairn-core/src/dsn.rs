//! Connection strings for remote cache backends.
//!
//! Accepted shape, after the `redis://` or `memcached://` scheme:
//!
//! ```text
//! [password@](host[:port] | /path/to/socket)[/database][?weight=N&alias=name]
//! ```
//!
//! The password runs up to the last `@`; a literal `@` inside it is written
//! `\@`. The database suffix and the `alias` parameter only apply to redis.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Backend protocol named by a DSN scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DsnScheme {
    Redis,
    Memcached,
}

impl DsnScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            DsnScheme::Redis => "redis",
            DsnScheme::Memcached => "memcached",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            DsnScheme::Redis => 6379,
            DsnScheme::Memcached => 11211,
        }
    }
}

/// Where the backend listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsnEndpoint {
    Tcp { host: String, port: u16 },
    Socket(String),
}

/// A parsed backend connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dsn {
    pub scheme: DsnScheme,
    pub endpoint: DsnEndpoint,
    pub password: Option<String>,
    pub database: Option<u32>,
    pub weight: Option<u32>,
    pub alias: Option<String>,
}

impl Dsn {
    /// Parse a DSN, expecting the given scheme.
    pub fn parse_as(scheme: DsnScheme, dsn: &str) -> Result<Self, ConfigError> {
        let prefix = format!("{}://", scheme.as_str());
        let rest = dsn.strip_prefix(prefix.as_str()).ok_or_else(|| ConfigError::InvalidDsn {
            dsn: dsn.to_string(),
            reason: format!("dsn should start with \"{}\"", prefix),
        })?;
        parse_body(scheme, dsn, rest)
    }

    /// Parse a DSN, taking the scheme from the string itself.
    pub fn parse(dsn: &str) -> Result<Self, ConfigError> {
        let scheme = match dsn.split_once("://").map(|(scheme, _)| scheme) {
            Some("redis") => DsnScheme::Redis,
            Some("memcached") => DsnScheme::Memcached,
            _ => {
                return Err(ConfigError::InvalidDsn {
                    dsn: dsn.to_string(),
                    reason: "unknown scheme, expected redis:// or memcached://".to_string(),
                })
            }
        };
        Self::parse_as(scheme, dsn)
    }

    pub fn host(&self) -> Option<&str> {
        match &self.endpoint {
            DsnEndpoint::Tcp { host, .. } => Some(host),
            DsnEndpoint::Socket(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match &self.endpoint {
            DsnEndpoint::Tcp { port, .. } => Some(*port),
            DsnEndpoint::Socket(_) => None,
        }
    }

    pub fn socket(&self) -> Option<&str> {
        match &self.endpoint {
            DsnEndpoint::Socket(path) => Some(path),
            DsnEndpoint::Tcp { .. } => None,
        }
    }
}

fn parse_body(scheme: DsnScheme, dsn: &str, rest: &str) -> Result<Dsn, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDsn {
        dsn: dsn.to_string(),
        reason: reason.to_string(),
    };

    let (password, rest) = match rest.rfind('@') {
        Some(pos) => (Some(rest[..pos].replace("\\@", "@")), &rest[pos + 1..]),
        None => (None, rest),
    };

    let (rest, query) = match rest.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (rest, None),
    };

    let mut weight = None;
    let mut alias = None;
    for pair in query.into_iter().flat_map(|q| q.split('&')) {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        match name {
            "weight" => {
                weight = Some(value.parse::<u32>().map_err(|_| invalid("weight must be numeric"))?);
            }
            "alias" if scheme == DsnScheme::Redis => alias = Some(value.to_string()),
            _ => {}
        }
    }

    let mut location = rest;
    let mut database = None;
    if scheme == DsnScheme::Redis {
        if let Some((head, tail)) = location.rsplit_once('/') {
            if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) && !head.is_empty() {
                database = Some(tail.parse::<u32>().map_err(|_| invalid("database out of range"))?);
                location = head;
            }
        }
    }

    if location.is_empty() {
        return Err(invalid("missing host or socket"));
    }

    let endpoint = if location.starts_with('/') {
        DsnEndpoint::Socket(location.to_string())
    } else {
        let (host, port) = match location.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("port must be numeric"))?;
                (host, port)
            }
            None => (location, scheme.default_port()),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        DsnEndpoint::Tcp {
            host: host.to_string(),
            port,
        }
    };

    Ok(Dsn {
        scheme,
        endpoint,
        password,
        database,
        weight,
        alias,
    })
}
