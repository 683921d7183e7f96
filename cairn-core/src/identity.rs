//! Canonical cache keys for entity instances and entity types.
//!
//! Two key shapes are derived here, both pure functions of the entity
//! reference:
//!
//! - **class keys** (`"app-entity-user"`): the lower-cased real type name with
//!   every namespace separator collapsed to `-`
//! - **instance keys** (`"app-entity-user:42"`): the class key, a `:` and the
//!   rendered identifier
//!
//! Because namespace separators never survive normalization, the only `:` in
//! an instance key is the one between type and id.
//!
//! Resolving lazy-loading proxies and short type aliases is delegated to a
//! [`TypeResolver`] supplied by whoever owns the object lifecycle; this module
//! never inspects entity internals beyond the [`Entity`] trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{CairnResult, KeyingError};

/// Opaque key of a cached artifact (query fingerprint or entity key).
pub type CacheKey = String;

/// Separator between the class key and the id of an instance key.
pub const ENTITY_KEY_SEPARATOR: char = ':';

/// Replacement for namespace separators inside class keys.
const NAMESPACE_DELIMITER: char = '-';

/// A single primary-key component value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Int(i64),
    Uuid(Uuid),
    Str(String),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(v) => write!(f, "{}", v),
            IdValue::Uuid(v) => write!(f, "{}", v.hyphenated()),
            IdValue::Str(v) => f.write_str(v),
        }
    }
}

impl IdValue {
    fn to_json(&self) -> Value {
        match self {
            IdValue::Int(v) => Value::from(*v),
            IdValue::Uuid(v) => Value::String(v.hyphenated().to_string()),
            IdValue::Str(v) => Value::String(v.clone()),
        }
    }
}

impl From<i64> for IdValue {
    fn from(v: i64) -> Self {
        IdValue::Int(v)
    }
}

impl From<i32> for IdValue {
    fn from(v: i32) -> Self {
        IdValue::Int(i64::from(v))
    }
}

impl From<Uuid> for IdValue {
    fn from(v: Uuid) -> Self {
        IdValue::Uuid(v)
    }
}

impl From<&str> for IdValue {
    fn from(v: &str) -> Self {
        IdValue::Str(v.to_string())
    }
}

impl From<String> for IdValue {
    fn from(v: String) -> Self {
        IdValue::Str(v)
    }
}

/// Ordered primary-key components of an entity.
///
/// Order is the declaration order of the identifier fields and is part of the
/// rendered key, so implementations must report components consistently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    components: Vec<(String, IdValue)>,
}

impl Identifier {
    /// Identifier with a single component.
    pub fn single(field: impl Into<String>, value: impl Into<IdValue>) -> Self {
        Self {
            components: vec![(field.into(), value.into())],
        }
    }

    /// Identifier with several ordered components.
    pub fn composite<I, K, V>(components: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<IdValue>,
    {
        Self {
            components: components
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn components(&self) -> &[(String, IdValue)] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Render the id portion of an instance key.
    ///
    /// A single component renders as its bare value. Several components
    /// render as a JSON object in declaration order, e.g. `{"a":1,"b":"x"}`.
    pub fn render(&self) -> String {
        if let [(_, value)] = self.components.as_slice() {
            return value.to_string();
        }

        let mut out = String::from("{");
        for (i, (field, value)) in self.components.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&Value::String(field.clone()).to_string());
            out.push(':');
            out.push_str(&value.to_json().to_string());
        }
        out.push('}');
        out
    }
}

/// An object whose cached appearances should be tracked.
pub trait Entity: Send + Sync {
    /// Runtime type name. May name a lazy-loading proxy rather than the
    /// real type; [`TypeResolver::real_type_of`] undoes that.
    fn type_name(&self) -> &str;

    /// Primary-key components, or `None` while the entity is not persisted.
    fn identifier(&self) -> Option<Identifier>;
}

/// Capability supplied by the object-lifecycle owner.
pub trait TypeResolver: Send + Sync {
    /// Real (base) type name of an entity, unwrapping lazy proxies.
    fn real_type_of(&self, entity: &dyn Entity) -> String {
        entity.type_name().to_string()
    }

    /// Fully-qualified type name for a short alias such as `App:User`.
    fn resolve_alias(&self, alias: &str) -> Option<String>;
}

/// Either a live entity or a symbolic type reference.
#[derive(Clone, Copy)]
pub enum ClassRef<'a> {
    Instance(&'a dyn Entity),
    Type(&'a str),
}

impl fmt::Debug for ClassRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassRef::Instance(entity) => f.debug_tuple("Instance").field(&entity.type_name()).finish(),
            ClassRef::Type(name) => f.debug_tuple("Type").field(name).finish(),
        }
    }
}

impl<'a> From<&'a str> for ClassRef<'a> {
    fn from(name: &'a str) -> Self {
        ClassRef::Type(name)
    }
}

impl<'a> From<&'a String> for ClassRef<'a> {
    fn from(name: &'a String) -> Self {
        ClassRef::Type(name.as_str())
    }
}

impl<'a> From<&'a dyn Entity> for ClassRef<'a> {
    fn from(entity: &'a dyn Entity) -> Self {
        ClassRef::Instance(entity)
    }
}

/// Derives class and instance keys through a [`TypeResolver`].
#[derive(Clone)]
pub struct IdentityKeying {
    resolver: Arc<dyn TypeResolver>,
}

impl IdentityKeying {
    pub fn new(resolver: Arc<dyn TypeResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &dyn TypeResolver {
        self.resolver.as_ref()
    }

    /// Class key for an entity or a type reference.
    ///
    /// # Errors
    ///
    /// `KeyingError::UnresolvedType` when an alias has no mapping or the type
    /// name is empty.
    pub fn class_key_of(&self, class: ClassRef<'_>) -> CairnResult<CacheKey> {
        let name = match class {
            ClassRef::Instance(entity) => self.resolver.real_type_of(entity),
            ClassRef::Type(name) => name.to_string(),
        };

        let name = if is_alias(&name) {
            self.resolver
                .resolve_alias(&name)
                .ok_or_else(|| KeyingError::UnresolvedType {
                    type_ref: name.clone(),
                })?
        } else {
            name
        };

        let key = normalize_type_name(&name);
        if key.is_empty() {
            return Err(KeyingError::UnresolvedType { type_ref: name }.into());
        }
        Ok(key)
    }

    /// Instance key for a persisted entity.
    ///
    /// # Errors
    ///
    /// `KeyingError::MissingIdentity` when the entity has no identifier yet,
    /// plus anything [`Self::class_key_of`] reports.
    pub fn instance_key_of(&self, entity: &dyn Entity) -> CairnResult<CacheKey> {
        let class_key = self.class_key_of(ClassRef::Instance(entity))?;
        let identifier = entity
            .identifier()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| KeyingError::MissingIdentity {
                entity_type: class_key.clone(),
            })?;

        Ok(entity_key(&class_key, &identifier.render()))
    }

    /// Instance key for a type reference and a bare single-component id.
    pub fn entity_key_for(&self, class: ClassRef<'_>, id: &IdValue) -> CairnResult<CacheKey> {
        let class_key = self.class_key_of(class)?;
        Ok(entity_key(&class_key, &id.to_string()))
    }
}

impl fmt::Debug for IdentityKeying {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeying").finish_non_exhaustive()
    }
}

/// Join a class key and a rendered id.
pub fn entity_key(class_key: &str, id: &str) -> CacheKey {
    format!("{}{}{}", class_key, ENTITY_KEY_SEPARATOR, id)
}

/// Lower-case a type name and collapse namespace separators to `-`.
///
/// `\`, `.` and `::` are all namespace separators; leading separators are
/// dropped so `\App\User` and `App\User` agree.
pub fn normalize_type_name(name: &str) -> String {
    let unified = name.replace("::", ".");
    let mut out = String::with_capacity(unified.len());
    for c in unified.chars() {
        match c {
            '\\' | '.' => out.push(NAMESPACE_DELIMITER),
            other => out.extend(other.to_lowercase()),
        }
    }
    out.trim_start_matches(NAMESPACE_DELIMITER).to_string()
}

/// Whether a type reference uses `Alias:Name` notation.
///
/// A lone `:` marks an alias; `::` is a namespace separator.
pub fn is_alias(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.iter().enumerate().any(|(i, &b)| {
        b == b':'
            && (i == 0 || bytes[i - 1] != b':')
            && bytes.get(i + 1).map_or(true, |&next| next != b':')
    })
}

/// Table-driven [`TypeResolver`].
///
/// Namespace aliases map the part before the `:` of `Alias:Name` to a
/// namespace; proxy prefixes are stripped from runtime type names.
#[derive(Debug, Clone, Default)]
pub struct StaticTypeResolver {
    namespace_aliases: HashMap<String, String>,
    proxy_prefixes: Vec<String>,
}

impl StaticTypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `alias` in `alias:Name` to `namespace`.
    pub fn with_alias(mut self, alias: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.namespace_aliases.insert(alias.into(), namespace.into());
        self
    }

    /// Strip `prefix` from runtime type names that carry it.
    pub fn with_proxy_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.proxy_prefixes.push(prefix.into());
        self
    }
}

impl TypeResolver for StaticTypeResolver {
    fn real_type_of(&self, entity: &dyn Entity) -> String {
        let name = entity.type_name();
        self.proxy_prefixes
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix.as_str()))
            .unwrap_or(name)
            .to_string()
    }

    fn resolve_alias(&self, alias: &str) -> Option<String> {
        let (namespace_alias, short_name) = alias.rsplit_once(':')?;
        if short_name.is_empty() {
            return None;
        }
        let namespace = self.namespace_aliases.get(namespace_alias)?;
        Some(format!("{}.{}", namespace, short_name))
    }
}
