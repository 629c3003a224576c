//! Revivable values: typed instances that survive a plain JSON round trip.
//!
//! A type opts in by implementing [`Revivable`] and being registered with a
//! [`RevivalRegistry`], either directly or by naming a declared abstract base
//! in [`Revivable::BASES`]. Wrapping a value in [`Instance`] writes the
//! revival tag (`"__revive__": "<TypeName>"`) onto its serialized object; the
//! receiving registry validates tagged objects against the registered type,
//! reruns [`Revivable::on_revive`], and strips the tag.
//!
//! Both passes are idempotent: `tag(tag(x)) == tag(x)` and
//! `revive(revive(x)) == revive(x)`.

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::RwLock;
use tracing::debug;

/// A type whose instances keep their identity across the wire.
///
/// Implementors must serialize to a JSON object.
pub trait Revivable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name written into the revival tag. Must match on both peers.
    const TYPE_NAME: &'static str;

    /// Abstract bases this type inherits revivability from.
    const BASES: &'static [&'static str] = &[];

    /// Re-establish derived state after reconstruction from wire data.
    ///
    /// Runs every time a value is rebuilt, so it must be idempotent.
    fn on_revive(&mut self) {}
}

/// A revivable value that carries its revival tag through serde.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instance<T>(pub T);

impl<T> Instance<T> {
    pub fn new(value: T) -> Self {
        Instance(value)
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Instance<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Instance<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: Revivable> Serialize for Instance<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match serde_json::to_value(&self.0).map_err(S::Error::custom)? {
            Value::Object(mut map) => {
                map.insert(
                    RpcConfig::REVIVAL_TAG_FIELD.to_string(),
                    Value::String(T::TYPE_NAME.to_string()),
                );
                map.serialize(serializer)
            }
            _ => Err(S::Error::custom(format!(
                "revivable type {} must serialize to a JSON object",
                T::TYPE_NAME
            ))),
        }
    }
}

impl<'de, T: Revivable> Deserialize<'de> for Instance<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut value = Value::deserialize(deserializer)?;
        if let Value::Object(map) = &mut value {
            map.remove(RpcConfig::REVIVAL_TAG_FIELD);
        }
        let mut inner: T = serde_json::from_value(value).map_err(D::Error::custom)?;
        inner.on_revive();
        Ok(Instance(inner))
    }
}

type Rebuild = fn(Map<String, Value>) -> Result<Value>;

#[derive(Clone, Copy)]
struct Entry {
    bases: &'static [&'static str],
    rebuild: Rebuild,
}

fn rebuild<T: Revivable>(map: Map<String, Value>) -> Result<Value> {
    let mut value: T = serde_json::from_value(Value::Object(map)).map_err(|e| RpcError::Revival {
        type_name: T::TYPE_NAME.to_string(),
        message: e.to_string(),
    })?;
    value.on_revive();
    serde_json::to_value(&value).map_err(|e| RpcError::Revival {
        type_name: T::TYPE_NAME.to_string(),
        message: e.to_string(),
    })
}

/// Mapping from type name to reconstruction routine.
///
/// Append-only: entries are never removed. Shared between the serializing
/// and deserializing sides of a peer, usually behind an `Arc`.
#[derive(Default)]
pub struct RevivalRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    bases: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for RevivalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.read_entries().keys().cloned().collect();
        names.sort();
        f.debug_struct("RevivalRegistry").field("types", &names).finish()
    }
}

impl RevivalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare `T` revivable.
    pub fn register<T: Revivable>(&self) -> &Self {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.entry(T::TYPE_NAME.to_string()).or_insert_with(|| {
            debug!("Registered revivable type {}", T::TYPE_NAME);
            Entry {
                bases: T::BASES,
                rebuild: rebuild::<T>,
            }
        });
        self
    }

    /// Declare an abstract base; types listing it in `BASES` become
    /// revivable the first time one of their instances is encoded.
    pub fn declare_base(&self, name: impl Into<String>) -> &Self {
        self.bases
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into());
        self
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.read_entries().contains_key(type_name)
    }

    /// Whether instances of `T` are tagged, registering `T` on first
    /// encounter when it inherits from a declared base.
    pub fn accepts<T: Revivable>(&self) -> bool {
        if self.is_registered(T::TYPE_NAME) {
            return true;
        }
        let inherits = {
            let bases = self.bases.read().unwrap_or_else(|e| e.into_inner());
            T::BASES.iter().any(|base| bases.contains(*base))
        };
        if inherits {
            self.register::<T>();
        }
        inherits
    }

    /// Wrap a value for the wire.
    pub fn instance<T: Revivable>(&self, value: T) -> Instance<T> {
        self.accepts::<T>();
        Instance(value)
    }

    /// Serialize `value` and run the tag pass over the result.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value> {
        let value = serde_json::to_value(value)?;
        Ok(self.tag(value))
    }

    /// Normalize revival tags in `value`.
    ///
    /// Visits every nested object and array once. Tags that are not strings,
    /// or that name a type this registry does not know, are removed.
    pub fn tag(&self, value: Value) -> Value {
        let entries = self.read_entries();
        tag_walk(value, &entries)
    }

    pub fn tag_all(&self, values: Vec<Value>) -> Vec<Value> {
        let entries = self.read_entries();
        values.into_iter().map(|v| tag_walk(v, &entries)).collect()
    }

    /// Rebuild every tagged object naming a registered type and strip its tag.
    ///
    /// Nested values are revived before their containers. Tags naming
    /// unknown types are left in place.
    pub fn revive(&self, value: Value) -> Result<Value> {
        let entries = self.read_entries();
        revive_walk(value, &entries)
    }

    pub fn revive_all(&self, values: Vec<Value>) -> Result<Vec<Value>> {
        let entries = self.read_entries();
        values.into_iter().map(|v| revive_walk(v, &entries)).collect()
    }

    /// Revive `value` into `T`.
    ///
    /// A tag naming `T` itself or any registered type that lists
    /// `T::TYPE_NAME` among its bases is accepted.
    pub fn revive_as<T: Revivable>(&self, value: Value) -> Result<T> {
        if let Some(tag) = tag_name(&value) {
            if tag != T::TYPE_NAME && !self.inherits(tag, T::TYPE_NAME) {
                return Err(RpcError::Revival {
                    type_name: T::TYPE_NAME.to_string(),
                    message: format!("value is tagged as {}", tag),
                });
            }
        }
        let revived = self.revive(value)?;
        let mut typed: T = serde_json::from_value(revived).map_err(|e| RpcError::Revival {
            type_name: T::TYPE_NAME.to_string(),
            message: e.to_string(),
        })?;
        typed.on_revive();
        Ok(typed)
    }

    fn inherits(&self, type_name: &str, base: &str) -> bool {
        self.read_entries()
            .get(type_name)
            .map(|entry| entry.bases.contains(&base))
            .unwrap_or(false)
    }
}

fn tag_name(value: &Value) -> Option<&str> {
    value.get(RpcConfig::REVIVAL_TAG_FIELD).and_then(Value::as_str)
}

fn tag_walk(value: Value, entries: &HashMap<String, Entry>) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(|v| tag_walk(v, entries)).collect()),
        Value::Object(map) => {
            let keep_tag = match map.get(RpcConfig::REVIVAL_TAG_FIELD) {
                None => true,
                Some(Value::String(name)) => entries.contains_key(name),
                Some(_) => false,
            };
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                if key == RpcConfig::REVIVAL_TAG_FIELD {
                    if keep_tag {
                        out.insert(key, child);
                    }
                    continue;
                }
                out.insert(key, tag_walk(child, entries));
            }
            Value::Object(out)
        }
        primitive => primitive,
    }
}

/// Remove tags naming registered types; tags of unknown types stay.
fn strip_tags(value: Value, entries: &HashMap<String, Entry>) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(|v| strip_tags(v, entries)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, child)| {
                    key != RpcConfig::REVIVAL_TAG_FIELD
                        || !child.as_str().is_some_and(|name| entries.contains_key(name))
                })
                .map(|(key, child)| (key, strip_tags(child, entries)))
                .collect(),
        ),
        primitive => primitive,
    }
}

fn revive_walk(value: Value, entries: &HashMap<String, Entry>) -> Result<Value> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| revive_walk(v, entries))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let child = if key == RpcConfig::REVIVAL_TAG_FIELD {
                    child
                } else {
                    revive_walk(child, entries)?
                };
                out.insert(key, child);
            }
            let entry = out
                .get(RpcConfig::REVIVAL_TAG_FIELD)
                .and_then(Value::as_str)
                .and_then(|name| entries.get(name))
                .copied();
            match entry {
                Some(entry) => {
                    out.remove(RpcConfig::REVIVAL_TAG_FIELD);
                    // Rebuilding reserializes nested instances with their tags.
                    (entry.rebuild)(out).map(|rebuilt| strip_tags(rebuilt, entries))
                }
                None => Ok(Value::Object(out)),
            }
        }
        primitive => Ok(primitive),
    }
}
