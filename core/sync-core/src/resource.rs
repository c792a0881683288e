//! Resources and the handles the graph is built from.
//!
//! A [`Resource`] is mutated in place and shared through [`ResourceRef`].
//! Handles carry their immutable `(kind, id)` key so collections can be
//! scanned without taking a lock on every member.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use fleetdeck_protocol::id_string;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::{Map, Value};

pub const STATE_ACTIVE: &str = "active";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Shared handle to a canonical resource.
#[derive(Clone)]
pub struct ResourceRef {
    key: ResourceKey,
    inner: Arc<RwLock<Resource>>,
}

impl ResourceRef {
    pub fn new(resource: Resource) -> Self {
        Self {
            key: ResourceKey::new(resource.kind.clone(), resource.id.clone()),
            inner: Arc::new(RwLock::new(resource)),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn kind(&self) -> &str {
        &self.key.kind
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Resource> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Resource> {
        self.inner.write()
    }

    /// True when both handles point at the same instance, not merely the same key.
    pub fn same_instance(&self, other: &ResourceRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> Option<String> {
        self.read().state.clone()
    }
}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Graphs are cyclic (balancer <-> config); never recurse.
        write!(f, "ResourceRef({})", self.key)
    }
}

/// Typed, identity-addressed record.
#[derive(Debug, Clone)]
pub struct Resource {
    kind: String,
    id: String,
    state: Option<String>,
    fields: Map<String, Value>,
    relations: BTreeMap<String, ResourceRef>,
    collections: BTreeMap<String, Vec<ResourceRef>>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            state: None,
            fields: Map::new(),
            relations: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = Some(state.into());
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn relation(&self, name: &str) -> Option<ResourceRef> {
        self.relations.get(name).cloned()
    }

    pub fn set_relation(&mut self, name: impl Into<String>, target: ResourceRef) {
        self.relations.insert(name.into(), target);
    }

    pub fn collection(&self, name: &str) -> Option<&[ResourceRef]> {
        self.collections.get(name).map(Vec::as_slice)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Returns the named collection, creating it empty if absent.
    pub fn collection_mut(&mut self, name: &str) -> &mut Vec<ResourceRef> {
        self.collections.entry(name.to_string()).or_default()
    }

    pub fn collection_contains(&self, name: &str, id: &str) -> bool {
        self.collections
            .get(name)
            .map(|members| members.iter().any(|member| member.id() == id))
            .unwrap_or(false)
    }

    /// Removes every member with `id`; returns how many were dropped.
    pub fn remove_from_collection(&mut self, name: &str, id: &str) -> usize {
        match self.collections.get_mut(name) {
            Some(members) => {
                let before = members.len();
                members.retain(|member| member.id() != id);
                before - members.len()
            }
            None => 0,
        }
    }

    /// Ids referenced by a pointer field, whatever shape it arrived in:
    /// a bare id, a list of ids or objects, a resolved relation, or a
    /// resolved collection.
    pub fn pointer_ids(&self, field: &str) -> BTreeSet<String> {
        if let Some(target) = self.relations.get(field) {
            return BTreeSet::from([target.id().to_string()]);
        }
        if let Some(members) = self.collections.get(field) {
            return members.iter().map(|m| m.id().to_string()).collect();
        }

        match self.fields.get(field) {
            Some(Value::Array(items)) => items.iter().filter_map(item_id).collect(),
            Some(value) => item_id(value).into_iter().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Merges a payload. Keys present in `payload` win; absent keys are kept.
    ///
    /// `resolve` turns embedded `{type, id, ...}` objects into canonical
    /// handles; it is the identity-map hook of the owning store.
    pub fn apply_payload<F>(&mut self, payload: Map<String, Value>, resolve: &mut F)
    where
        F: FnMut(Map<String, Value>) -> Option<ResourceRef>,
    {
        for (key, value) in payload {
            match key.as_str() {
                "id" | "type" => continue,
                "state" => {
                    self.state = value.as_str().map(str::to_string);
                    continue;
                }
                _ => {}
            }

            match value {
                Value::Object(map) if is_embedded_resource(&map) => {
                    if let Some(target) = resolve(map) {
                        self.fields.remove(&key);
                        self.relations.insert(key, target);
                    }
                }
                Value::Array(items)
                    if (!items.is_empty() && items.iter().all(is_embedded_value))
                        || (items.is_empty() && self.collections.contains_key(&key)) =>
                {
                    let members = items
                        .into_iter()
                        .filter_map(|item| match item {
                            Value::Object(map) => resolve(map),
                            _ => None,
                        })
                        .collect();
                    self.fields.remove(&key);
                    self.collections.insert(key, members);
                }
                Value::Null if self.relations.contains_key(&key) => {
                    self.relations.remove(&key);
                }
                other => {
                    self.relations.remove(&key);
                    self.collections.remove(&key);
                    self.fields.insert(key, other);
                }
            }
        }
    }

    /// Full property overwrite from another instance of the same resource.
    pub fn overwrite_from(&mut self, other: &Resource) {
        if other.state.is_some() {
            self.state = other.state.clone();
        }
        for (key, value) in &other.fields {
            if let (Value::Array(items), Some(members)) = (value, self.collections.get_mut(key)) {
                if items.is_empty() {
                    members.clear();
                    continue;
                }
            }
            self.relations.remove(key);
            self.collections.remove(key);
            self.fields.insert(key.clone(), value.clone());
        }
        for (key, target) in &other.relations {
            self.fields.remove(key);
            self.relations.insert(key.clone(), target.clone());
        }
        for (key, members) in &other.collections {
            self.fields.remove(key);
            self.collections.insert(key.clone(), members.clone());
        }
    }

    /// Drops every handle this resource holds, breaking reference cycles.
    pub fn clear_links(&mut self) {
        self.relations.clear();
        self.collections.clear();
    }
}

fn item_id(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => map.get("id").and_then(id_string),
        other => id_string(other),
    }
}

pub(crate) fn is_embedded_resource(map: &Map<String, Value>) -> bool {
    map.get("type").and_then(Value::as_str).is_some()
        && map.get("id").and_then(id_string).is_some()
}

fn is_embedded_value(value: &Value) -> bool {
    matches!(value, Value::Object(map) if is_embedded_resource(map))
}
