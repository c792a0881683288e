//! The data-access contract the graph is built on, plus an in-memory store.
//!
//! [`Store`] is an identity map: every `(kind, id)` resolves to exactly one
//! [`ResourceRef`]. Fetches are async because real implementations go over
//! the network; local lookups (`get_by_id`, `all`) never suspend.
//!
//! [`MemoryStore`] keeps a "remote" table standing in for the server. It backs
//! tests and the replay tool.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fleetdeck_protocol::id_string;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::resource::{Resource, ResourceKey, ResourceRef};

/// Options for [`Store::find_all`].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub url: Option<String>,
    /// `None` values unset a default header for this request.
    pub headers: BTreeMap<String, Option<String>>,
    pub filter: BTreeMap<String, String>,
    pub force_reload: bool,
}

impl FindOptions {
    pub fn reload() -> Self {
        Self {
            force_reload: true,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, key: &str, value: &str) -> Self {
        self.filter.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Locates one resource, fetching it if it is not cached.
    async fn find(&self, kind: &str, id: &str) -> Result<ResourceRef, StoreError>;

    async fn find_all(
        &self,
        kind: &str,
        options: &FindOptions,
    ) -> Result<Vec<ResourceRef>, StoreError>;

    fn get_by_id(&self, kind: &str, id: &str) -> Option<ResourceRef>;

    /// Every cached resource of `kind`.
    fn all(&self, kind: &str) -> Vec<ResourceRef>;

    /// Identity-map hook: merges a `{type, id, ...}` payload into the
    /// canonical instance (creating it if needed) and returns that instance.
    fn typeify(&self, payload: Map<String, Value>) -> Option<ResourceRef>;

    /// Forgets every cached resource.
    fn reset(&self);

    /// Bumped by every `reset`. Work started under an older generation
    /// belongs to a session that no longer exists.
    fn generation(&self) -> u64;
}

#[derive(Default)]
pub struct MemoryStore {
    cache: RwLock<HashMap<ResourceKey, ResourceRef>>,
    remote: RwLock<BTreeMap<String, Vec<Map<String, Value>>>>,
    failures: RwLock<HashMap<String, StoreError>>,
    generation: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store whose remote table is `{ "<kind>": [record, ...] }`.
    pub fn from_snapshot(snapshot: Value) -> Result<Self, String> {
        let kinds = match snapshot {
            Value::Object(kinds) => kinds,
            _ => return Err("snapshot must be an object keyed by kind".to_string()),
        };

        let store = Self::new();
        for (kind, records) in kinds {
            let records = match records {
                Value::Array(records) => records,
                _ => return Err(format!("snapshot entry {} must be an array", kind)),
            };
            for record in records {
                match record {
                    Value::Object(mut map) => {
                        map.entry("type")
                            .or_insert_with(|| Value::String(kind.clone()));
                        store.insert_remote(map);
                    }
                    _ => return Err(format!("snapshot record in {} must be an object", kind)),
                }
            }
        }
        Ok(store)
    }

    /// Adds or replaces a record on the simulated server.
    pub fn insert_remote(&self, record: Map<String, Value>) {
        let Some(kind) = record.get("type").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let Some(id) = record.get("id").and_then(id_string) else {
            return;
        };

        let mut remote = self.remote.write();
        let records = remote.entry(kind).or_default();
        records.retain(|existing| {
            existing.get("id").and_then(id_string).as_deref() != Some(id.as_str())
        });
        records.push(record);
    }

    /// Drops a resource from the local cache only.
    pub fn evict(&self, kind: &str, id: &str) -> Option<ResourceRef> {
        self.cache.write().remove(&ResourceKey::new(kind, id))
    }

    /// Makes every request for `kind` fail with `err` until cleared.
    pub fn fail_kind(&self, kind: &str, err: StoreError) {
        self.failures.write().insert(kind.to_string(), err);
    }

    pub fn clear_failure(&self, kind: &str) {
        self.failures.write().remove(kind);
    }

    /// Loads every remote record into the cache.
    pub fn preload(&self) -> usize {
        let records: Vec<Map<String, Value>> =
            self.remote.read().values().flatten().cloned().collect();
        records
            .into_iter()
            .filter_map(|record| self.typeify_payload(record))
            .count()
    }

    pub fn cached_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .cache
            .read()
            .keys()
            .map(|key| key.kind.clone())
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    fn check_failure(&self, kind: &str) -> Result<(), StoreError> {
        match self.failures.read().get(kind) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn remote_record(&self, kind: &str, id: &str) -> Option<Map<String, Value>> {
        self.remote.read().get(kind).and_then(|records| {
            records
                .iter()
                .find(|record| record.get("id").and_then(id_string).as_deref() == Some(id))
                .cloned()
        })
    }

    fn typeify_payload(&self, payload: Map<String, Value>) -> Option<ResourceRef> {
        let kind = payload.get("type").and_then(Value::as_str)?.to_string();
        let id = payload.get("id").and_then(id_string)?;

        // Nested payloads resolve before any canonical instance is locked.
        let mut staged = Resource::new(kind.clone(), id.clone());
        staged.apply_payload(payload, &mut |nested| self.typeify_payload(nested));

        let key = ResourceKey::new(kind, id);
        let mut cache = self.cache.write();
        if let Some(canonical) = cache.get(&key).cloned() {
            drop(cache);
            canonical.write().overwrite_from(&staged);
            return Some(canonical);
        }

        let created = ResourceRef::new(staged);
        cache.insert(key, created.clone());
        Some(created)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find(&self, kind: &str, id: &str) -> Result<ResourceRef, StoreError> {
        // Behave like a request: callers always observe a suspension point.
        tokio::task::yield_now().await;
        self.check_failure(kind)?;

        if let Some(cached) = self.get_by_id(kind, id) {
            return Ok(cached);
        }

        let not_found = || StoreError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        };
        let mut record = self.remote_record(kind, id).ok_or_else(not_found)?;
        record
            .entry("type")
            .or_insert_with(|| Value::String(kind.to_string()));
        self.typeify_payload(record).ok_or_else(not_found)
    }

    async fn find_all(
        &self,
        kind: &str,
        options: &FindOptions,
    ) -> Result<Vec<ResourceRef>, StoreError> {
        tokio::task::yield_now().await;
        self.check_failure(kind)?;

        if !options.force_reload {
            let cached = self.all(kind);
            if !cached.is_empty() {
                return Ok(cached);
            }
        }

        let records = self.remote.read().get(kind).cloned().unwrap_or_default();
        Ok(records
            .into_iter()
            .filter(|record| matches_filter(record, &options.filter))
            .filter_map(|record| self.typeify_payload(record))
            .collect())
    }

    fn get_by_id(&self, kind: &str, id: &str) -> Option<ResourceRef> {
        self.cache.read().get(&ResourceKey::new(kind, id)).cloned()
    }

    fn all(&self, kind: &str) -> Vec<ResourceRef> {
        let mut found: Vec<ResourceRef> = self
            .cache
            .read()
            .values()
            .filter(|resource| resource.kind() == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    fn typeify(&self, payload: Map<String, Value>) -> Option<ResourceRef> {
        self.typeify_payload(payload)
    }

    fn reset(&self) {
        let drained: Vec<ResourceRef> = self.cache.write().drain().map(|(_, r)| r).collect();
        for resource in drained {
            resource.write().clear_links();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, "Store reset");
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Filter keys the record does not carry are server-side hints and match.
fn matches_filter(record: &Map<String, Value>, filter: &BTreeMap<String, String>) -> bool {
    filter.iter().all(|(key, expected)| match record.get(key) {
        Some(Value::String(actual)) => actual == expected,
        Some(Value::Bool(actual)) => actual.to_string() == *expected,
        Some(Value::Number(actual)) => actual.to_string() == *expected,
        Some(_) => false,
        None => true,
    })
}
