//! In-process resource store.
//!
//! Implements the same optimistic-concurrency contract as the API server:
//! every write bumps `resourceVersion`, and status updates presenting a stale
//! version are rejected. Used by tests and local dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{record_key, ResourceStore};
use crate::error::{Error, Result};

struct Inner<K> {
    records: BTreeMap<(String, String), K>,
    next_version: u64,
    creates: usize,
    updates: usize,
    failing_updates: usize,
}

/// Store keeping records in memory
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                next_version: 1,
                creates: 0,
                updates: 0,
                failing_updates: 0,
            }),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing create accounting.
    pub fn insert(&self, mut record: K) -> K {
        let mut inner = self.inner.lock();
        let version = inner.bump();
        record.meta_mut().resource_version = Some(version);
        inner.records.insert(key_of(&record), record.clone());
        record
    }

    /// Snapshot of every stored record.
    pub fn records(&self) -> Vec<K> {
        self.inner.lock().records.values().cloned().collect()
    }

    /// Number of successful creates.
    pub fn create_count(&self) -> usize {
        self.inner.lock().creates
    }

    /// Number of successful status updates.
    pub fn update_count(&self) -> usize {
        self.inner.lock().updates
    }

    /// Make the next `n` status updates fail as if the store were unreachable.
    pub fn fail_next_updates(&self, n: usize) {
        self.inner.lock().failing_updates = n;
    }
}

impl<K> Inner<K> {
    fn bump(&mut self) -> String {
        let version = self.next_version;
        self.next_version += 1;
        version.to_string()
    }
}

fn key_of<K: Resource>(record: &K) -> (String, String) {
    (record.namespace().unwrap_or_default(), record.name_any())
}

fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            let (k, v) = term
                .split_once("==")
                .or_else(|| term.split_once('='))
                .unwrap_or((term, ""));
            labels.get(k.trim()).map(String::as_str) == Some(v.trim())
        })
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .filter(|((ns, _), _)| namespace.is_empty() || ns == namespace)
            .filter(|(_, record)| selector_matches(record.labels(), label_selector))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn create(&self, record: &K) -> Result<K> {
        let mut inner = self.inner.lock();
        let key = key_of(record);
        if inner.records.contains_key(&key) {
            return Err(Error::AlreadyExists(record_key(record)));
        }

        let mut created = record.clone();
        let version = inner.bump();
        created.meta_mut().resource_version = Some(version);
        inner.records.insert(key, created.clone());
        inner.creates += 1;
        Ok(created)
    }

    async fn update_status(&self, record: &K) -> Result<K> {
        let mut inner = self.inner.lock();
        if inner.failing_updates > 0 {
            inner.failing_updates -= 1;
            return Err(Error::Unavailable(format!(
                "injected failure updating {}",
                record_key(record)
            )));
        }

        let key = key_of(record);
        let stored = inner
            .records
            .get(&key)
            .ok_or_else(|| Error::NotFound(record_key(record)))?;

        if record.resource_version() != stored.resource_version() {
            return Err(Error::Conflict(record_key(record)));
        }

        // Only the status is taken from the caller's copy
        let mut merged = serde_json::to_value(stored)?;
        let incoming = serde_json::to_value(record)?;
        merged["status"] = incoming.get("status").cloned().unwrap_or_default();
        let mut updated: K = serde_json::from_value(merged)?;

        let version = inner.bump();
        updated.meta_mut().resource_version = Some(version);
        inner.records.insert(key, updated.clone());
        inner.updates += 1;
        Ok(updated)
    }
}
