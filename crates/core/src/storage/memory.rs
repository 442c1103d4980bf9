use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::{apply_read_options, merge_patch, IndexEntry, ReadOptions, Store, SUBSCRIBE_CAPACITY};
use crate::error::{Error, Result};
use crate::types::FlowEvent;

/// In-memory store backend. Used by tests and embedded deployments; the
/// single mutex gives every index operation the atomicity the contract
/// requires.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    subscribers: Mutex<HashMap<String, broadcast::Sender<FlowEvent>>>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    indices: HashMap<String, HashMap<String, IndexEntry>>,
    kv: HashMap<String, KvEntry>,
}

#[derive(Default)]
struct StreamState {
    next_id: u64,
    events: Vec<FlowEvent>,
}

struct KvEntry {
    value: Value,
    expires_at: Option<i64>,
}

impl KvEntry {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now().timestamp_millis() >= at,
            None => false,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, stream: &str) -> broadcast::Sender<FlowEvent> {
        self.subscribers
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBE_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn stream_append(&self, stream: &str, mut event: FlowEvent) -> Result<FlowEvent> {
        let stored = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            event.id = state.next_id;
            event.ts = Utc::now();
            state.events.push(event.clone());
            event
        };

        // Best-effort fan-out; no receivers is fine.
        let _ = self.sender(stream).send(stored.clone());
        Ok(stored)
    }

    async fn stream_read(&self, stream: &str, opts: &ReadOptions) -> Result<Vec<FlowEvent>> {
        let inner = self.inner.lock().unwrap();
        let events = inner
            .streams
            .get(stream)
            .map(|s| s.events.as_slice())
            .unwrap_or(&[]);
        Ok(apply_read_options(events, opts))
    }

    async fn stream_subscribe(&self, stream: &str) -> Result<broadcast::Receiver<FlowEvent>> {
        Ok(self.sender(stream).subscribe())
    }

    async fn stream_delete(&self, stream: &str) -> Result<()> {
        self.inner.lock().unwrap().streams.remove(stream);
        Ok(())
    }

    async fn index_add(
        &self,
        key: &str,
        id: &str,
        score: i64,
        metadata: Value,
    ) -> Result<IndexEntry> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.indices.entry(key.to_string()).or_default();
        let version = index.get(id).map(|e| e.version + 1).unwrap_or(1);
        let entry = IndexEntry {
            id: id.to_string(),
            score,
            metadata,
            version,
        };
        index.insert(id.to_string(), entry.clone());
        Ok(entry)
    }

    async fn index_get(&self, key: &str, id: &str) -> Result<Option<IndexEntry>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .indices
            .get(key)
            .and_then(|index| index.get(id))
            .cloned())
    }

    async fn index_read(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<IndexEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<IndexEntry> = inner
            .indices
            .get(key)
            .map(|index| index.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn index_count(&self, key: &str) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.indices.get(key).map(|i| i.len()).unwrap_or(0))
    }

    async fn index_update(
        &self,
        key: &str,
        id: &str,
        patch: Value,
        base_version: u64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.indices.get_mut(key).and_then(|index| index.get_mut(id)) else {
            return Ok(false);
        };
        if entry.version != base_version {
            return Ok(false);
        }
        merge_patch(&mut entry.metadata, &patch);
        entry.version += 1;
        Ok(true)
    }

    async fn index_increment(&self, key: &str, id: &str, field: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.indices.entry(key.to_string()).or_default();
        let entry = index.entry(id.to_string()).or_insert_with(|| IndexEntry {
            id: id.to_string(),
            score: Utc::now().timestamp_millis(),
            metadata: Value::Object(serde_json::Map::new()),
            version: 1,
        });

        Ok(super::int_field_add(&mut entry.metadata, field, delta))
    }

    async fn index_delete(&self, key: &str, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .indices
            .get_mut(key)
            .map(|index| index.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn index_clear(&self, key: &str) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .indices
            .remove(key)
            .map(|index| index.len())
            .unwrap_or(0))
    }

    async fn index_cleanup_by_retention(
        &self,
        key: &str,
        retention_seconds: u64,
    ) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - (retention_seconds as i64) * 1000;
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.indices.get_mut(key) else {
            return Ok(0);
        };
        let before = index.len();
        index.retain(|_, entry| entry.score >= cutoff);
        Ok(before - index.len())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.kv.get(key) {
            Some(entry) if entry.expired() => true,
            Some(entry) => return Ok(Some(entry.value.clone())),
            None => return Ok(None),
        };
        if expired {
            inner.kv.remove(key);
        }
        Ok(None)
    }

    async fn kv_set(&self, key: &str, value: Value, ttl_seconds: Option<u64>) -> Result<()> {
        let expires_at =
            ttl_seconds.map(|ttl| Utc::now().timestamp_millis() + (ttl as i64) * 1000);
        self.inner
            .lock()
            .unwrap()
            .kv
            .insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().kv.remove(key).is_some())
    }

    async fn kv_delete_by_pattern(&self, pattern: &str) -> Result<usize> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| Error::Config(format!("invalid glob pattern: {e}")))?;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.kv.len();
        inner.kv.retain(|key, _| !pattern.matches(key));
        Ok(before - inner.kv.len())
    }
}
