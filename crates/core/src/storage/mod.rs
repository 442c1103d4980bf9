use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::types::{EventType, FlowEvent};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Tries made by `index_update_with_retry` before giving up.
pub const UPDATE_MAX_ATTEMPTS: u32 = 4;

/// Initial backoff between contended-update retries. Doubles per attempt.
pub const UPDATE_BACKOFF: Duration = Duration::from_millis(10);

/// Capacity of per-stream live-append channels. A subscriber that lags
/// past this many events loses the oldest ones.
pub const SUBSCRIBE_CAPACITY: usize = 256;

/// Options for a bounded stream read.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Only events with id >= from_id.
    pub from_id: Option<u64>,
    pub limit: Option<usize>,
    /// Newest-first when set; default is append order.
    pub descending: bool,
    /// Restrict to these event types.
    pub types: Option<Vec<EventType>>,
}

impl ReadOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tail(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            descending: true,
            ..Default::default()
        }
    }

    pub fn of_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            ..Default::default()
        }
    }

    pub(crate) fn matches(&self, event: &FlowEvent) -> bool {
        if let Some(from) = self.from_id {
            if event.id < from {
                return false;
            }
        }
        match &self.types {
            Some(types) => types.contains(&event.event_type),
            None => true,
        }
    }
}

/// One entry in a sorted index. Entries order score-descending on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub score: i64,
    pub metadata: Value,
    pub version: u64,
}

/// In-place metadata mutator for retried updates. Re-applied to a fresh
/// read on every attempt, so it must be idempotent over its own output.
pub type Mutator<'a> = &'a (dyn Fn(&mut Value) + Send + Sync);

/// Uniform persistence interface: append-only streams, sorted indices
/// with optimistic versioning and atomic counters, and a small KV space.
///
/// All names arrive fully prefixed; backends never apply tenancy logic.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Streams ---

    /// Append an event, assigning the next monotone id and the final
    /// timestamp. Returns the stored event and fans it out to live
    /// subscribers.
    async fn stream_append(&self, stream: &str, event: FlowEvent) -> Result<FlowEvent>;

    async fn stream_read(&self, stream: &str, opts: &ReadOptions) -> Result<Vec<FlowEvent>>;

    /// Live appends for in-process listeners.
    async fn stream_subscribe(&self, stream: &str) -> Result<broadcast::Receiver<FlowEvent>>;

    /// May return `Error::NotSupported`; callers treat that as soft-fail.
    async fn stream_delete(&self, stream: &str) -> Result<()>;

    // --- Indices ---

    /// Upsert an entry. A fresh entry starts at version 1; re-adding an
    /// existing id replaces score and metadata and bumps the version.
    async fn index_add(&self, key: &str, id: &str, score: i64, metadata: Value)
        -> Result<IndexEntry>;

    async fn index_get(&self, key: &str, id: &str) -> Result<Option<IndexEntry>>;

    /// Score-descending page.
    async fn index_read(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<IndexEntry>>;

    async fn index_count(&self, key: &str) -> Result<usize>;

    /// Shallow-merge `patch` into the metadata iff the stored version
    /// still equals `base_version`. Returns `false` on mismatch.
    async fn index_update(&self, key: &str, id: &str, patch: Value, base_version: u64)
        -> Result<bool>;

    /// Atomic add on an integer metadata field; creates the entry (and
    /// the field) when absent. Returns the new value.
    async fn index_increment(&self, key: &str, id: &str, field: &str, delta: i64) -> Result<i64>;

    async fn index_delete(&self, key: &str, id: &str) -> Result<bool>;

    /// Drop every entry under a key. Returns how many were removed.
    async fn index_clear(&self, key: &str) -> Result<usize>;

    /// Remove entries whose score (epoch ms) is older than the retention
    /// window. Returns how many were removed.
    async fn index_cleanup_by_retention(&self, key: &str, retention_seconds: u64)
        -> Result<usize>;

    // --- KV ---

    async fn kv_get(&self, key: &str) -> Result<Option<Value>>;

    async fn kv_set(&self, key: &str, value: Value, ttl_seconds: Option<u64>) -> Result<()>;

    async fn kv_delete(&self, key: &str) -> Result<bool>;

    /// Advisory glob delete; reports how many keys matched.
    async fn kv_delete_by_pattern(&self, pattern: &str) -> Result<usize>;

    // --- Derived helpers ---

    /// Read-modify-write with bounded exponential backoff. The mutator is
    /// applied to a fresh copy of the metadata on every attempt; after
    /// `UPDATE_MAX_ATTEMPTS` contended attempts this fails with
    /// `Error::ContendedWrite`.
    async fn index_update_with_retry(
        &self,
        key: &str,
        id: &str,
        mutate: Mutator<'_>,
    ) -> Result<IndexEntry> {
        let mut backoff = UPDATE_BACKOFF;
        for attempt in 0..UPDATE_MAX_ATTEMPTS {
            let entry = self.index_get(key, id).await?.ok_or_else(|| {
                Error::TransientStore(format!("index entry {key}/{id} not found"))
            })?;

            let mut metadata = entry.metadata.clone();
            mutate(&mut metadata);

            if self
                .index_update(key, id, metadata, entry.version)
                .await?
            {
                return self.index_get(key, id).await?.ok_or_else(|| {
                    Error::TransientStore(format!("index entry {key}/{id} vanished"))
                });
            }

            if attempt + 1 < UPDATE_MAX_ATTEMPTS {
                tracing::debug!(key, id, attempt, "contended index update, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(Error::ContendedWrite {
            key: key.to_string(),
            id: id.to_string(),
            attempts: UPDATE_MAX_ATTEMPTS,
        })
    }
}

/// Atomic-add bookkeeping shared by backends: walk a dotted field path
/// (creating objects along the way), add `delta`, return the new value.
pub(crate) fn int_field_add(metadata: &mut Value, path: &str, delta: i64) -> i64 {
    let mut current = metadata;
    let mut parts = path.split('.').peekable();
    loop {
        let part = parts.next().expect("field path is never empty");
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().unwrap();
        if parts.peek().is_none() {
            let next = map.get(part).and_then(|v| v.as_i64()).unwrap_or(0) + delta;
            map.insert(part.to_string(), Value::from(next));
            return next;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Set a (possibly dotted) field path inside a metadata object, creating
/// intermediate objects along the way.
pub(crate) fn set_field(metadata: &mut Value, path: &str, value: Value) {
    let mut current = metadata;
    let mut parts = path.split('.').peekable();
    loop {
        let part = parts.next().expect("field path is never empty");
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().unwrap();
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Shallow-merge a JSON object patch into a target object.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Apply read options to an in-memory event slice.
pub(crate) fn apply_read_options(events: &[FlowEvent], opts: &ReadOptions) -> Vec<FlowEvent> {
    let mut selected: Vec<FlowEvent> = events
        .iter()
        .filter(|e| opts.matches(e))
        .cloned()
        .collect();
    if opts.descending {
        selected.reverse();
    }
    if let Some(limit) = opts.limit {
        selected.truncate(limit);
    }
    selected
}
