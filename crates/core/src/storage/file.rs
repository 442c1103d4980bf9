use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::{apply_read_options, merge_patch, IndexEntry, ReadOptions, Store, SUBSCRIBE_CAPACITY};
use crate::error::{Error, Result};
use crate::types::FlowEvent;

const INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("indices");
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Composite key separator for index entries: `<key>\0<id>`. Index keys
/// and ids never contain NUL, so the prefix range scan stays exact.
const SEP: char = '\0';

/// Durable store backend: indices and KV live in a single redb database,
/// streams are gzip-compressed JSONL files under `<data_dir>/streams/`.
pub struct FileStore {
    db: Database,
    streams_dir: PathBuf,
    // Serializes stream file rewrites and guards the id watermark.
    stream_ids: Mutex<HashMap<String, u64>>,
    subscribers: Mutex<HashMap<String, broadcast::Sender<FlowEvent>>>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct KvRecord {
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl FileStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let streams_dir = data_dir.join("streams");
        std::fs::create_dir_all(&streams_dir).map_err(Error::transient)?;

        let db = Database::create(data_dir.join("index.redb")).map_err(Error::transient)?;
        let write_txn = db.begin_write().map_err(Error::transient)?;
        {
            write_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
            write_txn.open_table(KV_TABLE).map_err(Error::transient)?;
        }
        write_txn.commit().map_err(Error::transient)?;

        Ok(Self {
            db,
            streams_dir,
            stream_ids: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    fn stream_path(&self, stream: &str) -> PathBuf {
        // Stream names carry the tenancy prefix with ':' separators.
        let file = stream.replace(':', "-");
        self.streams_dir.join(format!("{file}.jsonl.gz"))
    }

    fn read_stream_file(&self, path: &Path) -> Result<Vec<FlowEvent>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(path).map_err(Error::transient)?;
        let reader = std::io::BufReader::new(GzDecoder::new(file));

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(Error::transient)?;
            if line.is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    fn write_stream_file(&self, path: &Path, events: &[FlowEvent]) -> Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for event in events {
            let json = serde_json::to_string(event)?;
            encoder
                .write_all(json.as_bytes())
                .and_then(|_| encoder.write_all(b"\n"))
                .map_err(Error::transient)?;
        }
        let compressed = encoder.finish().map_err(Error::transient)?;
        std::fs::write(path, compressed).map_err(Error::transient)
    }

    fn sender(&self, stream: &str) -> broadcast::Sender<FlowEvent> {
        self.subscribers
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBE_CAPACITY).0)
            .clone()
    }

    fn composite(key: &str, id: &str) -> String {
        format!("{key}{SEP}{id}")
    }

    fn range_bounds(key: &str) -> (String, String) {
        (format!("{key}{SEP}"), format!("{key}{SEP}\u{10FFFF}"))
    }

    fn entries_for_key(&self, key: &str) -> Result<Vec<IndexEntry>> {
        let read_txn = self.db.begin_read().map_err(Error::transient)?;
        let table = read_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
        let (low, high) = Self::range_bounds(key);

        let mut entries = Vec::new();
        for item in table
            .range(low.as_str()..high.as_str())
            .map_err(Error::transient)?
        {
            let (_, value) = item.map_err(Error::transient)?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn stream_append(&self, stream: &str, mut event: FlowEvent) -> Result<FlowEvent> {
        let stored = {
            let mut ids = self.stream_ids.lock().unwrap();
            let path = self.stream_path(stream);

            // Recover the watermark from disk on first touch after open.
            let mut events = self.read_stream_file(&path)?;
            let next = ids
                .entry(stream.to_string())
                .or_insert_with(|| events.last().map(|e| e.id).unwrap_or(0));
            *next += 1;

            event.id = *next;
            event.ts = Utc::now();
            events.push(event.clone());
            self.write_stream_file(&path, &events)?;
            event
        };

        let _ = self.sender(stream).send(stored.clone());
        Ok(stored)
    }

    async fn stream_read(&self, stream: &str, opts: &ReadOptions) -> Result<Vec<FlowEvent>> {
        let events = {
            let _guard = self.stream_ids.lock().unwrap();
            self.read_stream_file(&self.stream_path(stream))?
        };
        Ok(apply_read_options(&events, opts))
    }

    async fn stream_subscribe(&self, stream: &str) -> Result<broadcast::Receiver<FlowEvent>> {
        Ok(self.sender(stream).subscribe())
    }

    async fn stream_delete(&self, stream: &str) -> Result<()> {
        let mut ids = self.stream_ids.lock().unwrap();
        ids.remove(stream);
        let path = self.stream_path(stream);
        if path.exists() {
            std::fs::remove_file(path).map_err(Error::transient)?;
        }
        Ok(())
    }

    async fn index_add(
        &self,
        key: &str,
        id: &str,
        score: i64,
        metadata: Value,
    ) -> Result<IndexEntry> {
        let composite = Self::composite(key, id);
        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        let entry = {
            let mut table = write_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
            let version = match table.get(composite.as_str()).map_err(Error::transient)? {
                Some(existing) => {
                    let prior: IndexEntry = serde_json::from_slice(existing.value())?;
                    prior.version + 1
                }
                None => 1,
            };
            let entry = IndexEntry {
                id: id.to_string(),
                score,
                metadata,
                version,
            };
            let bytes = serde_json::to_vec(&entry)?;
            table
                .insert(composite.as_str(), bytes.as_slice())
                .map_err(Error::transient)?;
            entry
        };
        write_txn.commit().map_err(Error::transient)?;
        Ok(entry)
    }

    async fn index_get(&self, key: &str, id: &str) -> Result<Option<IndexEntry>> {
        let composite = Self::composite(key, id);
        let read_txn = self.db.begin_read().map_err(Error::transient)?;
        let table = read_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
        match table.get(composite.as_str()).map_err(Error::transient)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn index_read(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<IndexEntry>> {
        let mut entries = self.entries_for_key(key)?;
        entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }

    async fn index_count(&self, key: &str) -> Result<usize> {
        Ok(self.entries_for_key(key)?.len())
    }

    async fn index_update(
        &self,
        key: &str,
        id: &str,
        patch: Value,
        base_version: u64,
    ) -> Result<bool> {
        let composite = Self::composite(key, id);
        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        let updated = {
            let mut table = write_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
            let current = match table.get(composite.as_str()).map_err(Error::transient)? {
                Some(value) => {
                    let entry: IndexEntry = serde_json::from_slice(value.value())?;
                    Some(entry)
                }
                None => None,
            };

            match current {
                Some(mut entry) if entry.version == base_version => {
                    merge_patch(&mut entry.metadata, &patch);
                    entry.version += 1;
                    let bytes = serde_json::to_vec(&entry)?;
                    table
                        .insert(composite.as_str(), bytes.as_slice())
                        .map_err(Error::transient)?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit().map_err(Error::transient)?;
        Ok(updated)
    }

    async fn index_increment(&self, key: &str, id: &str, field: &str, delta: i64) -> Result<i64> {
        let composite = Self::composite(key, id);
        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        let next = {
            let mut table = write_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
            let mut entry = match table.get(composite.as_str()).map_err(Error::transient)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => IndexEntry {
                    id: id.to_string(),
                    score: Utc::now().timestamp_millis(),
                    metadata: Value::Object(serde_json::Map::new()),
                    version: 1,
                },
            };

            let next = super::int_field_add(&mut entry.metadata, field, delta);
            let bytes = serde_json::to_vec(&entry)?;
            table
                .insert(composite.as_str(), bytes.as_slice())
                .map_err(Error::transient)?;
            next
        };
        write_txn.commit().map_err(Error::transient)?;
        Ok(next)
    }

    async fn index_delete(&self, key: &str, id: &str) -> Result<bool> {
        let composite = Self::composite(key, id);
        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        let removed = {
            let mut table = write_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
            let result = table
                .remove(composite.as_str())
                .map_err(Error::transient)?
                .is_some();
            result
        };
        write_txn.commit().map_err(Error::transient)?;
        Ok(removed)
    }

    async fn index_clear(&self, key: &str) -> Result<usize> {
        let ids: Vec<String> = self
            .entries_for_key(key)?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        {
            let mut table = write_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
            for id in &ids {
                table
                    .remove(Self::composite(key, id).as_str())
                    .map_err(Error::transient)?;
            }
        }
        write_txn.commit().map_err(Error::transient)?;
        Ok(ids.len())
    }

    async fn index_cleanup_by_retention(
        &self,
        key: &str,
        retention_seconds: u64,
    ) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - (retention_seconds as i64) * 1000;
        let stale: Vec<String> = self
            .entries_for_key(key)?
            .into_iter()
            .filter(|e| e.score < cutoff)
            .map(|e| e.id)
            .collect();

        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        {
            let mut table = write_txn.open_table(INDEX_TABLE).map_err(Error::transient)?;
            for id in &stale {
                table
                    .remove(Self::composite(key, id).as_str())
                    .map_err(Error::transient)?;
            }
        }
        write_txn.commit().map_err(Error::transient)?;
        Ok(stale.len())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        let record = {
            let read_txn = self.db.begin_read().map_err(Error::transient)?;
            let table = read_txn.open_table(KV_TABLE).map_err(Error::transient)?;
            match table.get(key).map_err(Error::transient)? {
                Some(value) => Some(serde_json::from_slice::<KvRecord>(value.value())?),
                None => None,
            }
        };

        match record {
            Some(record) => {
                let expired = record
                    .expires_at
                    .map(|at| Utc::now().timestamp_millis() >= at)
                    .unwrap_or(false);
                if expired {
                    self.kv_delete(key).await?;
                    Ok(None)
                } else {
                    Ok(Some(record.value))
                }
            }
            None => Ok(None),
        }
    }

    async fn kv_set(&self, key: &str, value: Value, ttl_seconds: Option<u64>) -> Result<()> {
        let record = KvRecord {
            value,
            expires_at: ttl_seconds.map(|ttl| Utc::now().timestamp_millis() + (ttl as i64) * 1000),
        };
        let bytes = serde_json::to_vec(&record)?;

        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(Error::transient)?;
            table
                .insert(key, bytes.as_slice())
                .map_err(Error::transient)?;
        }
        write_txn.commit().map_err(Error::transient)?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        let removed = {
            let mut table = write_txn.open_table(KV_TABLE).map_err(Error::transient)?;
            let result = table.remove(key).map_err(Error::transient)?.is_some();
            result
        };
        write_txn.commit().map_err(Error::transient)?;
        Ok(removed)
    }

    async fn kv_delete_by_pattern(&self, pattern: &str) -> Result<usize> {
        let pattern = glob::Pattern::new(pattern)
            .map_err(|e| Error::Config(format!("invalid glob pattern: {e}")))?;

        let matched: Vec<String> = {
            let read_txn = self.db.begin_read().map_err(Error::transient)?;
            let table = read_txn.open_table(KV_TABLE).map_err(Error::transient)?;
            let mut keys = Vec::new();
            for item in table.iter().map_err(Error::transient)? {
                let (key, _) = item.map_err(Error::transient)?;
                if pattern.matches(key.value()) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };

        let write_txn = self.db.begin_write().map_err(Error::transient)?;
        {
            let mut table = write_txn.open_table(KV_TABLE).map_err(Error::transient)?;
            for key in &matched {
                table.remove(key.as_str()).map_err(Error::transient)?;
            }
        }
        write_txn.commit().map_err(Error::transient)?;
        Ok(matched.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, RunId};
    use tempfile::TempDir;

    #[tokio::test]
    async fn events_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let run_id = RunId::new();
        {
            let store = FileStore::new(dir.path()).unwrap();
            store
                .stream_append("nvent:flow:abc", FlowEvent::new(EventType::FlowStart, run_id, "f"))
                .await
                .unwrap();
            store
                .stream_append("nvent:flow:abc", FlowEvent::new(EventType::Emit, run_id, "f"))
                .await
                .unwrap();
        }

        let store = FileStore::new(dir.path()).unwrap();
        let events = store
            .stream_read("nvent:flow:abc", &ReadOptions::all())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 1);
        assert_eq!(events[1].id, 2);

        // Appends continue from the recovered watermark.
        let next = store
            .stream_append("nvent:flow:abc", FlowEvent::new(EventType::StepStarted, run_id, "f"))
            .await
            .unwrap();
        assert_eq!(next.id, 3);
    }

    #[tokio::test]
    async fn index_roundtrip_and_versioning() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let entry = store
            .index_add("nvent:flows:f", "run-1", 100, serde_json::json!({"status": "running"}))
            .await
            .unwrap();
        assert_eq!(entry.version, 1);

        assert!(store
            .index_update("nvent:flows:f", "run-1", serde_json::json!({"status": "completed"}), 1)
            .await
            .unwrap());
        assert!(!store
            .index_update("nvent:flows:f", "run-1", serde_json::json!({"status": "failed"}), 1)
            .await
            .unwrap());

        let entry = store.index_get("nvent:flows:f", "run-1").await.unwrap().unwrap();
        assert_eq!(entry.metadata["status"], "completed");

        let count = store.index_increment("nvent:flows:f", "run-1", "completed_steps", 2).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn composite_keys_do_not_leak_across_indices() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        store
            .index_add("nvent:flows:a", "run-1", 1, serde_json::json!({}))
            .await
            .unwrap();
        store
            .index_add("nvent:flows:ab", "run-2", 2, serde_json::json!({}))
            .await
            .unwrap();

        let a = store.index_read("nvent:flows:a", 0, 10).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].id, "run-1");

        assert_eq!(store.index_clear("nvent:flows:ab").await.unwrap(), 1);
        assert_eq!(store.index_count("nvent:flows:a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn kv_pattern_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store
            .kv_set("nvent:payload:1", serde_json::json!("a"), None)
            .await
            .unwrap();
        store
            .kv_set("nvent:payload:2", serde_json::json!("b"), None)
            .await
            .unwrap();
        store
            .kv_set("nvent:lock", serde_json::json!("c"), None)
            .await
            .unwrap();

        assert_eq!(store.kv_delete_by_pattern("nvent:payload:*").await.unwrap(), 2);
        assert!(store.kv_get("nvent:lock").await.unwrap().is_some());
    }
}
