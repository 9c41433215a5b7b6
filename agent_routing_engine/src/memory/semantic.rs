//! Persistent semantic layer backed by sled.
//!
//! Entries never expire; they leave the store only through an explicit purge.
//! Path statistics share the same database so routing knowledge survives restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info};

use super::entry::{LayerKind, MemoryEntry, MemoryKey};
use super::layer::{LayerCounters, LayerLookup, LayerResult, LayerStats, MemoryLayer};
use super::paths::PathStats;
use crate::error::MemoryLayerError;

const LAYER: &str = "semantic";
const ENTRIES_TREE: &str = "entries";
const PATHS_TREE: &str = "execution_paths";
const FUNCTION_INDEX_TREE: &str = "entries_by_function";

/// On-disk form of an entry. JSON payloads are kept as text since bincode
/// cannot decode self-describing values.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    function_name: String,
    parameters: String,
    value: String,
    context: Option<String>,
    agent_name: String,
    exec_time_ms: u64,
    created_at: SystemTime,
    last_accessed_at: SystemTime,
    access_count: u64,
}

impl PersistedEntry {
    fn from_entry(entry: &MemoryEntry) -> Self {
        Self {
            key: entry.key.as_str().to_string(),
            function_name: entry.function_name.clone(),
            parameters: entry.parameters.to_string(),
            value: entry.value.to_string(),
            context: entry.context.as_ref().map(Value::to_string),
            agent_name: entry.agent_name.clone(),
            exec_time_ms: entry.exec_time_ms,
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
            access_count: entry.access_count,
        }
    }

    fn into_entry(self) -> Result<MemoryEntry, serde_json::Error> {
        let context = self.context.as_deref().map(serde_json::from_str).transpose()?;
        Ok(MemoryEntry {
            key: MemoryKey::from_raw(self.key),
            function_name: self.function_name,
            parameters: serde_json::from_str(&self.parameters)?,
            value: serde_json::from_str(&self.value)?,
            context,
            layer: LayerKind::Semantic,
            agent_name: self.agent_name,
            exec_time_ms: self.exec_time_ms,
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            ttl: None,
        })
    }
}

fn err(operation: &'static str, e: impl std::fmt::Display) -> MemoryLayerError {
    MemoryLayerError::new(LAYER, operation, e)
}

/// `first \0 second`; used for path statistics and the per-function entry index.
fn pair_key(first: &str, second: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(first.len() + second.len() + 1);
    key.extend_from_slice(first.as_bytes());
    key.push(0);
    key.extend_from_slice(second.as_bytes());
    key
}

fn function_prefix(function_name: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(function_name.len() + 1);
    prefix.extend_from_slice(function_name.as_bytes());
    prefix.push(0);
    prefix
}

/// sled-backed store for the semantic layer and persisted path statistics.
pub struct SemanticStore {
    db: sled::Db,
    entries: sled::Tree,
    by_function: sled::Tree,
    paths: sled::Tree,
    counters: LayerCounters,
    purged: AtomicU64,
}

impl SemanticStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> LayerResult<Self> {
        let db = sled::open(path).map_err(|e| err("open", e))?;
        info!("Semantic memory opened at {}", path.display());
        Self::from_db(db)
    }

    /// A store that is discarded when dropped.
    pub fn temporary() -> LayerResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| err("open", e))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> LayerResult<Self> {
        let entries = db.open_tree(ENTRIES_TREE).map_err(|e| err("open", e))?;
        let by_function = db.open_tree(FUNCTION_INDEX_TREE).map_err(|e| err("open", e))?;
        let paths = db.open_tree(PATHS_TREE).map_err(|e| err("open", e))?;
        Ok(Self {
            db,
            entries,
            by_function,
            paths,
            counters: LayerCounters::default(),
            purged: AtomicU64::new(0),
        })
    }

    fn read(&self, key: &MemoryKey) -> LayerResult<Option<MemoryEntry>> {
        let Some(bytes) = self.entries.get(key.as_str()).map_err(|e| err("read", e))? else {
            return Ok(None);
        };
        decode(&bytes).map(Some)
    }

    fn write(&self, entry: &MemoryEntry) -> LayerResult<()> {
        let bytes = bincode::serialize(&PersistedEntry::from_entry(entry)).map_err(|e| err("write", e))?;
        self.entries
            .insert(entry.key.as_str(), bytes)
            .map_err(|e| err("write", e))?;
        self.by_function
            .insert(pair_key(&entry.function_name, entry.key.as_str()), Vec::<u8>::new())
            .map_err(|e| err("write", e))?;
        Ok(())
    }

    /// Remove one entry by key.
    pub fn purge(&self, key: &MemoryKey) -> LayerResult<bool> {
        let Some(entry) = self.read(key)? else {
            return Ok(false);
        };
        self.entries.remove(key.as_str()).map_err(|e| err("purge", e))?;
        self.by_function
            .remove(pair_key(&entry.function_name, key.as_str()))
            .map_err(|e| err("purge", e))?;
        self.purged.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Remove every entry recorded for `function_name`; returns how many were removed.
    pub fn purge_function(&self, function_name: &str) -> LayerResult<usize> {
        let indexed = self.indexed_keys(function_name)?;
        let mut removed = 0;
        for (index_key, key) in &indexed {
            if self.entries.remove(key.as_str()).map_err(|e| err("purge", e))?.is_some() {
                removed += 1;
            }
            self.by_function.remove(index_key).map_err(|e| err("purge", e))?;
        }
        self.purged.fetch_add(removed as u64, Ordering::Relaxed);
        debug!(function = function_name, removed, "Purged semantic entries");
        Ok(removed)
    }

    /// Index keys and entry keys stored for one function, read by prefix.
    fn indexed_keys(&self, function_name: &str) -> LayerResult<Vec<(sled::IVec, MemoryKey)>> {
        let prefix = function_prefix(function_name);
        self.by_function
            .scan_prefix(&prefix)
            .keys()
            .map(|item| {
                let index_key = item.map_err(|e| err("scan", e))?;
                let raw = String::from_utf8_lossy(&index_key[prefix.len()..]).into_owned();
                Ok((index_key, MemoryKey::from_raw(raw)))
            })
            .collect()
    }

    pub fn load_path_stats(&self) -> LayerResult<Vec<(String, String, PathStats)>> {
        let mut out = Vec::new();
        for item in self.paths.iter() {
            let (k, v) = item.map_err(|e| err("load_paths", e))?;
            let mut parts = k.splitn(2, |b| *b == 0);
            let function = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
            let agent = String::from_utf8_lossy(parts.next().unwrap_or_default()).into_owned();
            let stats: PathStats = bincode::deserialize(&v).map_err(|e| err("load_paths", e))?;
            out.push((function, agent, stats));
        }
        Ok(out)
    }

    pub fn save_path_stats(&self, function_name: &str, agent_name: &str, stats: &PathStats) -> LayerResult<()> {
        let bytes = bincode::serialize(stats).map_err(|e| err("save_path", e))?;
        self.paths
            .insert(pair_key(function_name, agent_name), bytes)
            .map_err(|e| err("save_path", e))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&self) -> LayerResult<()> {
        self.db.flush().map_err(|e| err("flush", e))?;
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> LayerResult<MemoryEntry> {
    let persisted: PersistedEntry = bincode::deserialize(bytes).map_err(|e| err("decode", e))?;
    persisted.into_entry().map_err(|e| err("decode", e))
}

#[async_trait]
impl MemoryLayer for SemanticStore {
    fn kind(&self) -> LayerKind {
        LayerKind::Semantic
    }

    async fn lookup(
        &self,
        key: &MemoryKey,
        _function_name: &str,
        _parameters: &Value,
        now: SystemTime,
    ) -> LayerResult<Option<LayerLookup>> {
        match self.read(key)? {
            Some(mut entry) => {
                entry.touch(now);
                self.write(&entry)?;
                LayerCounters::bump(&self.counters.hits);
                Ok(Some(LayerLookup { entry, fuzzy: false }))
            }
            None => {
                LayerCounters::bump(&self.counters.misses);
                Ok(None)
            }
        }
    }

    async fn peek(&self, key: &MemoryKey, _now: SystemTime) -> LayerResult<Option<MemoryEntry>> {
        self.read(key)
    }

    async fn insert(&self, entry: MemoryEntry, now: SystemTime) -> LayerResult<Option<MemoryKey>> {
        let entry = entry.placed_in(LayerKind::Semantic, None, now);
        self.write(&entry)?;
        LayerCounters::bump(&self.counters.inserts);
        Ok(None)
    }

    async fn remove(&self, key: &MemoryKey) -> LayerResult<bool> {
        self.purge(key)
    }

    async fn sweep_expired(&self, _now: SystemTime) -> LayerResult<usize> {
        Ok(0)
    }

    async fn entries_for(&self, function_name: &str, _now: SystemTime) -> LayerResult<Vec<MemoryEntry>> {
        let mut entries = Vec::new();
        for (_, key) in self.indexed_keys(function_name)? {
            if let Some(entry) = self.read(&key)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn clear(&self) -> LayerResult<()> {
        self.entries.clear().map_err(|e| err("clear", e))?;
        self.by_function.clear().map_err(|e| err("clear", e))?;
        self.paths.clear().map_err(|e| err("clear", e))?;
        self.counters.reset();
        Ok(())
    }

    async fn stats(&self) -> LayerStats {
        let mut stats = LayerStats {
            layer: Some(LayerKind::Semantic),
            entries: self.len(),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats.evictions = self.purged.load(Ordering::Relaxed);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(50_000)
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let entry = MemoryEntry::new("align", json!({"seq": "ATG"}), json!({"score": 42}), "analysis", now())
            .with_context(Some(json!({"view": "track"})));
        let key = entry.key.clone();
        {
            let store = SemanticStore::open(dir.path()).unwrap();
            store.insert(entry, now()).await.unwrap();
            store.flush().unwrap();
        }
        let store = SemanticStore::open(dir.path()).unwrap();
        let hit = store.lookup(&key, "align", &json!({}), now()).await.unwrap().unwrap();
        assert_eq!(hit.entry.value, json!({"score": 42}));
        assert_eq!(hit.entry.context, Some(json!({"view": "track"})));
        assert_eq!(hit.entry.ttl, None);
        assert_eq!(hit.entry.access_count, 1);
    }

    #[tokio::test]
    async fn test_never_expires_and_purges_by_function() {
        let store = SemanticStore::temporary().unwrap();
        for n in 0..3 {
            let e = MemoryEntry::new("f", json!({"n": n}), json!(n), "a", now());
            store.insert(e, now()).await.unwrap();
        }
        store
            .insert(MemoryEntry::new("g", json!({}), json!(0), "a", now()), now())
            .await
            .unwrap();

        let far_future = now() + Duration::from_secs(10 * 365 * 86_400);
        assert_eq!(store.sweep_expired(far_future).await.unwrap(), 0);
        assert_eq!(store.entries_for("f", far_future).await.unwrap().len(), 3);

        assert_eq!(store.purge_function("f").unwrap(), 3);
        assert_eq!(store.len(), 1);
        assert!(store.entries_for("f", far_future).await.unwrap().is_empty());
        assert_eq!(store.entries_for("g", far_future).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_function_index_is_prefix_exact() {
        let store = SemanticStore::temporary().unwrap();
        let align = MemoryEntry::new("align", json!({"seq": "ATG"}), json!(1), "a", now());
        let key = align.key.clone();
        store.insert(align, now()).await.unwrap();
        store
            .insert(MemoryEntry::new("align_all", json!({"seq": "ATG"}), json!(2), "a", now()), now())
            .await
            .unwrap();

        let found = store.entries_for("align", now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].function_name, "align");

        assert!(store.purge(&key).unwrap());
        assert!(!store.purge(&key).unwrap());
        assert!(store.entries_for("align", now()).await.unwrap().is_empty());
        assert_eq!(store.entries_for("align_all", now()).await.unwrap().len(), 1);

        let stats = store.stats().await;
        assert_eq!(stats.utilization, None);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_path_stats_roundtrip() {
        let store = SemanticStore::temporary().unwrap();
        let mut stats = PathStats::default();
        stats.record(true, 25);
        store.save_path_stats("align", "analysis", &stats).unwrap();

        let loaded = store.load_path_stats().unwrap();
        assert_eq!(loaded, vec![("align".to_string(), "analysis".to_string(), stats)]);
    }
}
