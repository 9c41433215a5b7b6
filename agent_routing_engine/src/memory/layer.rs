//! Memory layer abstraction and the bounded in-process LRU layer.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::debug;

use super::entry::{LayerKind, MemoryEntry, MemoryKey};
use super::similarity::FuzzyMatcher;
use crate::error::MemoryLayerError;

pub type LayerResult<T> = std::result::Result<T, MemoryLayerError>;

/// Result of a layer lookup: a snapshot of the entry after it was touched.
#[derive(Debug, Clone)]
pub struct LayerLookup {
    pub entry: MemoryEntry,
    pub fuzzy: bool,
}

/// Point-in-time counters of one layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerStats {
    pub layer: Option<LayerKind>,
    pub entries: usize,
    pub capacity: Option<usize>,
    pub ttl_seconds: Option<u64>,
    pub hits: u64,
    pub fuzzy_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expired: u64,
    /// `entries / capacity`; `None` for unbounded layers.
    pub utilization: Option<f64>,
    /// `hits / (hits + misses)`, 0 before the first lookup.
    pub hit_rate: f64,
}

/// Shared counter block used by layer implementations.
#[derive(Debug, Default)]
pub(crate) struct LayerCounters {
    pub hits: AtomicU64,
    pub fuzzy_hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub evictions: AtomicU64,
    pub expired: AtomicU64,
}

impl LayerCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut LayerStats) {
        stats.hits = self.hits.load(Ordering::Relaxed);
        stats.fuzzy_hits = self.fuzzy_hits.load(Ordering::Relaxed);
        stats.misses = self.misses.load(Ordering::Relaxed);
        stats.inserts = self.inserts.load(Ordering::Relaxed);
        stats.evictions = self.evictions.load(Ordering::Relaxed);
        stats.expired = self.expired.load(Ordering::Relaxed);
        let lookups = stats.hits + stats.misses;
        stats.hit_rate = if lookups == 0 { 0.0 } else { stats.hits as f64 / lookups as f64 };
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.fuzzy_hits,
            &self.misses,
            &self.inserts,
            &self.evictions,
            &self.expired,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// One tier of the memory system.
#[async_trait]
pub trait MemoryLayer: Send + Sync {
    fn kind(&self) -> LayerKind;

    /// Fresh entry for `key`, or a near-duplicate where the layer supports it.
    /// Stale entries are dropped and reported as misses.
    async fn lookup(
        &self,
        key: &MemoryKey,
        function_name: &str,
        parameters: &Value,
        now: SystemTime,
    ) -> LayerResult<Option<LayerLookup>>;

    /// Fresh entry for `key` without touching it.
    async fn peek(&self, key: &MemoryKey, now: SystemTime) -> LayerResult<Option<MemoryEntry>>;

    async fn contains_fresh(&self, key: &MemoryKey, now: SystemTime) -> LayerResult<bool> {
        Ok(self.peek(key, now).await?.is_some())
    }

    /// Store `entry` in this layer. Returns the key evicted to make room, if any.
    async fn insert(&self, entry: MemoryEntry, now: SystemTime) -> LayerResult<Option<MemoryKey>>;

    async fn remove(&self, key: &MemoryKey) -> LayerResult<bool>;

    /// Remove every stale entry; returns how many were removed.
    async fn sweep_expired(&self, now: SystemTime) -> LayerResult<usize>;

    /// Fresh entries recorded for `function_name`.
    async fn entries_for(&self, function_name: &str, now: SystemTime) -> LayerResult<Vec<MemoryEntry>>;

    async fn clear(&self) -> LayerResult<()>;

    async fn stats(&self) -> LayerStats;
}

/// Bounded LRU layer with a per-layer TTL.
pub struct LruLayer {
    kind: LayerKind,
    ttl: Duration,
    capacity: NonZeroUsize,
    entries: Mutex<LruCache<MemoryKey, MemoryEntry>>,
    fuzzy: Option<FuzzyMatcher>,
    counters: LayerCounters,
}

impl LruLayer {
    pub fn new(kind: LayerKind, capacity: usize, ttl: Duration) -> LayerResult<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            MemoryLayerError::new(kind.as_str(), "create", "capacity must be positive")
        })?;
        Ok(Self {
            kind,
            ttl,
            capacity,
            entries: Mutex::new(LruCache::new(capacity)),
            fuzzy: None,
            counters: LayerCounters::default(),
        })
    }

    /// Enable near-duplicate matching on exact-key misses.
    pub fn with_fuzzy(mut self, matcher: Option<FuzzyMatcher>) -> Self {
        self.fuzzy = matcher;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup_exact(&self, key: &MemoryKey, now: SystemTime) -> Option<MemoryEntry> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_fresh(now) => {
                entry.touch(now);
                return Some(entry.clone());
            }
            Some(_) => {}
            None => return None,
        }
        entries.pop(key);
        LayerCounters::bump(&self.counters.expired);
        None
    }

    fn lookup_fuzzy(
        &self,
        matcher: &FuzzyMatcher,
        function_name: &str,
        parameters: &Value,
        now: SystemTime,
    ) -> Option<MemoryEntry> {
        let mut entries = self.entries.lock();
        let mut best: Option<(MemoryKey, f64)> = None;
        for (key, entry) in entries.iter() {
            if entry.function_name != function_name || !entry.is_fresh(now) {
                continue;
            }
            if let Some(score) = matcher.matches(parameters, &entry.parameters) {
                if best.as_ref().map_or(true, |(_, s)| score > *s) {
                    best = Some((key.clone(), score));
                }
            }
        }
        let (key, _) = best?;
        let entry = entries.get_mut(&key)?;
        entry.touch(now);
        Some(entry.clone())
    }
}

#[async_trait]
impl MemoryLayer for LruLayer {
    fn kind(&self) -> LayerKind {
        self.kind
    }

    async fn lookup(
        &self,
        key: &MemoryKey,
        function_name: &str,
        parameters: &Value,
        now: SystemTime,
    ) -> LayerResult<Option<LayerLookup>> {
        if let Some(entry) = self.lookup_exact(key, now) {
            LayerCounters::bump(&self.counters.hits);
            return Ok(Some(LayerLookup { entry, fuzzy: false }));
        }
        if let Some(matcher) = &self.fuzzy {
            if let Some(entry) = self.lookup_fuzzy(matcher, function_name, parameters, now) {
                debug!(layer = %self.kind, matched = %entry.key, "Near-duplicate hit");
                LayerCounters::bump(&self.counters.hits);
                LayerCounters::bump(&self.counters.fuzzy_hits);
                return Ok(Some(LayerLookup { entry, fuzzy: true }));
            }
        }
        LayerCounters::bump(&self.counters.misses);
        Ok(None)
    }

    async fn peek(&self, key: &MemoryKey, now: SystemTime) -> LayerResult<Option<MemoryEntry>> {
        let entries = self.entries.lock();
        Ok(entries.peek(key).filter(|e| e.is_fresh(now)).cloned())
    }

    async fn insert(&self, entry: MemoryEntry, now: SystemTime) -> LayerResult<Option<MemoryKey>> {
        let entry = entry.placed_in(self.kind, Some(self.ttl), now);
        let key = entry.key.clone();
        let displaced = self.entries.lock().push(key.clone(), entry);
        LayerCounters::bump(&self.counters.inserts);

        match displaced {
            Some((old_key, _)) if old_key != key => {
                LayerCounters::bump(&self.counters.evictions);
                debug!(layer = %self.kind, evicted = %old_key, "Evicted least recently used entry");
                Ok(Some(old_key))
            }
            _ => Ok(None),
        }
    }

    async fn remove(&self, key: &MemoryKey) -> LayerResult<bool> {
        Ok(self.entries.lock().pop(key).is_some())
    }

    async fn sweep_expired(&self, now: SystemTime) -> LayerResult<usize> {
        let mut entries = self.entries.lock();
        let stale: Vec<MemoryKey> = entries
            .iter()
            .filter(|(_, e)| !e.is_fresh(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        LayerCounters::add(&self.counters.expired, stale.len());
        Ok(stale.len())
    }

    async fn entries_for(&self, function_name: &str, now: SystemTime) -> LayerResult<Vec<MemoryEntry>> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(_, e)| e.function_name == function_name && e.is_fresh(now))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn clear(&self) -> LayerResult<()> {
        self.entries.lock().clear();
        self.counters.reset();
        Ok(())
    }

    async fn stats(&self) -> LayerStats {
        let mut stats = LayerStats {
            layer: Some(self.kind),
            entries: self.len(),
            capacity: Some(self.capacity.get()),
            ttl_seconds: Some(self.ttl.as_secs()),
            utilization: Some(self.len() as f64 / self.capacity.get() as f64),
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(function: &str, params: Value, now: SystemTime) -> MemoryEntry {
        MemoryEntry::new(function, params, json!("result"), "agent", now)
    }

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(10_000)
    }

    #[tokio::test]
    async fn test_insert_beyond_capacity_evicts_least_recent() {
        let layer = LruLayer::new(LayerKind::ShortTerm, 2, Duration::from_secs(60)).unwrap();
        let now = t0();
        let a = entry("f", json!({"n": 1}), now);
        let b = entry("f", json!({"n": 2}), now);
        let c = entry("f", json!({"n": 3}), now);
        let (ka, kb) = (a.key.clone(), b.key.clone());

        assert_eq!(layer.insert(a, now).await.unwrap(), None);
        assert_eq!(layer.insert(b, now).await.unwrap(), None);
        // Reading `a` makes `b` the least recently used.
        assert!(layer.lookup(&ka, "f", &json!({"n": 1}), now).await.unwrap().is_some());

        let evicted = layer.insert(c, now).await.unwrap();
        assert_eq!(evicted, Some(kb.clone()));
        assert_eq!(layer.len(), 2);
        assert!(!layer.contains_fresh(&kb, now).await.unwrap());
        assert_eq!(layer.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_reinsert_same_key_is_not_an_eviction() {
        let layer = LruLayer::new(LayerKind::MediumTerm, 1, Duration::from_secs(60)).unwrap();
        let now = t0();
        layer.insert(entry("f", json!({}), now), now).await.unwrap();
        let evicted = layer.insert(entry("f", json!({}), now), now).await.unwrap();
        assert_eq!(evicted, None);
        assert_eq!(layer.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_stats_report_utilization_and_hit_rate() {
        let layer = LruLayer::new(LayerKind::ShortTerm, 4, Duration::from_secs(60)).unwrap();
        let now = t0();
        let fresh = layer.stats().await;
        assert_eq!(fresh.utilization, Some(0.0));
        assert_eq!(fresh.hit_rate, 0.0);

        let a = entry("f", json!({"n": 1}), now);
        let ka = a.key.clone();
        layer.insert(a, now).await.unwrap();
        assert!(layer.lookup(&ka, "f", &json!({"n": 1}), now).await.unwrap().is_some());
        let other = MemoryKey::for_call("g", &json!({}));
        assert!(layer.lookup(&other, "g", &json!({}), now).await.unwrap().is_none());

        let stats = layer.stats().await;
        assert_eq!(stats.utilization, Some(0.25));
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_entries_miss_and_sweep() {
        let layer = LruLayer::new(LayerKind::ShortTerm, 10, Duration::from_secs(5)).unwrap();
        let now = t0();
        let e = entry("f", json!({"k": "v"}), now);
        let key = e.key.clone();
        layer.insert(e, now).await.unwrap();
        layer.insert(entry("f", json!({"k": "w"}), now), now).await.unwrap();

        let later = now + Duration::from_secs(4);
        assert!(layer.lookup(&key, "f", &json!({"k": "v"}), later).await.unwrap().is_some());

        let expired = now + Duration::from_secs(6);
        assert!(layer.lookup(&key, "f", &json!({"k": "v"}), expired).await.unwrap().is_none());
        assert_eq!(layer.sweep_expired(expired).await.unwrap(), 1);
        assert!(layer.is_empty());
    }

    #[tokio::test]
    async fn test_fuzzy_lookup_matches_near_duplicate() {
        let layer = LruLayer::new(LayerKind::ShortTerm, 10, Duration::from_secs(60))
            .unwrap()
            .with_fuzzy(Some(FuzzyMatcher::new(1e-3, 0.9)));
        let now = t0();
        layer
            .insert(entry("search", json!({"query": "BRCA1 gene", "limit": 10}), now), now)
            .await
            .unwrap();

        let probe = json!({"query": "  brca1   GENE", "limit": 10.0005});
        let key = MemoryKey::for_call("search", &probe);
        let hit = layer.lookup(&key, "search", &probe, now).await.unwrap().unwrap();
        assert!(hit.fuzzy);
        assert_eq!(hit.entry.access_count, 1);

        let other_fn = MemoryKey::for_call("fetch", &probe);
        assert!(layer.lookup(&other_fn, "fetch", &probe, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exact_only_without_matcher() {
        let layer = LruLayer::new(LayerKind::LongTerm, 10, Duration::from_secs(60)).unwrap();
        let now = t0();
        layer.insert(entry("f", json!({"x": 1.0}), now), now).await.unwrap();
        let probe = json!({"x": 1.0001});
        let key = MemoryKey::for_call("f", &probe);
        assert!(layer.lookup(&key, "f", &probe, now).await.unwrap().is_none());
        assert_eq!(layer.stats().await.misses, 1);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(LruLayer::new(LayerKind::ShortTerm, 0, Duration::from_secs(1)).is_err());
    }
}
