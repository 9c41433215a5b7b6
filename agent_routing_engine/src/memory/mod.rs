//! Tiered memory: short, medium and long-term LRU layers plus a persistent
//! semantic store, composed behind [`MemorySystem`].
//!
//! Lookups walk the layers from shortest- to longest-lived and return the first
//! fresh hit. Frequently read entries are copied one layer down the chain so they
//! outlive the layer that first cached them. Layer failures are logged and treated
//! as misses; they never fail the calling operation.

pub mod entry;
pub mod layer;
pub mod paths;
pub mod semantic;
pub mod similarity;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use entry::{EntryState, LayerKind, MemoryEntry, MemoryHit, MemoryKey};
pub use layer::{LayerStats, LruLayer, MemoryLayer};
pub use paths::{ExecutionPathCandidate, PathStats};
pub use semantic::SemanticStore;

use crate::clock::Clock;
use crate::error::MemoryLayerError;
use crate::settings::MemoryConfig;
use similarity::{parameter_similarity, ContextFeatures, FuzzyMatcher};

/// Weight of parameter similarity when both sides carry a context.
const NEIGHBOR_PARAMETER_WEIGHT: f64 = 0.7;

/// A completed tool call to be remembered.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub function_name: String,
    pub parameters: Value,
    pub value: Value,
    pub agent_name: String,
    pub exec_time_ms: u64,
    pub context: Option<Value>,
    pub crossed_network: bool,
}

impl ToolCallRecord {
    pub fn new(
        function_name: impl Into<String>,
        parameters: Value,
        value: Value,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            parameters,
            value,
            agent_name: agent_name.into(),
            exec_time_ms: 0,
            context: None,
            crossed_network: false,
        }
    }

    pub fn with_exec_time(mut self, exec_time_ms: u64) -> Self {
        self.exec_time_ms = exec_time_ms;
        self
    }

    pub fn with_context(mut self, context: Option<Value>) -> Self {
        self.context = context;
        self
    }

    pub fn crossed_network(mut self, crossed: bool) -> Self {
        self.crossed_network = crossed;
        self
    }
}

/// Parameters after nearest-neighbor completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizedParameters {
    pub parameters: Value,
    /// At least one key was filled in from a neighbor.
    pub adjusted: bool,
    pub source_key: Option<MemoryKey>,
    pub similarity: f64,
}

impl OptimizedParameters {
    fn unchanged(parameters: &Value) -> Self {
        Self {
            parameters: parameters.clone(),
            adjusted: false,
            source_key: None,
            similarity: 0.0,
        }
    }
}

/// Snapshot of the whole memory system.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub layers: Vec<LayerStats>,
    pub records: u64,
    pub promotions: u64,
    pub layer_errors: u64,
    pub tracked_paths: usize,
}

impl MemoryStats {
    pub fn layer(&self, kind: LayerKind) -> Option<&LayerStats> {
        self.layers.iter().find(|s| s.layer == Some(kind))
    }
}

/// Facade over the four memory layers.
pub struct MemorySystem {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    short_term: Arc<LruLayer>,
    medium_term: Arc<LruLayer>,
    long_term: Arc<LruLayer>,
    semantic: Arc<SemanticStore>,
    paths: DashMap<(String, String), PathStats>,
    records: AtomicU64,
    promotions: AtomicU64,
    layer_errors: AtomicU64,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl MemorySystem {
    pub fn new(config: MemoryConfig, clock: Arc<dyn Clock>) -> Result<Self, MemoryLayerError> {
        let short_term = LruLayer::new(
            LayerKind::ShortTerm,
            config.short_term.capacity,
            config.short_term.ttl(),
        )?
        .with_fuzzy(FuzzyMatcher::from_config(&config.fuzzy));
        let medium_term = LruLayer::new(
            LayerKind::MediumTerm,
            config.medium_term.capacity,
            config.medium_term.ttl(),
        )?;
        let long_term = LruLayer::new(
            LayerKind::LongTerm,
            config.long_term.capacity,
            config.long_term.ttl(),
        )?;
        let semantic = match &config.semantic_path {
            Some(path) => SemanticStore::open(path)?,
            None => SemanticStore::temporary()?,
        };

        let paths = DashMap::new();
        for (function, agent, stats) in semantic.load_path_stats()? {
            paths.insert((function, agent), stats);
        }
        if !paths.is_empty() {
            info!("Restored {} execution path(s) from semantic memory", paths.len());
        }

        Ok(Self {
            config,
            clock,
            short_term: Arc::new(short_term),
            medium_term: Arc::new(medium_term),
            long_term: Arc::new(long_term),
            semantic: Arc::new(semantic),
            paths,
            records: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            layer_errors: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn layer(&self, kind: LayerKind) -> &dyn MemoryLayer {
        match kind {
            LayerKind::ShortTerm => self.short_term.as_ref(),
            LayerKind::MediumTerm => self.medium_term.as_ref(),
            LayerKind::LongTerm => self.long_term.as_ref(),
            LayerKind::Semantic => self.semantic.as_ref(),
        }
    }

    fn absorb<T>(&self, result: Result<T, MemoryLayerError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.layer_errors.fetch_add(1, Ordering::Relaxed);
                warn!("{}", e);
                None
            }
        }
    }

    /// Remember a completed call. Always cached short-term; expensive or
    /// network-crossing calls are also kept long-term.
    #[instrument(skip(self, record), fields(function = %record.function_name, agent = %record.agent_name))]
    pub async fn record_tool_call(&self, record: ToolCallRecord) -> MemoryKey {
        let now = self.clock.now();
        let long_lived = record.crossed_network
            || record.exec_time_ms > self.config.expensive_call_threshold_ms;

        let entry = MemoryEntry::new(
            record.function_name,
            record.parameters,
            record.value,
            record.agent_name,
            now,
        )
        .with_context(record.context)
        .with_exec_time(record.exec_time_ms);
        let key = entry.key.clone();

        if long_lived {
            self.absorb(self.long_term.insert(entry.clone(), now).await);
        }
        self.absorb(self.short_term.insert(entry, now).await);
        self.records.fetch_add(1, Ordering::Relaxed);

        debug!(%key, long_lived, "Recorded tool call");
        key
    }

    /// First fresh hit for the call, walking layers from short- to long-lived.
    #[instrument(skip(self, parameters, _context))]
    pub async fn retrieve_memory_context(
        &self,
        function_name: &str,
        parameters: &Value,
        _context: Option<&Value>,
    ) -> Option<MemoryHit> {
        let now = self.clock.now();
        let key = MemoryKey::for_call(function_name, parameters);

        for kind in LayerKind::LOOKUP_ORDER {
            let layer = self.layer(kind);
            let Some(Some(found)) = self.absorb(layer.lookup(&key, function_name, parameters, now).await) else {
                continue;
            };
            let entry = found.entry;

            if entry.access_count > self.config.promotion_threshold {
                self.promote(&entry).await;
            }

            debug!(layer = %kind, fuzzy = found.fuzzy, "Memory hit");
            return Some(MemoryHit {
                age: entry.age(now),
                key: entry.key,
                value: entry.value,
                layer: kind,
                agent_name: entry.agent_name,
                access_count: entry.access_count,
                fuzzy: found.fuzzy,
            });
        }

        debug!("Memory miss");
        None
    }

    async fn promote(&self, entry: &MemoryEntry) {
        let Some(target) = entry.layer.promotes_to() else {
            return;
        };
        let now = self.clock.now();
        let layer = self.layer(target);
        if self.absorb(layer.contains_fresh(&entry.key, now).await) != Some(false) {
            return;
        }
        if self.absorb(layer.insert(entry.clone(), now).await).is_some() {
            self.promotions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %entry.key, from = %entry.layer, to = %target, "Promoted entry");
        }
    }

    /// Complete `parameters` with keys from the most similar remembered call.
    ///
    /// Caller-supplied values are never replaced, and non-object parameters are
    /// returned unchanged.
    #[instrument(skip(self, parameters, context))]
    pub async fn optimize_parameters(
        &self,
        function_name: &str,
        parameters: &Value,
        context: Option<&Value>,
    ) -> OptimizedParameters {
        let Value::Object(supplied) = parameters else {
            return OptimizedParameters::unchanged(parameters);
        };

        let now = self.clock.now();
        let features = ContextFeatures::from_value(context);
        let mut seen = HashSet::new();
        let mut best: Option<(f64, MemoryEntry)> = None;

        for kind in LayerKind::LOOKUP_ORDER {
            let Some(entries) = self.absorb(self.layer(kind).entries_for(function_name, now).await) else {
                continue;
            };
            for entry in entries {
                if !entry.parameters.is_object() || !seen.insert(entry.key.clone()) {
                    continue;
                }
                let mut similarity = parameter_similarity(parameters, &entry.parameters);
                let neighbor_features = ContextFeatures::from_value(entry.context.as_ref());
                if !features.is_empty() && !neighbor_features.is_empty() {
                    similarity = NEIGHBOR_PARAMETER_WEIGHT * similarity
                        + (1.0 - NEIGHBOR_PARAMETER_WEIGHT) * features.jaccard(&neighbor_features);
                }
                if best.as_ref().map_or(true, |(s, _)| similarity > *s) {
                    best = Some((similarity, entry));
                }
            }
        }

        let Some((similarity, neighbor)) = best else {
            return OptimizedParameters::unchanged(parameters);
        };
        if similarity < self.config.neighbor_similarity {
            return OptimizedParameters::unchanged(parameters);
        }

        let mut completed: Map<String, Value> = supplied.clone();
        let mut adjusted = false;
        if let Value::Object(neighbor_params) = &neighbor.parameters {
            for (k, v) in neighbor_params {
                if !completed.contains_key(k) {
                    completed.insert(k.clone(), v.clone());
                    adjusted = true;
                }
            }
        }
        if adjusted {
            debug!(source = %neighbor.key, similarity, "Completed parameters from neighbor");
        }

        OptimizedParameters {
            parameters: Value::Object(completed),
            adjusted,
            source_key: Some(neighbor.key),
            similarity,
        }
    }

    /// Rank `available_agents` for the call by recorded path statistics.
    #[instrument(skip(self, parameters, available_agents, _context))]
    pub async fn select_execution_path(
        &self,
        function_name: &str,
        parameters: &Value,
        available_agents: &[String],
        _context: Option<&Value>,
    ) -> Vec<ExecutionPathCandidate> {
        let now = self.clock.now();
        let key = MemoryKey::for_call(function_name, parameters);

        let mut affinity = None;
        for kind in LayerKind::LOOKUP_ORDER {
            if let Some(Some(entry)) = self.absorb(self.layer(kind).peek(&key, now).await) {
                affinity = Some(entry.agent_name);
                break;
            }
        }

        let stats = self.path_stats(function_name);
        paths::rank_paths(available_agents, &stats, affinity.as_deref())
    }

    /// Fold one execution outcome into the path statistics and persist them.
    pub fn record_execution_metric(
        &self,
        function_name: &str,
        agent_name: &str,
        success: bool,
        exec_time_ms: u64,
    ) {
        let snapshot = {
            let mut stats = self
                .paths
                .entry((function_name.to_string(), agent_name.to_string()))
                .or_default();
            stats.record(success, exec_time_ms);
            *stats
        };
        self.absorb(self.semantic.save_path_stats(function_name, agent_name, &snapshot));
    }

    /// Path statistics of every agent recorded for `function_name`.
    pub fn path_stats(&self, function_name: &str) -> HashMap<String, PathStats> {
        self.paths
            .iter()
            .filter(|item| item.key().0 == function_name)
            .map(|item| (item.key().1.clone(), *item.value()))
            .collect()
    }

    /// Remove stale entries from every bounded layer.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let swept = join_all(LayerKind::LOOKUP_ORDER.map(|kind| self.layer(kind).sweep_expired(now))).await;
        let removed: usize = swept
            .into_iter()
            .map(|result| self.absorb(result).unwrap_or(0))
            .sum();
        if removed > 0 {
            debug!("Swept {} expired memory entries", removed);
        }
        removed
    }

    /// Spawn the periodic TTL sweep. Calling it again replaces the running sweeper.
    pub fn start_sweeper(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.sweeper.lock().replace(token.clone()) {
            previous.cancel();
        }

        let memory = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        memory.sweep_expired().await;
                    }
                }
            }
            debug!("Memory sweeper stopped");
        });
        info!("Memory sweeper started (every {:?})", period);
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stop the sweeper and flush the semantic store.
    pub async fn shutdown(&self) {
        if let Some(token) = self.sweeper.lock().take() {
            token.cancel();
        }
        self.absorb(self.semantic.flush());
    }

    pub async fn purge_semantic(&self, key: &MemoryKey) -> bool {
        self.absorb(self.semantic.purge(key)).unwrap_or(false)
    }

    pub async fn purge_semantic_function(&self, function_name: &str) -> usize {
        self.absorb(self.semantic.purge_function(function_name)).unwrap_or(0)
    }

    /// Drop every entry and all path statistics.
    pub async fn clear(&self) {
        for kind in LayerKind::LOOKUP_ORDER {
            self.absorb(self.layer(kind).clear().await);
        }
        self.paths.clear();
        self.records.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        info!("Memory cleared");
    }

    pub async fn stats(&self) -> MemoryStats {
        let layers = join_all(LayerKind::LOOKUP_ORDER.map(|kind| self.layer(kind).stats())).await;
        MemoryStats {
            layers,
            records: self.records.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            layer_errors: self.layer_errors.load(Ordering::Relaxed),
            tracked_paths: self.paths.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn memory() -> (MemorySystem, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let memory = MemorySystem::new(MemoryConfig::default(), clock.clone()).unwrap();
        (memory, clock)
    }

    #[tokio::test]
    async fn test_record_then_retrieve_from_short_term() {
        let (memory, _) = memory();
        let params = json!({"gene": "araA"});
        memory
            .record_tool_call(ToolCallRecord::new("lookup", params.clone(), json!("found"), "data"))
            .await;

        let hit = memory.retrieve_memory_context("lookup", &params, None).await.unwrap();
        assert_eq!(hit.layer, LayerKind::ShortTerm);
        assert_eq!(hit.value, json!("found"));
        assert_eq!(hit.agent_name, "data");
        assert!(!hit.fuzzy);
        assert!(memory.retrieve_memory_context("lookup", &json!({"gene": "araB"}), None).await.is_none());
    }

    #[tokio::test]
    async fn test_expensive_and_network_calls_reach_long_term() {
        let (memory, clock) = memory();
        memory
            .record_tool_call(ToolCallRecord::new("slow", json!({}), json!(1), "a").with_exec_time(900))
            .await;
        memory
            .record_tool_call(ToolCallRecord::new("remote", json!({}), json!(2), "b").crossed_network(true))
            .await;
        memory
            .record_tool_call(ToolCallRecord::new("cheap", json!({}), json!(3), "c").with_exec_time(10))
            .await;

        // Past the short-term TTL only long-term copies remain.
        clock.advance(Duration::from_secs(301));
        assert_eq!(
            memory.retrieve_memory_context("slow", &json!({}), None).await.map(|h| h.layer),
            Some(LayerKind::LongTerm)
        );
        assert_eq!(
            memory.retrieve_memory_context("remote", &json!({}), None).await.map(|h| h.layer),
            Some(LayerKind::LongTerm)
        );
        assert!(memory.retrieve_memory_context("cheap", &json!({}), None).await.is_none());
    }

    #[tokio::test]
    async fn test_frequent_reads_promote_to_next_layer() {
        let (memory, clock) = memory();
        let params = json!({"q": 1});
        memory
            .record_tool_call(ToolCallRecord::new("f", params.clone(), json!("v"), "a"))
            .await;
        for _ in 0..4 {
            memory.retrieve_memory_context("f", &params, None).await.unwrap();
        }
        let stats = memory.stats().await;
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.layer(LayerKind::MediumTerm).unwrap().entries, 1);

        clock.advance(Duration::from_secs(301));
        let hit = memory.retrieve_memory_context("f", &params, None).await.unwrap();
        assert_eq!(hit.layer, LayerKind::MediumTerm);
    }

    #[tokio::test]
    async fn test_optimize_fills_missing_keys_only() {
        let (memory, _) = memory();
        memory
            .record_tool_call(ToolCallRecord::new(
                "render",
                json!({"track": "genes", "species": "ecoli", "zoom": 3, "strand": "+", "height": 120, "palette": "dark"}),
                json!("ok"),
                "nav",
            ))
            .await;

        let input = json!({"track": "genes", "species": "ecoli", "zoom": 4, "strand": "+", "height": 120});
        let optimized = memory.optimize_parameters("render", &input, None).await;
        assert!(optimized.adjusted);
        assert!(optimized.similarity >= 0.75);
        assert_eq!(optimized.parameters["zoom"], json!(4));
        assert_eq!(optimized.parameters["palette"], json!("dark"));
        assert_eq!(input.as_object().unwrap().len(), 5);

        let unrelated = json!({"other": true});
        let untouched = memory.optimize_parameters("render", &unrelated, None).await;
        assert!(!untouched.adjusted);
        assert_eq!(untouched.parameters, unrelated);
    }

    #[tokio::test]
    async fn test_select_execution_path_uses_stats_and_affinity() {
        let (memory, _) = memory();
        let agents = vec!["a".to_string(), "b".to_string()];
        for _ in 0..5 {
            memory.record_execution_metric("f", "a", false, 50);
            memory.record_execution_metric("f", "b", true, 50);
        }
        let ranked = memory.select_execution_path("f", &json!({}), &agents, None).await;
        assert_eq!(ranked[0].agent_name, "b");
        assert!(ranked[1].score < 0.5);

        memory
            .record_tool_call(ToolCallRecord::new("g", json!({"x": 1}), json!(1), "a"))
            .await;
        let ranked = memory.select_execution_path("g", &json!({"x": 1}), &agents, None).await;
        assert_eq!(ranked[0].agent_name, "a");
        assert!(ranked[0].affinity);
    }

    #[tokio::test]
    async fn test_path_stats_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            semantic_path: Some(dir.path().to_path_buf()),
            ..MemoryConfig::default()
        };
        {
            let memory = MemorySystem::new(config.clone(), Arc::new(ManualClock::default())).unwrap();
            memory.record_execution_metric("f", "a", true, 10);
            memory.shutdown().await;
        }
        let memory = MemorySystem::new(config, Arc::new(ManualClock::default())).unwrap();
        assert_eq!(memory.path_stats("f")["a"].successes, 1);
    }

    #[tokio::test]
    async fn test_sweep_and_clear() {
        let (memory, clock) = memory();
        memory
            .record_tool_call(ToolCallRecord::new("f", json!({}), json!(1), "a"))
            .await;
        clock.advance(Duration::from_secs(301));
        assert_eq!(memory.sweep_expired().await, 1);

        memory
            .record_tool_call(ToolCallRecord::new("f", json!({}), json!(1), "a"))
            .await;
        memory.clear().await;
        assert_eq!(memory.stats().await.layer(LayerKind::ShortTerm).unwrap().entries, 0);
    }
}
