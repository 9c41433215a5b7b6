//! Execution metrics: the bounded append-only log kept by the orchestrator and
//! the performance report built from it. With `with-metrics`, each record is also
//! emitted through the `metrics` facade.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::agent::{AgentKind, PerformanceSnapshot, ResourceUsage};
use crate::memory::LayerKind;

/// One agent invocation, successful or not.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionMetric {
    pub request_id: Uuid,
    pub agent_name: String,
    pub function_name: String,
    pub exec_time_ms: u64,
    pub success: bool,
    pub cached: Option<LayerKind>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate over every metric ever recorded for one function.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FunctionTotals {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub total_exec_ms: u64,
}

impl FunctionTotals {
    fn add(&mut self, metric: &ExecutionMetric) {
        self.executions += 1;
        if metric.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if metric.cached.is_some() {
            self.cache_hits += 1;
        }
        self.total_exec_ms = self.total_exec_ms.saturating_add(metric.exec_time_ms);
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }

    pub fn average_exec_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_exec_ms as f64 / self.executions as f64
        }
    }
}

/// Append-only metric log keeping the most recent `capacity` entries.
/// Totals cover the whole lifetime, including entries already dropped.
pub struct MetricsLog {
    capacity: usize,
    inner: Mutex<LogInner>,
}

#[derive(Default)]
struct LogInner {
    recent: VecDeque<ExecutionMetric>,
    totals: BTreeMap<String, FunctionTotals>,
    per_agent: BTreeMap<String, FunctionTotals>,
}

impl MetricsLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LogInner::default()),
        }
    }

    pub fn record(&self, metric: ExecutionMetric) {
        emit(&metric);
        let mut inner = self.inner.lock();
        inner
            .totals
            .entry(metric.function_name.clone())
            .or_default()
            .add(&metric);
        inner
            .per_agent
            .entry(metric.agent_name.clone())
            .or_default()
            .add(&metric);
        if inner.recent.len() == self.capacity {
            inner.recent.pop_front();
        }
        inner.recent.push_back(metric);
    }

    /// Most recent metrics, oldest first, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<ExecutionMetric> {
        let inner = self.inner.lock();
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn function_totals(&self) -> BTreeMap<String, FunctionTotals> {
        self.inner.lock().totals.clone()
    }

    pub fn agent_totals(&self) -> BTreeMap<String, FunctionTotals> {
        self.inner.lock().per_agent.clone()
    }

    pub fn clear(&self) {
        *self.inner.lock() = LogInner::default();
    }
}

#[cfg(feature = "with-metrics")]
fn emit(metric: &ExecutionMetric) {
    let outcome = if metric.success { "success" } else { "failure" };
    metrics::counter!(
        "routing_engine_executions_total",
        "function" => metric.function_name.clone(),
        "agent" => metric.agent_name.clone(),
        "outcome" => outcome
    )
    .increment(1);
    if let Some(layer) = metric.cached {
        metrics::counter!("routing_engine_cache_hits_total", "layer" => layer.as_str()).increment(1);
    }
    metrics::histogram!(
        "routing_engine_execution_ms",
        "function" => metric.function_name.clone()
    )
    .record(metric.exec_time_ms as f64);
}

#[cfg(not(feature = "with-metrics"))]
fn emit(_metric: &ExecutionMetric) {}

/// Per-agent section of the performance report.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub kind: AgentKind,
    pub resource_usage: ResourceUsage,
    pub totals: FunctionTotals,
    pub functions: HashMap<String, PerformanceSnapshot>,
}

/// Engine-wide performance snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub total_executions: u64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub average_exec_ms: f64,
    pub agents: BTreeMap<String, AgentReport>,
    pub functions: BTreeMap<String, FunctionTotals>,
}

impl PerformanceReport {
    pub fn new(functions: BTreeMap<String, FunctionTotals>, agents: BTreeMap<String, AgentReport>) -> Self {
        let mut overall = FunctionTotals::default();
        for totals in functions.values() {
            overall.executions += totals.executions;
            overall.successes += totals.successes;
            overall.failures += totals.failures;
            overall.cache_hits += totals.cache_hits;
            overall.total_exec_ms = overall.total_exec_ms.saturating_add(totals.total_exec_ms);
        }
        let cache_hit_rate = if overall.executions == 0 {
            0.0
        } else {
            overall.cache_hits as f64 / overall.executions as f64
        };
        Self {
            generated_at: Utc::now(),
            total_executions: overall.executions,
            success_rate: overall.success_rate(),
            cache_hit_rate,
            average_exec_ms: overall.average_exec_ms(),
            agents,
            functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(function: &str, agent: &str, success: bool, ms: u64) -> ExecutionMetric {
        ExecutionMetric {
            request_id: Uuid::new_v4(),
            agent_name: agent.to_string(),
            function_name: function.to_string(),
            exec_time_ms: ms,
            success,
            cached: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_log_is_bounded_but_totals_are_not() {
        let log = MetricsLog::new(3);
        for i in 0..5 {
            log.record(metric("f", "a", i != 2, 10));
        }
        assert_eq!(log.len(), 3);
        let totals = log.function_totals();
        assert_eq!(totals["f"].executions, 5);
        assert_eq!(totals["f"].failures, 1);
        assert_eq!(log.recent(2).len(), 2);
    }

    #[test]
    fn test_report_aggregates_functions() {
        let log = MetricsLog::new(10);
        log.record(metric("f", "a", true, 10));
        log.record(metric("g", "a", false, 30));
        let report = PerformanceReport::new(log.function_totals(), BTreeMap::new());
        assert_eq!(report.total_executions, 2);
        assert!((report.success_rate - 0.5).abs() < 1e-9);
        assert!((report.average_exec_ms - 20.0).abs() < 1e-9);
    }
}
