use crate::memory::{LayerKind, MemorySystem, ToolCallRecord};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Samples kept in each rolling performance window.
pub const PERFORMANCE_WINDOW: usize = 50;
/// Successful contexts remembered per function for context scoring.
pub const CONTEXT_HISTORY: usize = 50;

/// Specialization of an agent. Drives cache and memory policies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Navigation,
    Analysis,
    Data,
    External,
    Plugin,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigation => "navigation",
            Self::Analysis => "analysis",
            Self::Data => "data",
            Self::External => "external",
            Self::Plugin => "plugin",
        }
    }

    /// Calls made by this kind leave the process.
    pub fn crosses_network(&self) -> bool {
        matches!(self, Self::External)
    }

    /// Plugin calls may have side effects, so their results are not replayed.
    pub fn reuses_cached_results(&self) -> bool {
        !matches!(self, Self::Plugin)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-reported load, each dimension in [0, 1].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
}

impl ResourceUsage {
    pub fn new(cpu: f64, memory: f64, network: f64) -> Self {
        Self { cpu, memory, network }.clamped()
    }

    pub fn clamped(self) -> Self {
        let clamp = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        Self {
            cpu: clamp(self.cpu),
            memory: clamp(self.memory),
            network: clamp(self.network),
        }
    }

    pub fn peak(&self) -> f64 {
        self.cpu.max(self.memory).max(self.network)
    }

    /// `1 - peak`, the resource term of the agent score.
    pub fn availability(&self) -> f64 {
        (1.0 - self.peak()).clamp(0.0, 1.0)
    }
}

/// Outcome of a capability check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityCheck {
    pub can_execute: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CapabilityCheck {
    pub fn allowed() -> Self {
        Self {
            can_execute: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            can_execute: false,
            reason: Some(reason.into()),
        }
    }
}

/// Per-request data handed to executors.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    pub features: Option<Value>,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(features: Option<Value>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            features,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn child(&self) -> Self {
        Self {
            request_id: self.request_id,
            features: self.features.clone(),
            cancellation: self.cancellation.child_token(),
        }
    }
}

/// The work an agent delegates to. Knows nothing of scoring, caching or retries.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, function_name: &str, parameters: &Value, context: &ExecutionContext) -> Result<Value>;
}

/// Executor backed by an async closure over the function name and parameters.
pub struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn execute(&self, function_name: &str, parameters: &Value, _context: &ExecutionContext) -> Result<Value> {
        (self.f)(function_name.to_string(), parameters.clone()).await
    }
}

pub fn executor_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(String, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub value: Value,
    /// Layer that served the value when it came from memory.
    pub cached: Option<LayerKind>,
    pub exec_time_ms: u64,
    pub parameters_adjusted: bool,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    success: bool,
    exec_time_ms: u64,
}

/// Rolling performance of one agent on one function.
#[derive(Debug, Clone, Default)]
pub struct FunctionPerformance {
    pub success_count: u64,
    pub failure_count: u64,
    pub cache_hits: u64,
    window: VecDeque<Sample>,
    successful_contexts: VecDeque<Value>,
}

impl FunctionPerformance {
    pub fn record(&mut self, success: bool, exec_time_ms: u64, context: Option<&Value>) {
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        if self.window.len() == PERFORMANCE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(Sample { success, exec_time_ms });

        if let (true, Some(context)) = (success, context) {
            if self.successful_contexts.len() == CONTEXT_HISTORY {
                self.successful_contexts.pop_front();
            }
            self.successful_contexts.push_back(context.clone());
        }
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn recent_success_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let successes = self.window.iter().filter(|s| s.success).count();
        Some(successes as f64 / self.window.len() as f64)
    }

    pub fn average_exec_ms(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let total: u64 = self.window.iter().map(|s| s.exec_time_ms).sum();
        Some(total as f64 / self.window.len() as f64)
    }

    pub fn successful_contexts(&self) -> impl Iterator<Item = &Value> {
        self.successful_contexts.iter()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            success_count: self.success_count,
            failure_count: self.failure_count,
            cache_hits: self.cache_hits,
            window_samples: self.window.len(),
            recent_success_rate: self.recent_success_rate(),
            average_exec_ms: self.average_exec_ms(),
        }
    }
}

/// Serializable view of [`FunctionPerformance`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformanceSnapshot {
    pub success_count: u64,
    pub failure_count: u64,
    pub cache_hits: u64,
    pub window_samples: usize,
    pub recent_success_rate: Option<f64>,
    pub average_exec_ms: Option<f64>,
}

/// Listing entry for a registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub primary_capabilities: Vec<String>,
    pub resource_usage: ResourceUsage,
}

/// An executor that can be routed to by the orchestrator.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> AgentKind;
    fn capabilities(&self) -> Vec<String>;
    fn primary_capabilities(&self) -> Vec<String>;

    /// Pure check; never touches memory or the executor.
    fn can_execute(&self, function_name: &str, parameters: &Value) -> CapabilityCheck;

    fn is_primary(&self, function_name: &str) -> bool {
        self.primary_capabilities().iter().any(|c| c == function_name)
    }

    async fn execute_function(
        &self,
        function_name: &str,
        parameters: &Value,
        context: &ExecutionContext,
    ) -> Result<AgentOutput>;

    fn resource_usage(&self) -> ResourceUsage;
    fn update_resource_usage(&self, usage: ResourceUsage);

    fn function_performance(&self, function_name: &str) -> Option<FunctionPerformance>;
    fn performance(&self) -> HashMap<String, PerformanceSnapshot>;

    fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            capabilities: self.capabilities(),
            primary_capabilities: self.primary_capabilities(),
            resource_usage: self.resource_usage(),
        }
    }
}

/// Which functions may be answered from memory.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub reuse: bool,
    pub no_cache: HashSet<String>,
}

impl CachePolicy {
    pub fn for_kind(kind: AgentKind) -> Self {
        Self {
            reuse: kind.reuses_cached_results(),
            no_cache: HashSet::new(),
        }
    }

    pub fn allows_reuse(&self, function_name: &str) -> bool {
        self.reuse && !self.no_cache.contains(function_name)
    }
}

/// Everything needed to build an agent inside the orchestrator.
pub struct AgentRegistration {
    pub name: String,
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    pub primary_capabilities: Vec<String>,
    pub required_parameters: HashMap<String, Vec<String>>,
    pub no_cache: Vec<String>,
    pub reuse_cached_results: Option<bool>,
    pub timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub executor: Arc<dyn Executor>,
}

impl AgentRegistration {
    pub fn new(name: impl Into<String>, kind: AgentKind, executor: Arc<dyn Executor>) -> Self {
        Self {
            name: name.into(),
            kind,
            capabilities: Vec::new(),
            primary_capabilities: Vec::new(),
            required_parameters: HashMap::new(),
            no_cache: Vec::new(),
            reuse_cached_results: None,
            timeout: None,
            max_concurrency: None,
            executor,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Primary capabilities are added to the capability set if missing.
    pub fn with_primary_capabilities<I, S>(mut self, primary: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_capabilities = primary.into_iter().map(Into::into).collect();
        for p in &self.primary_capabilities {
            if !self.capabilities.contains(p) {
                self.capabilities.push(p.clone());
            }
        }
        self
    }

    pub fn require_parameters<I, S>(mut self, function_name: impl Into<String>, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_parameters
            .insert(function_name.into(), parameters.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_no_cache<I, S>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.no_cache = functions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cache_reuse(mut self, reuse: bool) -> Self {
        self.reuse_cached_results = Some(reuse);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }
}

/// Standard agent: declared capabilities, memory-aware execution, rolling
/// performance tracking and a load-based resource self-report.
pub struct AgentBase {
    name: String,
    kind: AgentKind,
    capabilities: Vec<String>,
    primary_capabilities: Vec<String>,
    required_parameters: HashMap<String, Vec<String>>,
    cache_policy: CachePolicy,
    timeout: Duration,
    max_concurrency: usize,
    executor: Arc<dyn Executor>,
    memory: Arc<MemorySystem>,
    performance: RwLock<HashMap<String, FunctionPerformance>>,
    resources: RwLock<ResourceUsage>,
    in_flight: AtomicUsize,
}

impl AgentBase {
    pub fn new(registration: AgentRegistration, memory: Arc<MemorySystem>, default_timeout: Duration) -> Self {
        let mut cache_policy = CachePolicy::for_kind(registration.kind);
        if let Some(reuse) = registration.reuse_cached_results {
            cache_policy.reuse = reuse;
        }
        cache_policy.no_cache.extend(registration.no_cache);

        Self {
            name: registration.name,
            kind: registration.kind,
            capabilities: registration.capabilities,
            primary_capabilities: registration.primary_capabilities,
            required_parameters: registration.required_parameters,
            cache_policy,
            timeout: registration.timeout.unwrap_or(default_timeout),
            max_concurrency: registration.max_concurrency.unwrap_or(4).max(1),
            executor: registration.executor,
            memory,
            performance: RwLock::new(HashMap::new()),
            resources: RwLock::new(ResourceUsage::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache_policy
    }

    fn record(&self, function_name: &str, success: bool, exec_time_ms: u64, context: Option<&Value>) {
        let mut performance = self.performance.write();
        performance
            .entry(function_name.to_string())
            .or_default()
            .record(success, exec_time_ms, context);
    }

    /// Load reported as the share of concurrent slots in use. Memory pressure is
    /// left to external reporters.
    fn report_load(&self) {
        let load = self.in_flight.load(Ordering::Relaxed) as f64 / self.max_concurrency as f64;
        let mut resources = self.resources.write();
        resources.cpu = load;
        if self.kind.crosses_network() {
            resources.network = load;
        }
        *resources = resources.clamped();
    }

    async fn run_executor(&self, function_name: &str, parameters: &Value, context: &ExecutionContext) -> Result<Value> {
        let scoped = context.child();
        let outcome = tokio::select! {
            result = tokio::time::timeout(self.timeout, self.executor.execute(function_name, parameters, &scoped)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(anyhow!("agent '{}' timed out after {:?}", self.name, self.timeout)),
                }
            }
            _ = context.cancellation.cancelled() => Err(anyhow!("execution cancelled")),
        };
        if outcome.is_err() {
            scoped.cancellation.cancel();
        }
        outcome
    }
}

struct InFlight<'a>(&'a AgentBase);

impl<'a> InFlight<'a> {
    fn enter(agent: &'a AgentBase) -> Self {
        agent.in_flight.fetch_add(1, Ordering::Relaxed);
        agent.report_load();
        Self(agent)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.0.report_load();
    }
}

#[async_trait]
impl Capability for AgentBase {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn primary_capabilities(&self) -> Vec<String> {
        self.primary_capabilities.clone()
    }

    fn can_execute(&self, function_name: &str, parameters: &Value) -> CapabilityCheck {
        if !self.capabilities.iter().any(|c| c == function_name) {
            return CapabilityCheck::denied(format!("'{}' is not a capability of {}", function_name, self.name));
        }
        if let Some(required) = self.required_parameters.get(function_name) {
            let missing: Vec<&str> = required
                .iter()
                .filter(|p| parameters.get(p.as_str()).map_or(true, Value::is_null))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return CapabilityCheck::denied(format!("missing required parameter(s): {}", missing.join(", ")));
            }
        }
        CapabilityCheck::allowed()
    }

    fn is_primary(&self, function_name: &str) -> bool {
        self.primary_capabilities.iter().any(|c| c == function_name)
    }

    #[instrument(skip(self, parameters, context), fields(agent = %self.name, request_id = %context.request_id))]
    async fn execute_function(
        &self,
        function_name: &str,
        parameters: &Value,
        context: &ExecutionContext,
    ) -> Result<AgentOutput> {
        let check = self.can_execute(function_name, parameters);
        if !check.can_execute {
            return Err(anyhow!(check.reason.unwrap_or_else(|| "cannot execute".to_string())));
        }

        let features = context.features.as_ref();
        // Agents that never replay results must not touch memory counters or promote entries.
        let cached = if self.cache_policy.allows_reuse(function_name) {
            self.memory.retrieve_memory_context(function_name, parameters, features).await
        } else {
            None
        };
        if let Some(hit) = cached {
            self.performance
                .write()
                .entry(function_name.to_string())
                .or_default()
                .record_cache_hit();
            debug!(layer = %hit.layer, "Answered from memory");
            return Ok(AgentOutput {
                value: hit.value,
                cached: Some(hit.layer),
                exec_time_ms: 0,
                parameters_adjusted: false,
            });
        }

        let optimized = self
            .memory
            .optimize_parameters(function_name, parameters, features)
            .await;

        let started = Instant::now();
        let outcome = {
            let _slot = InFlight::enter(self);
            self.run_executor(function_name, &optimized.parameters, context).await
        };
        let exec_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                self.record(function_name, true, exec_time_ms, features);
                let record = ToolCallRecord::new(function_name, parameters.clone(), value.clone(), self.name.clone())
                    .with_exec_time(exec_time_ms)
                    .with_context(context.features.clone())
                    .crossed_network(self.kind.crosses_network());
                self.memory.record_tool_call(record).await;
                Ok(AgentOutput {
                    value,
                    cached: None,
                    exec_time_ms,
                    parameters_adjusted: optimized.adjusted,
                })
            }
            Err(e) => {
                self.record(function_name, false, exec_time_ms, None);
                warn!("Agent {} failed on {}: {}", self.name, function_name, e);
                Err(e)
            }
        }
    }

    fn resource_usage(&self) -> ResourceUsage {
        *self.resources.read()
    }

    fn update_resource_usage(&self, usage: ResourceUsage) {
        *self.resources.write() = usage.clamped();
    }

    fn function_performance(&self, function_name: &str) -> Option<FunctionPerformance> {
        self.performance.read().get(function_name).cloned()
    }

    fn performance(&self) -> HashMap<String, PerformanceSnapshot> {
        self.performance
            .read()
            .iter()
            .map(|(f, p)| (f.clone(), p.snapshot()))
            .collect()
    }
}
