//! Core coordinator that scores registered agents, dispatches function calls,
//! retries on failure and defers work while every capable agent is saturated.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentBase, AgentRegistration, AgentSummary, Capability, ExecutionContext};
use crate::clock::{Clock, SystemClock};
use crate::error::{AttemptFailure, EngineError, ResourceSnapshot};
use crate::events::{EngineEvent, EventChannel, EventObserver};
use crate::memory::{LayerKind, MemoryKey, MemoryStats, MemorySystem};
use crate::metrics::{AgentReport, ExecutionMetric, MetricsLog, PerformanceReport};
use crate::scoring::{calculate_agent_score, ScoreBreakdown, ScoringInput};
use crate::settings::{OrchestratorConfig, ScoringConfig, Settings};

/// Successful outcome of `execute_function`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub function_name: String,
    pub agent_name: String,
    pub value: Value,
    pub cached: Option<LayerKind>,
    pub exec_time_ms: u64,
    pub attempts: u32,
    pub deferrals: usize,
    pub parameters_adjusted: bool,
    pub score: f64,
}

/// The winning agent of a selection round, with every candidate's breakdown.
#[derive(Clone)]
pub struct SelectedAgent {
    pub agent: Arc<dyn Capability>,
    pub score: ScoreBreakdown,
    pub ranking: Vec<ScoreBreakdown>,
}

impl std::fmt::Debug for SelectedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedAgent")
            .field("agent", &self.agent.name())
            .field("score", &self.score)
            .finish()
    }
}

type SharedOutcome = Option<Result<ExecutionResult, EngineError>>;

enum Coalesced<'a> {
    Leader(watch::Sender<SharedOutcome>, InFlightSlot<'a>),
    Follower(watch::Receiver<SharedOutcome>),
}

/// Removes the in-flight entry when the leading request finishes or is dropped.
struct InFlightSlot<'a> {
    in_flight: &'a Mutex<HashMap<MemoryKey, watch::Receiver<SharedOutcome>>>,
    key: MemoryKey,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Multi-agent router and scheduler.
pub struct MultiAgentSystem {
    config: OrchestratorConfig,
    weights: ScoringConfig,
    agents: RwLock<Vec<Arc<dyn Capability>>>,
    memory: Arc<MemorySystem>,
    metrics: MetricsLog,
    events: EventChannel,
    in_flight: Mutex<HashMap<MemoryKey, watch::Receiver<SharedOutcome>>>,
}

impl MultiAgentSystem {
    pub fn new(settings: &Settings) -> Result<Self, EngineError> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    #[instrument(skip_all)]
    pub fn with_clock(settings: &Settings, clock: Arc<dyn Clock>) -> Result<Self, EngineError> {
        settings
            .validate()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let memory = Arc::new(MemorySystem::new(settings.memory.clone(), clock)?);

        info!(
            "Routing engine initialized (max_attempts={}, resource_floor={})",
            settings.orchestrator.max_attempts, settings.orchestrator.resource_floor
        );

        Ok(Self {
            config: settings.orchestrator.clone(),
            weights: settings.scoring,
            agents: RwLock::new(Vec::new()),
            memory,
            metrics: MetricsLog::new(settings.orchestrator.metric_history),
            events: EventChannel::new(settings.orchestrator.event_channel_capacity),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Build a standard agent around `registration` and register it.
    pub fn register_agent(&self, registration: AgentRegistration) -> Result<(), EngineError> {
        let agent = AgentBase::new(
            registration,
            self.memory.clone(),
            Duration::from_secs(self.config.agent_timeout_seconds),
        );
        self.register(Arc::new(agent))
    }

    /// Register a custom capability. Names must be unique.
    pub fn register(&self, agent: Arc<dyn Capability>) -> Result<(), EngineError> {
        let name = agent.name().to_string();
        if name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("agent name cannot be empty".to_string()));
        }
        let mut agents = self.agents.write();
        if agents.iter().any(|a| a.name() == name) {
            return Err(EngineError::DuplicateAgent(name));
        }
        if agent.capabilities().is_empty() {
            warn!("Agent '{}' declares no capabilities", name);
        }
        info!("Registering {} agent: {}", agent.kind(), name);
        agents.push(agent);
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.agents.read().iter().find(|a| a.name() == name).cloned()
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.agents.read().iter().map(|a| a.summary()).collect()
    }

    pub fn memory(&self) -> &Arc<MemorySystem> {
        &self.memory
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn observe(&self, observer: Arc<dyn EventObserver>) {
        self.events.observe(observer);
    }

    /// Start background maintenance.
    pub fn start(&self) {
        self.memory.start_sweeper();
    }

    /// Stop background maintenance and flush persistent memory.
    pub async fn shutdown(&self) {
        self.memory.shutdown().await;
        info!("Routing engine stopped");
    }

    fn capable_agents(&self, function_name: &str, parameters: &Value, excluded: &HashSet<String>) -> Vec<Arc<dyn Capability>> {
        self.agents
            .read()
            .iter()
            .filter(|a| !excluded.contains(a.name()))
            .filter(|a| a.can_execute(function_name, parameters).can_execute)
            .cloned()
            .collect()
    }

    /// Score every capable agent and return the best. Ties go to the agent
    /// registered first.
    pub async fn select_optimal_agent(
        &self,
        function_name: &str,
        parameters: &Value,
        context: Option<&Value>,
    ) -> Result<SelectedAgent, EngineError> {
        let candidates = self.capable_agents(function_name, parameters, &HashSet::new());
        self.select_among(function_name, parameters, context, &candidates).await
    }

    async fn select_among(
        &self,
        function_name: &str,
        parameters: &Value,
        context: Option<&Value>,
        candidates: &[Arc<dyn Capability>],
    ) -> Result<SelectedAgent, EngineError> {
        if candidates.is_empty() {
            return Err(EngineError::AgentNotFound {
                function_name: function_name.to_string(),
            });
        }

        let names: Vec<String> = candidates.iter().map(|a| a.name().to_string()).collect();
        let paths: HashMap<String, f64> = self
            .memory
            .select_execution_path(function_name, parameters, &names, context)
            .await
            .into_iter()
            .map(|c| (c.agent_name, c.score))
            .collect();

        let refs: Vec<&dyn Capability> = candidates.iter().map(|a| a.as_ref()).collect();
        let input = ScoringInput::new(function_name, context, &refs);

        let ranking: Vec<ScoreBreakdown> = refs
            .iter()
            .map(|agent| calculate_agent_score(&self.weights, &input, *agent, paths.get(agent.name()).copied()))
            .collect();

        let mut best = 0;
        for (i, score) in ranking.iter().enumerate().skip(1) {
            if score.total > ranking[best].total {
                best = i;
            }
        }

        debug!(
            agent = %ranking[best].agent_name,
            score = ranking[best].total,
            candidates = ranking.len(),
            "Selected agent"
        );
        Ok(SelectedAgent {
            agent: candidates[best].clone(),
            score: ranking[best].clone(),
            ranking,
        })
    }

    /// Route one call to the best capable agent.
    pub async fn execute_function(
        &self,
        function_name: &str,
        parameters: Value,
        context: Option<Value>,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute_with_context(function_name, parameters, ExecutionContext::new(context))
            .await
    }

    /// Like [`execute_function`](Self::execute_function), but gives up after
    /// `timeout` and cancels the request's token.
    pub async fn execute_with_timeout(
        &self,
        function_name: &str,
        parameters: Value,
        context: Option<Value>,
        timeout: Duration,
    ) -> Result<ExecutionResult, EngineError> {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(context).with_cancellation(token.clone());
        match tokio::time::timeout(timeout, self.execute_with_context(function_name, parameters, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                warn!("Execution of '{}' timed out after {:?}", function_name, timeout);
                Err(EngineError::Timeout {
                    function_name: function_name.to_string(),
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    #[instrument(skip(self, parameters, context), fields(request_id = %context.request_id))]
    pub async fn execute_with_context(
        &self,
        function_name: &str,
        parameters: Value,
        context: ExecutionContext,
    ) -> Result<ExecutionResult, EngineError> {
        if function_name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("function name cannot be empty".to_string()));
        }

        if !self.config.coalesce_in_flight {
            return self.dispatch(function_name, &parameters, &context).await;
        }

        let key = MemoryKey::for_call(function_name, &parameters);
        match self.join_or_lead(key) {
            Coalesced::Leader(tx, _slot) => {
                let result = self.dispatch(function_name, &parameters, &context).await;
                let _ = tx.send(Some(result.clone()));
                result
            }
            Coalesced::Follower(mut rx) => {
                loop {
                    let shared = rx.borrow().clone();
                    if let Some(result) = shared {
                        debug!("Joined in-flight execution");
                        return result.map(|r| ExecutionResult {
                            request_id: context.request_id,
                            ..r
                        });
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                debug!("In-flight leader went away, executing independently");
                self.dispatch(function_name, &parameters, &context).await
            }
        }
    }

    fn join_or_lead(&self, key: MemoryKey) -> Coalesced<'_> {
        let mut in_flight = self.in_flight.lock();
        if let Some(rx) = in_flight.get(&key) {
            return Coalesced::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.clone(), rx);
        Coalesced::Leader(
            tx,
            InFlightSlot {
                in_flight: &self.in_flight,
                key,
            },
        )
    }

    async fn dispatch(
        &self,
        function_name: &str,
        parameters: &Value,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult, EngineError> {
        let features = context.features.as_ref();
        let schedule = self.config.backoff_schedule();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut failures: Vec<AttemptFailure> = Vec::new();
        let mut deferrals = 0usize;

        for attempt in 1..=self.config.max_attempts {
            let candidates = loop {
                let candidates = self.capable_agents(function_name, parameters, &excluded);
                if candidates.is_empty() || !self.saturated(&candidates) {
                    break candidates;
                }
                let Some(delay) = schedule.get(deferrals).copied() else {
                    let snapshot = Self::snapshot(&candidates);
                    warn!(
                        "Every capable agent for '{}' is saturated after {} deferral(s)",
                        function_name, deferrals
                    );
                    return Err(EngineError::ResourceExhausted {
                        function_name: function_name.to_string(),
                        deferrals,
                        snapshot,
                    });
                };
                deferrals += 1;
                debug!(deferral = deferrals, ?delay, "Deferring saturated request");
                self.events.publish(EngineEvent::Deferred {
                    request_id: context.request_id,
                    function_name: function_name.to_string(),
                    deferral: deferrals,
                    delay_ms: delay.as_millis() as u64,
                    timestamp: Utc::now(),
                });
                tokio::time::sleep(delay).await;
            };

            if candidates.is_empty() {
                if failures.is_empty() {
                    return Err(EngineError::AgentNotFound {
                        function_name: function_name.to_string(),
                    });
                }
                break;
            }

            let selected = self
                .select_among(function_name, parameters, features, &candidates)
                .await?;
            let agent = selected.agent;
            let agent_name = agent.name().to_string();

            self.events.publish(EngineEvent::Start {
                request_id: context.request_id,
                function_name: function_name.to_string(),
                agent_name: agent_name.clone(),
                attempt,
                score: selected.score.total,
                timestamp: Utc::now(),
            });

            let started = std::time::Instant::now();
            match agent.execute_function(function_name, parameters, context).await {
                Ok(output) => {
                    self.metrics.record(ExecutionMetric {
                        request_id: context.request_id,
                        agent_name: agent_name.clone(),
                        function_name: function_name.to_string(),
                        exec_time_ms: output.exec_time_ms,
                        success: true,
                        cached: output.cached,
                        timestamp: Utc::now(),
                    });
                    if output.cached.is_none() {
                        self.memory
                            .record_execution_metric(function_name, &agent_name, true, output.exec_time_ms);
                    }
                    self.events.publish(EngineEvent::Success {
                        request_id: context.request_id,
                        function_name: function_name.to_string(),
                        agent_name: agent_name.clone(),
                        exec_time_ms: output.exec_time_ms,
                        cached: output.cached,
                        timestamp: Utc::now(),
                    });
                    info!(agent = %agent_name, attempt, cached = output.cached.is_some(), "Execution succeeded");

                    return Ok(ExecutionResult {
                        request_id: context.request_id,
                        function_name: function_name.to_string(),
                        agent_name,
                        value: output.value,
                        cached: output.cached,
                        exec_time_ms: output.exec_time_ms,
                        attempts: attempt,
                        deferrals,
                        parameters_adjusted: output.parameters_adjusted,
                        score: selected.score.total,
                    });
                }
                Err(e) => {
                    let exec_time_ms = started.elapsed().as_millis() as u64;
                    self.metrics.record(ExecutionMetric {
                        request_id: context.request_id,
                        agent_name: agent_name.clone(),
                        function_name: function_name.to_string(),
                        exec_time_ms,
                        success: false,
                        cached: None,
                        timestamp: Utc::now(),
                    });
                    self.memory
                        .record_execution_metric(function_name, &agent_name, false, exec_time_ms);

                    let failure = AttemptFailure {
                        agent_name: agent_name.clone(),
                        error: format!("{:#}", e),
                    };
                    warn!(agent = %agent_name, attempt, error = %failure.error, "Execution attempt failed");
                    excluded.insert(agent_name);
                    let terminal = attempt == self.config.max_attempts
                        || self.capable_agents(function_name, parameters, &excluded).is_empty();
                    self.events.publish(EngineEvent::Failure {
                        request_id: context.request_id,
                        function_name: function_name.to_string(),
                        failure: failure.clone(),
                        attempt,
                        terminal,
                        timestamp: Utc::now(),
                    });
                    failures.push(failure);
                }
            }
        }

        Err(EngineError::AgentExecution {
            function_name: function_name.to_string(),
            attempts: failures,
        })
    }

    fn saturated(&self, candidates: &[Arc<dyn Capability>]) -> bool {
        candidates
            .iter()
            .all(|a| a.resource_usage().availability() < self.config.resource_floor)
    }

    fn snapshot(candidates: &[Arc<dyn Capability>]) -> Vec<ResourceSnapshot> {
        candidates
            .iter()
            .map(|a| {
                let usage = a.resource_usage();
                ResourceSnapshot {
                    agent_name: a.name().to_string(),
                    usage,
                    resource_score: usage.availability(),
                }
            })
            .collect()
    }

    pub fn get_performance_report(&self) -> PerformanceReport {
        let agent_totals = self.metrics.agent_totals();
        let agents: BTreeMap<String, AgentReport> = self
            .agents
            .read()
            .iter()
            .map(|a| {
                let name = a.name().to_string();
                let report = AgentReport {
                    kind: a.kind(),
                    resource_usage: a.resource_usage(),
                    totals: agent_totals.get(&name).cloned().unwrap_or_default(),
                    functions: a.performance(),
                };
                (name, report)
            })
            .collect();
        PerformanceReport::new(self.metrics.function_totals(), agents)
    }

    pub async fn get_memory_stats(&self) -> MemoryStats {
        self.memory.stats().await
    }

    pub fn recent_metrics(&self, limit: usize) -> Vec<ExecutionMetric> {
        self.metrics.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{executor_fn, AgentKind, ResourceUsage};
    use crate::clock::ManualClock;
    use anyhow::anyhow;
    use serde_json::json;

    fn engine() -> MultiAgentSystem {
        MultiAgentSystem::with_clock(&Settings::default(), Arc::new(ManualClock::default())).unwrap()
    }

    fn echo(name: &str, kind: AgentKind, functions: &[&str]) -> AgentRegistration {
        AgentRegistration::new(
            name,
            kind,
            executor_fn(|function, params| async move { Ok(json!({"function": function, "params": params})) }),
        )
        .with_capabilities(functions.iter().copied())
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let engine = engine();
        engine.register_agent(echo("a", AgentKind::Data, &["f"])).unwrap();
        let err = engine.register_agent(echo("a", AgentKind::Data, &["g"])).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAgent(name) if name == "a"));
        assert_eq!(engine.list_agents().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_function_name_is_invalid() {
        let engine = engine();
        let err = engine.execute_function("  ", json!({}), None).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn test_unknown_function_is_not_found() {
        let engine = engine();
        engine.register_agent(echo("a", AgentKind::Data, &["f"])).unwrap();
        let err = engine.execute_function("g", json!({}), None).await.unwrap_err();
        assert!(matches!(err, EngineError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_primary_agent_preferred_and_ties_keep_registration_order() {
        let engine = engine();
        engine.register_agent(echo("first", AgentKind::Data, &["f"])).unwrap();
        engine.register_agent(echo("second", AgentKind::Data, &["f"])).unwrap();
        let selected = engine.select_optimal_agent("f", &json!({}), None).await.unwrap();
        assert_eq!(selected.agent.name(), "first");

        engine
            .register_agent(echo("specialist", AgentKind::Analysis, &["f"]).with_primary_capabilities(["f"]))
            .unwrap();
        let selected = engine.select_optimal_agent("f", &json!({}), None).await.unwrap();
        assert_eq!(selected.agent.name(), "specialist");
        assert_eq!(selected.ranking.len(), 3);
    }

    #[tokio::test]
    async fn test_busy_agent_loses_to_idle_one() {
        let engine = engine();
        engine.register_agent(echo("busy", AgentKind::Data, &["f"])).unwrap();
        engine.register_agent(echo("idle", AgentKind::Data, &["f"])).unwrap();
        engine
            .agent("busy")
            .unwrap()
            .update_resource_usage(ResourceUsage::new(0.8, 0.2, 0.0));
        let selected = engine.select_optimal_agent("f", &json!({}), None).await.unwrap();
        assert_eq!(selected.agent.name(), "idle");
    }

    #[tokio::test]
    async fn test_all_attempts_fail_reports_every_agent() {
        let engine = engine();
        for name in ["a", "b"] {
            engine
                .register_agent(
                    AgentRegistration::new(
                        name,
                        AgentKind::External,
                        executor_fn(move |_, _| async move { Err(anyhow!("{} unavailable", name)) }),
                    )
                    .with_capabilities(["fetch"]),
                )
                .unwrap();
        }
        let err = engine.execute_function("fetch", json!({}), None).await.unwrap_err();
        match err {
            EngineError::AgentExecution { attempts, .. } => {
                let names: Vec<_> = attempts.iter().map(|a| a.agent_name.as_str()).collect();
                assert_eq!(names, vec!["a", "b"]);
                assert_eq!(attempts[0].error, "a unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.recent_metrics(10).len(), 2);
    }

    #[tokio::test]
    async fn test_events_follow_execution() {
        let engine = engine();
        engine.register_agent(echo("a", AgentKind::Data, &["f"])).unwrap();
        let mut rx = engine.subscribe();
        let result = engine.execute_function("f", json!({"x": 1}), None).await.unwrap();

        let start = rx.recv().await.unwrap();
        let success = rx.recv().await.unwrap();
        assert_eq!(start.topic(), "execution:start");
        assert_eq!(success.topic(), "execution:success");
        assert_eq!(success.request_id(), result.request_id);
    }

    #[tokio::test]
    async fn test_performance_report_counts_executions() {
        let engine = engine();
        engine.register_agent(echo("a", AgentKind::Data, &["f"])).unwrap();
        engine.execute_function("f", json!({"x": 1}), None).await.unwrap();
        engine.execute_function("f", json!({"x": 1}), None).await.unwrap();

        let report = engine.get_performance_report();
        assert_eq!(report.total_executions, 2);
        assert!((report.cache_hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(report.agents["a"].functions["f"].cache_hits, 1);
    }
}
