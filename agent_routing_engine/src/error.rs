//! Error taxonomy for routing and memory operations.

use serde::Serialize;
use thiserror::Error;

use crate::agent::ResourceUsage;

/// A single failed attempt against one agent.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AttemptFailure {
    pub agent_name: String,
    pub error: String,
}

/// Resource state of one agent at the moment backpressure gave up.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceSnapshot {
    pub agent_name: String,
    pub usage: ResourceUsage,
    pub resource_score: f64,
}

/// Errors surfaced by the engine to its callers.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no registered agent can execute '{function_name}'")]
    AgentNotFound { function_name: String },

    #[error("all {} attempt(s) to execute '{function_name}' failed: {}", .attempts.len(), format_attempts(.attempts))]
    AgentExecution {
        function_name: String,
        attempts: Vec<AttemptFailure>,
    },

    #[error("resources exhausted for '{function_name}' after {deferrals} deferral(s): {}", format_snapshot(.snapshot))]
    ResourceExhausted {
        function_name: String,
        deferrals: usize,
        snapshot: Vec<ResourceSnapshot>,
    },

    #[error("execution of '{function_name}' timed out after {after_ms}ms")]
    Timeout { function_name: String, after_ms: u64 },

    #[error("an agent named '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    MemoryLayer(#[from] MemoryLayerError),
}

impl EngineError {
    /// Stable machine-readable kind, used by the HTTP layer and in events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AgentNotFound { .. } => "agent_not_found",
            Self::AgentExecution { .. } => "agent_execution",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::DuplicateAgent(_) => "duplicate_agent",
            Self::Configuration(_) => "configuration",
            Self::MemoryLayer(_) => "memory_layer",
        }
    }
}

/// A failed read or write inside one memory layer.
///
/// These never reach `execute_function` callers: the memory facade logs them and
/// treats the operation as a miss or a no-op.
#[derive(Debug, Clone, Error)]
#[error("memory layer '{layer}' failed during {operation}: {message}")]
pub struct MemoryLayerError {
    pub layer: &'static str,
    pub operation: &'static str,
    pub message: String,
}

impl MemoryLayerError {
    pub fn new(layer: &'static str, operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self {
            layer,
            operation,
            message: err.to_string(),
        }
    }
}

fn format_attempts(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} -> {}", a.agent_name, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_snapshot(snapshot: &[ResourceSnapshot]) -> String {
    snapshot
        .iter()
        .map(|s| {
            format!(
                "{} (cpu={:.2}, memory={:.2}, network={:.2})",
                s.agent_name, s.usage.cpu, s.usage.memory, s.usage.network
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}
