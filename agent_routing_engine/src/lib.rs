//! Agent routing engine - core library
//!
//! Routes function calls to the best-scoring registered agent and remembers
//! results in a tiered memory (three LRU layers over a persistent semantic store).

pub mod agent;
pub mod batch;
pub mod builtin;
pub mod cli;
pub mod clock;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod scoring;
pub mod server;
pub mod settings;
pub mod telemetry;

pub use agent::{AgentKind, AgentRegistration, Capability, ExecutionContext, Executor, ResourceUsage};
pub use error::EngineError;
pub use memory::{LayerKind, MemorySystem};
pub use orchestrator::{ExecutionResult, MultiAgentSystem};
pub use settings::Settings;
