//! Engine configuration with environment variable support and validation.

use anyhow::{anyhow, Result};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::agent::AgentKind;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_seconds: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
        }
    }
}

/// Dispatch, retry and backpressure configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_attempts: u32,
    pub resource_floor: f64,
    pub backoff_schedule_ms: Vec<u64>,
    pub agent_timeout_seconds: u64,
    pub coalesce_in_flight: bool,
    pub event_channel_capacity: usize,
    pub metric_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            resource_floor: 0.1,
            backoff_schedule_ms: vec![100, 400, 1_600],
            agent_timeout_seconds: 30,
            coalesce_in_flight: false,
            event_channel_capacity: 256,
            metric_history: 10_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.backoff_schedule_ms.iter().copied().map(Duration::from_millis).collect()
    }
}

/// Weights of the four agent scoring terms. Must sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub historical: f64,
    pub resource: f64,
    pub context: f64,
    pub specialization: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            historical: 0.4,
            resource: 0.3,
            context: 0.2,
            specialization: 0.1,
        }
    }
}

impl ScoringConfig {
    pub fn sum(&self) -> f64 {
        self.historical + self.resource + self.context + self.specialization
    }

    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("historical", self.historical),
            ("resource", self.resource),
            ("context", self.context),
            ("specialization", self.specialization),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(anyhow!("Scoring weight '{}' must be within [0, 1], got {}", name, w));
            }
        }
        if (self.sum() - 1.0).abs() > 1e-6 {
            return Err(anyhow!("Scoring weights must sum to 1.0, got {}", self.sum()));
        }
        Ok(())
    }
}

/// Capacity and time-to-live of one bounded memory layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LayerConfig {
    pub capacity: usize,
    pub ttl_seconds: u64,
}

impl LayerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Near-duplicate matching used by the short-term layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FuzzyConfig {
    pub enabled: bool,
    pub numeric_epsilon: f64,
    pub string_similarity: f64,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            numeric_epsilon: 1e-3,
            string_similarity: 0.9,
        }
    }
}

/// Tiered memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub short_term: LayerConfig,
    pub medium_term: LayerConfig,
    pub long_term: LayerConfig,
    /// Directory of the semantic store. `None` keeps it in a temporary location.
    pub semantic_path: Option<PathBuf>,
    pub expensive_call_threshold_ms: u64,
    pub promotion_threshold: u64,
    pub sweep_interval_seconds: u64,
    pub neighbor_similarity: f64,
    pub fuzzy: FuzzyConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term: LayerConfig { capacity: 1_000, ttl_seconds: 5 * 60 },
            medium_term: LayerConfig { capacity: 5_000, ttl_seconds: 60 * 60 },
            long_term: LayerConfig { capacity: 10_000, ttl_seconds: 24 * 60 * 60 },
            semantic_path: None,
            expensive_call_threshold_ms: 500,
            promotion_threshold: 3,
            sweep_interval_seconds: 60,
            neighbor_similarity: 0.75,
            fuzzy: FuzzyConfig::default(),
        }
    }
}

/// Built-in executor backing a configured agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorDefinition {
    Echo,
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Agent declared in configuration and registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub kind: AgentKind,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub primary_capabilities: Vec<String>,
    #[serde(default)]
    pub required_parameters: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub no_cache: Vec<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    pub executor: ExecutorDefinition,
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub scoring: ScoringConfig,
    pub memory: MemoryConfig,
    pub agents: Vec<AgentDefinition>,
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            // Start with default settings
            .add_source(config::File::from_str(
                include_str!("../config.toml"),
                config::FileFormat::Toml,
            ))
            // Add local config file if it exists
            .add_source(config::File::with_name("routing_engine").required(false))
            // Add environment variables with ARE_ prefix
            .add_source(
                Environment::with_prefix("ARE")
                    .separator("__")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(host) = std::env::var("ARE_SERVER_HOST") {
            settings.server.host = host;
        }
        if let Ok(port) = std::env::var("ARE_SERVER_PORT") {
            settings.server.port = port.parse()?;
        }
        if let Ok(path) = std::env::var("ARE_SEMANTIC_PATH") {
            settings.memory.semantic_path = Some(PathBuf::from(path));
        }
        if let Ok(level) = std::env::var("ARE_LOG_LEVEL") {
            settings.logging.level = level;
        }
        Ok(())
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        self.scoring.validate()?;

        if self.orchestrator.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.resource_floor) {
            return Err(anyhow!(
                "resource_floor must be within [0, 1], got {}",
                self.orchestrator.resource_floor
            ));
        }
        if self.orchestrator.event_channel_capacity == 0 {
            return Err(anyhow!("event_channel_capacity must be positive"));
        }
        if self.orchestrator.agent_timeout_seconds == 0 {
            return Err(anyhow!("agent_timeout_seconds must be at least 1"));
        }

        for (name, layer) in [
            ("short_term", &self.memory.short_term),
            ("medium_term", &self.memory.medium_term),
            ("long_term", &self.memory.long_term),
        ] {
            if layer.capacity == 0 {
                return Err(anyhow!("Memory layer '{}' needs a positive capacity", name));
            }
            if layer.ttl_seconds == 0 {
                return Err(anyhow!("Memory layer '{}' needs a positive ttl", name));
            }
        }
        if !(0.0..=1.0).contains(&self.memory.neighbor_similarity) {
            return Err(anyhow!("neighbor_similarity must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.memory.fuzzy.string_similarity) {
            return Err(anyhow!("fuzzy.string_similarity must be within [0, 1]"));
        }
        if self.memory.fuzzy.numeric_epsilon < 0.0 {
            return Err(anyhow!("fuzzy.numeric_epsilon cannot be negative"));
        }
        if self.memory.sweep_interval_seconds == 0 {
            return Err(anyhow!("sweep_interval_seconds must be positive"));
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(anyhow!("Agent definitions need a non-empty name"));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(anyhow!("Duplicate agent definition: {}", agent.name));
            }
            if agent.capabilities.is_empty() {
                warn!("Agent '{}' declares no capabilities and will never be selected", agent.name);
            }
            for primary in &agent.primary_capabilities {
                if !agent.capabilities.contains(primary) {
                    return Err(anyhow!(
                        "Agent '{}' lists primary capability '{}' that is not in its capabilities",
                        agent.name,
                        primary
                    ));
                }
            }
        }

        Ok(())
    }

    /// Get a configuration value by JSON pointer (e.g., "/server/port")
    pub fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = serde_json::to_value(self)?;
        let value = value
            .pointer(path)
            .ok_or_else(|| anyhow!("Configuration path not found: {}", path))?;

        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!((settings.scoring.sum() - 1.0).abs() < 1e-9);
        assert_eq!(settings.memory.short_term.capacity, 1_000);
        assert_eq!(settings.memory.long_term.ttl(), Duration::from_secs(86_400));
        assert_eq!(
            settings.orchestrator.backoff_schedule(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(400),
                Duration::from_millis(1_600)
            ]
        );
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut settings = Settings::default();
        settings.scoring.context = 0.3;
        assert!(settings.validate().is_err());

        settings.scoring = ScoringConfig {
            historical: 0.25,
            resource: 0.25,
            context: 0.25,
            specialization: 0.25,
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_orchestrator_values() {
        let mut settings = Settings::default();
        settings.orchestrator.max_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.orchestrator.resource_floor = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.memory.medium_term.capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_agent_timeout_rejected() {
        let mut settings = Settings::default();
        settings.orchestrator.agent_timeout_seconds = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("agent_timeout_seconds"));

        settings.orchestrator.agent_timeout_seconds = 1;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_embedded_config_parses() {
        let settings: Settings = toml::from_str(include_str!("../config.toml")).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.orchestrator.max_attempts, 3);
        assert!(!settings.agents.is_empty());
    }

    #[test]
    fn test_duplicate_agent_definitions_rejected() {
        let mut settings = Settings::default();
        let def = AgentDefinition {
            name: "echo".to_string(),
            kind: AgentKind::Data,
            capabilities: vec!["echo".to_string()],
            primary_capabilities: vec![],
            required_parameters: HashMap::new(),
            no_cache: vec![],
            max_concurrency: None,
            executor: ExecutorDefinition::Echo,
        };
        settings.agents = vec![def.clone(), def];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_pointer_lookup() {
        let settings = Settings::default();
        let port: u16 = settings.get("/server/port").unwrap();
        assert_eq!(port, 8080);
    }
}
