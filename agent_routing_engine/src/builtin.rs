//! Built-in executors and registration of agents declared in configuration.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::agent::{AgentRegistration, ExecutionContext, Executor};
use crate::error::EngineError;
use crate::orchestrator::MultiAgentSystem;
use crate::settings::{AgentDefinition, ExecutorDefinition};

/// Returns the call it was given. Useful for wiring checks and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, function_name: &str, parameters: &Value, context: &ExecutionContext) -> Result<Value> {
        Ok(json!({
            "function": function_name,
            "parameters": parameters,
            "context": context.features,
        }))
    }
}

const MAX_ARG_LEN: usize = 1000;

/// Runs an external program per call. Parameters are written to stdin as JSON;
/// stdout is parsed as JSON, or returned as a string when it is not JSON. The
/// function name is exported as `ARE_FUNCTION`.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Result<Self> {
        let program = program.into();
        if program.trim().is_empty() {
            return Err(anyhow!("Command executor needs a program"));
        }
        Self::validate_command_args(&args)?;
        Ok(Self { program, args })
    }

    /// Reject arguments carrying shell metacharacters or suspicious patterns.
    fn validate_command_args(args: &[String]) -> Result<()> {
        const DANGEROUS_CHARS: [char; 11] = ['&', '|', ';', '`', '$', '>', '<', '(', ')', '{', '}'];
        const DANGEROUS_PATTERNS: [&str; 6] = ["rm -", "shutdown", "reboot", "../", "sudo", "chmod"];

        for arg in args {
            if arg.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
                return Err(anyhow!("Command argument '{}' contains shell metacharacters", arg));
            }
            let lowered = arg.to_lowercase();
            if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| lowered.contains(*p)) {
                return Err(anyhow!("Command argument '{}' contains forbidden pattern: {}", arg, pattern));
            }
            if arg.len() > MAX_ARG_LEN {
                return Err(anyhow!("Command argument exceeds {} characters", MAX_ARG_LEN));
            }
        }
        Ok(())
    }

    async fn run(&self, function_name: &str, parameters: &Value) -> Result<Value> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("ARE_FUNCTION", function_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;

        let payload = serde_json::to_vec(parameters)?;
        let stdin = child.stdin.take();
        // Feed stdin while draining stdout, or a child that fills its pipe blocks both sides.
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                // The child stopped reading; its exit status tells the rest.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.with_context(|| format!("Failed to wait for '{}'", self.program))?;
        fed.context("Failed to write parameters")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("'{}' exited with {}: {}", self.program, output.status, stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, function_name: &str, parameters: &Value, context: &ExecutionContext) -> Result<Value> {
        debug!("Running {} for {}", self.program, function_name);
        tokio::select! {
            result = self.run(function_name, parameters) => result,
            _ = context.cancellation.cancelled() => {
                warn!("Command '{}' cancelled, child process killed", self.program);
                Err(anyhow!("command '{}' cancelled", self.program))
            }
        }
    }
}

impl AgentDefinition {
    pub fn to_registration(&self) -> Result<AgentRegistration> {
        let executor: Arc<dyn Executor> = match &self.executor {
            ExecutorDefinition::Echo => Arc::new(EchoExecutor),
            ExecutorDefinition::Command { program, args } => Arc::new(CommandExecutor::new(program, args.clone())?),
        };
        let mut registration = AgentRegistration::new(&self.name, self.kind, executor)
            .with_capabilities(self.capabilities.iter().cloned())
            .with_primary_capabilities(self.primary_capabilities.iter().cloned())
            .with_no_cache(self.no_cache.iter().cloned());
        for (function, params) in &self.required_parameters {
            registration = registration.require_parameters(function.clone(), params.iter().cloned());
        }
        if let Some(max) = self.max_concurrency {
            registration = registration.with_max_concurrency(max);
        }
        Ok(registration)
    }
}

/// Register every agent declared in `definitions`.
pub fn register_configured_agents(
    engine: &MultiAgentSystem,
    definitions: &[AgentDefinition],
) -> Result<usize, EngineError> {
    for definition in definitions {
        let registration = definition
            .to_registration()
            .map_err(|e| EngineError::Configuration(format!("agent '{}': {}", definition.name, e)))?;
        engine.register_agent(registration)?;
    }
    info!("Registered {} configured agent(s)", definitions.len());
    Ok(definitions.len())
}
