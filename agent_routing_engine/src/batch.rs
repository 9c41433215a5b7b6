//! Batch processing for running pre-configured calls through the engine.
//!
//! A batch file lists function calls with optional dependencies between them.
//! Calls run in dependency waves with a concurrency limit; a call whose
//! dependency did not succeed is skipped.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::error::EngineError;
use crate::memory::LayerKind;
use crate::orchestrator::MultiAgentSystem;

/// Batch job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub job: JobMetadata,
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub settings: BatchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique task identifier
    pub id: String,
    /// Function to route
    pub function: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    pub context: Option<Value>,
    #[serde(default)]
    pub settings: TaskSettings,
    /// Task IDs that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default = "default_task_timeout")]
    pub timeout_seconds: u64,
    /// Extra whole-call retries on top of the engine's own agent fallback
    #[serde(default)]
    pub retries: u32,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_task_timeout(),
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Overall batch timeout in seconds
    #[serde(default = "default_batch_timeout")]
    pub timeout_seconds: u64,
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            timeout_seconds: default_batch_timeout(),
            output_file: None,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub function: String,
    pub agent: Option<String>,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub cached: Option<LayerKind>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub retries_used: u32,
}

impl TaskResult {
    fn skipped(task: &TaskConfig, reason: String) -> Self {
        Self {
            task_id: task.id.clone(),
            function: task.function.clone(),
            agent: None,
            status: TaskStatus::Skipped,
            output: None,
            cached: None,
            error: Some(reason),
            duration_ms: 0,
            retries_used: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failed,
    Skipped,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_name: String,
    pub status: BatchStatus,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub total_duration_ms: u64,
    pub task_results: Vec<TaskResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    PartialSuccess,
    Failed,
}

/// Execute a batch job from configuration file
#[instrument(skip(engine))]
pub async fn run(config_path: PathBuf, engine: Arc<MultiAgentSystem>) -> Result<()> {
    info!("Starting batch execution from config: {:?}", config_path);

    let config = load_batch_config(&config_path).context("Failed to load batch configuration")?;
    info!("Loaded batch job: {} (version: {})", config.job.name, config.job.version);
    engine.start();

    let output_file = config.settings.output_file.clone();
    let batch_timeout = Duration::from_secs(config.settings.timeout_seconds);

    let start_time = Instant::now();
    let result = tokio::time::timeout(batch_timeout, execute_batch(engine, config))
        .await
        .map_err(|_| anyhow!("Batch exceeded its {}s timeout", batch_timeout.as_secs()))?
        .context("Batch execution failed")?;
    info!("Batch execution completed in {:?}", start_time.elapsed());

    print_batch_summary(&result);

    if let Some(ref path) = output_file {
        save_batch_results(&result, path).context("Failed to save batch results")?;
    }

    match result.status {
        BatchStatus::Success => Ok(()),
        BatchStatus::PartialSuccess => {
            warn!("Batch completed with some failures");
            Ok(())
        }
        BatchStatus::Failed => {
            error!("Batch execution failed");
            Err(anyhow!(
                "Batch execution failed: {}",
                result.error.unwrap_or_else(|| "no task succeeded".to_string())
            ))
        }
    }
}

/// Load batch configuration from TOML file
pub fn load_batch_config(config_path: &Path) -> Result<BatchConfig> {
    let contents = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

    let config: BatchConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config: {:?}", config_path))?;

    validate_batch_config(&config)?;
    Ok(config)
}

fn validate_batch_config(config: &BatchConfig) -> Result<()> {
    if config.tasks.is_empty() {
        return Err(anyhow!("Batch configuration must contain at least one task"));
    }
    if config.settings.max_concurrent_tasks == 0 {
        return Err(anyhow!("max_concurrent_tasks must be at least 1"));
    }

    let mut task_ids = HashSet::new();
    for task in &config.tasks {
        if task.function.trim().is_empty() {
            return Err(anyhow!("Task {} has an empty function name", task.id));
        }
        if !task_ids.insert(task.id.as_str()) {
            return Err(anyhow!("Duplicate task ID: {}", task.id));
        }
    }

    for task in &config.tasks {
        for dep in &task.depends_on {
            if !task_ids.contains(dep.as_str()) {
                return Err(anyhow!("Task {} depends on non-existent task: {}", task.id, dep));
            }
        }
    }

    Ok(())
}

/// Execute a batch with dependency resolution and concurrency control.
pub async fn execute_batch(engine: Arc<MultiAgentSystem>, config: BatchConfig) -> Result<BatchResult> {
    let start_time = Instant::now();
    let total_tasks = config.tasks.len();
    let semaphore = Arc::new(Semaphore::new(config.settings.max_concurrent_tasks));

    let mut task_results: Vec<TaskResult> = Vec::new();
    let mut succeeded: HashSet<String> = HashSet::new();
    let mut settled: HashSet<String> = HashSet::new();
    let mut remaining: HashMap<String, TaskConfig> =
        config.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
    let mut abort: Option<String> = None;

    while !remaining.is_empty() {
        // Dependents of anything that did not succeed can never run.
        let blocked: Vec<TaskConfig> = remaining
            .values()
            .filter(|task| {
                task.depends_on
                    .iter()
                    .any(|dep| settled.contains(dep) && !succeeded.contains(dep))
            })
            .cloned()
            .collect();
        if !blocked.is_empty() {
            for task in blocked {
                warn!("Skipping task {}: a dependency did not succeed", task.id);
                settled.insert(task.id.clone());
                remaining.remove(&task.id);
                task_results.push(TaskResult::skipped(&task, "dependency did not succeed".to_string()));
            }
            continue;
        }

        let mut ready: Vec<TaskConfig> = remaining
            .values()
            .filter(|task| task.depends_on.iter().all(|dep| succeeded.contains(dep)))
            .cloned()
            .collect();
        if ready.is_empty() {
            return Err(anyhow!("Circular dependency detected among tasks"));
        }
        ready.sort_by(|a, b| a.id.cmp(&b.id));

        let mut handles = Vec::with_capacity(ready.len());
        for task in ready {
            let permit = semaphore.clone().acquire_owned().await?;
            let engine = engine.clone();
            let id = task.id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                execute_single_task(&engine, task).await
            });
            handles.push((id, handle));
        }

        for (task_id, handle) in handles {
            let result = handle.await.context("Batch task panicked")?;
            if result.status == TaskStatus::Success {
                succeeded.insert(task_id.clone());
            } else if config.settings.fail_fast && abort.is_none() {
                error!("Failing fast due to task failure: {}", task_id);
                abort = Some(format!("Failed fast on task: {}", task_id));
            }
            settled.insert(task_id.clone());
            remaining.remove(&task_id);
            task_results.push(result);
        }

        if abort.is_some() {
            let mut rest: Vec<TaskConfig> = remaining.drain().map(|(_, t)| t).collect();
            rest.sort_by(|a, b| a.id.cmp(&b.id));
            for task in rest {
                task_results.push(TaskResult::skipped(&task, "batch failed fast".to_string()));
            }
        }
    }

    let successful_tasks = task_results.iter().filter(|r| r.status == TaskStatus::Success).count();
    let failed_tasks = task_results
        .iter()
        .filter(|r| matches!(r.status, TaskStatus::Failed | TaskStatus::Timeout))
        .count();
    let skipped_tasks = task_results.iter().filter(|r| r.status == TaskStatus::Skipped).count();

    let status = if abort.is_some() || successful_tasks == 0 {
        BatchStatus::Failed
    } else if failed_tasks + skipped_tasks == 0 {
        BatchStatus::Success
    } else {
        BatchStatus::PartialSuccess
    };

    Ok(BatchResult {
        job_name: config.job.name,
        status,
        total_tasks,
        successful_tasks,
        failed_tasks,
        skipped_tasks,
        total_duration_ms: start_time.elapsed().as_millis() as u64,
        task_results,
        error: abort,
    })
}

async fn execute_single_task(engine: &MultiAgentSystem, task: TaskConfig) -> TaskResult {
    let start_time = Instant::now();
    let timeout = Duration::from_secs(task.settings.timeout_seconds);
    let mut retries_used = 0;

    loop {
        info!("Executing task: {} (attempt {})", task.id, retries_used + 1);

        let outcome = engine
            .execute_with_timeout(&task.function, task.parameters.clone(), task.context.clone(), timeout)
            .await;

        let (status, error) = match outcome {
            Ok(result) => {
                info!("Task {} completed by {}", task.id, result.agent_name);
                return TaskResult {
                    task_id: task.id,
                    function: task.function,
                    agent: Some(result.agent_name),
                    status: TaskStatus::Success,
                    output: Some(result.value),
                    cached: result.cached,
                    error: None,
                    duration_ms: start_time.elapsed().as_millis() as u64,
                    retries_used,
                };
            }
            Err(e @ EngineError::Timeout { .. }) => (TaskStatus::Timeout, e),
            Err(e) => (TaskStatus::Failed, e),
        };

        // Unknown functions and bad requests will not improve on retry.
        let retryable = !matches!(error, EngineError::AgentNotFound { .. } | EngineError::InvalidRequest(_));
        if retryable && retries_used < task.settings.retries {
            retries_used += 1;
            warn!("Task {} failed ({}), retrying (attempt {})", task.id, error, retries_used + 1);
            continue;
        }

        warn!("Task {} failed: {}", task.id, error);
        return TaskResult {
            task_id: task.id,
            function: task.function,
            agent: None,
            status,
            output: None,
            cached: None,
            error: Some(error.to_string()),
            duration_ms: start_time.elapsed().as_millis() as u64,
            retries_used,
        };
    }
}

fn print_batch_summary(result: &BatchResult) {
    println!("\n=== Batch Execution Summary ===");
    println!("Job: {}", result.job_name);
    println!("Status: {:?}", result.status);
    println!("Total Tasks: {}", result.total_tasks);
    println!("Successful: {}", result.successful_tasks);
    println!("Failed: {}", result.failed_tasks);
    println!("Skipped: {}", result.skipped_tasks);
    println!("Duration: {}ms", result.total_duration_ms);

    if result.failed_tasks + result.skipped_tasks > 0 {
        println!("\nUnsuccessful Tasks:");
        for task in &result.task_results {
            if task.status != TaskStatus::Success {
                println!(
                    "  - {} ({}, {:?}): {}",
                    task.task_id,
                    task.function,
                    task.status,
                    task.error.as_deref().unwrap_or("Unknown error")
                );
            }
        }
    }
    println!("===============================\n");
}

fn save_batch_results(result: &BatchResult, output_file: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize batch results")?;

    std::fs::write(output_file, json)
        .with_context(|| format!("Failed to write results to: {:?}", output_file))?;

    info!("Batch results saved to: {:?}", output_file);
    Ok(())
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_parameters() -> Value {
    Value::Object(Default::default())
}
fn default_task_timeout() -> u64 {
    30
}
fn default_max_concurrent() -> usize {
    4
}
fn default_batch_timeout() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{executor_fn, AgentKind, AgentRegistration};
    use crate::settings::Settings;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn task(id: &str, function: &str, depends_on: &[&str]) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            function: function.to_string(),
            parameters: json!({"id": id}),
            context: None,
            settings: TaskSettings::default(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn config(tasks: Vec<TaskConfig>) -> BatchConfig {
        BatchConfig {
            job: JobMetadata {
                name: "test_job".to_string(),
                description: None,
                version: "1.0".to_string(),
                tags: vec![],
            },
            tasks,
            settings: BatchSettings::default(),
        }
    }

    fn engine() -> Arc<MultiAgentSystem> {
        let mut settings = Settings::default();
        settings.agents.clear();
        let engine = MultiAgentSystem::new(&settings).unwrap();
        engine
            .register_agent(
                AgentRegistration::new(
                    "worker",
                    AgentKind::Data,
                    executor_fn(|function, params| async move {
                        if function == "explode" {
                            anyhow::bail!("boom");
                        }
                        Ok(json!({"done": params}))
                    }),
                )
                .with_capabilities(["load", "explode"]),
            )
            .unwrap();
        Arc::new(engine)
    }

    #[test]
    fn test_batch_config_validation() {
        let valid = config(vec![task("a", "load", &[])]);
        assert!(validate_batch_config(&valid).is_ok());

        let mut duplicate = valid.clone();
        duplicate.tasks.push(task("a", "load", &[]));
        assert!(validate_batch_config(&duplicate).is_err());

        let dangling = config(vec![task("a", "load", &["missing"])]);
        assert!(validate_batch_config(&dangling).is_err());
    }

    #[test]
    fn test_batch_config_loading() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_batch.toml");

        let config_content = r#"
[job]
name = "test_batch"
description = "Test batch job"

[settings]
max_concurrent_tasks = 2

[[tasks]]
id = "load_genome"
function = "load"
parameters = { organism = "ecoli", size = 4600000 }

[tasks.settings]
timeout_seconds = 10
retries = 1

[[tasks]]
id = "zoom"
function = "load"
depends_on = ["load_genome"]
"#;
        fs::write(&config_path, config_content).unwrap();

        let config = load_batch_config(&config_path).unwrap();
        assert_eq!(config.job.name, "test_batch");
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].parameters["organism"], "ecoli");
        assert_eq!(config.tasks[1].parameters, json!({}));
        assert_eq!(config.settings.max_concurrent_tasks, 2);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let batch = config(vec![
            task("first", "load", &[]),
            task("bad", "explode", &["first"]),
            task("after_bad", "load", &["bad"]),
            task("independent", "load", &[]),
        ]);
        let result = execute_batch(engine(), batch).await.unwrap();

        assert_eq!(result.total_tasks, 4);
        assert_eq!(result.successful_tasks, 2);
        assert_eq!(result.failed_tasks, 1);
        assert_eq!(result.skipped_tasks, 1);
        assert_eq!(result.status, BatchStatus::PartialSuccess);
        let skipped = result.task_results.iter().find(|r| r.task_id == "after_bad").unwrap();
        assert_eq!(skipped.status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_batch() {
        let mut batch = config(vec![task("bad", "explode", &[]), task("later", "load", &["bad"])]);
        batch.settings.fail_fast = true;
        let result = execute_batch(engine(), batch).await.unwrap();
        assert_eq!(result.status, BatchStatus::Failed);
        assert!(result.error.unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn test_run_starts_background_maintenance() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("job.toml");
        let results_path = temp_dir.path().join("results.json");
        let config_content = format!(
            r#"
[job]
name = "sweep"

[settings]
output_file = '{}'

[[tasks]]
id = "a"
function = "load"
"#,
            results_path.display()
        );
        fs::write(&config_path, config_content).unwrap();

        let engine = engine();
        assert!(!engine.memory().sweeper_running());
        run(config_path, engine.clone()).await.unwrap();
        assert!(engine.memory().sweeper_running());
        assert!(results_path.exists());

        engine.shutdown().await;
        assert!(!engine.memory().sweeper_running());
    }

    #[tokio::test]
    async fn test_unknown_function_fails_without_retry() {
        let mut unknown = task("nope", "unknown", &[]);
        unknown.settings.retries = 3;
        let result = execute_batch(engine(), config(vec![unknown])).await.unwrap();
        assert_eq!(result.task_results[0].status, TaskStatus::Failed);
        assert_eq!(result.task_results[0].retries_used, 0);
    }
}
