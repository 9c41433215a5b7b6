//! HTTP server exposing routing, reporting and memory maintenance.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

use crate::agent::AgentSummary;
use crate::error::EngineError;
use crate::memory::MemoryStats;
use crate::metrics::{ExecutionMetric, PerformanceReport};
use crate::orchestrator::{ExecutionResult, MultiAgentSystem};
use crate::settings::Settings;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MultiAgentSystem>,
    pub request_timeout: Duration,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<MultiAgentSystem>, settings: &Settings) -> Self {
        Self {
            engine,
            request_timeout: Duration::from_secs(settings.server.request_timeout_seconds),
            started_at: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    agent_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub function: String,
    #[serde(default)]
    pub parameters: Value,
    pub context: Option<Value>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub limit: Option<usize>,
}

/// JSON error body with a status derived from the engine error kind.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::AgentNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::AgentExecution { .. } => StatusCode::BAD_GATEWAY,
            EngineError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EngineError::DuplicateAgent(_) => StatusCode::CONFLICT,
            EngineError::Configuration(_) | EngineError::MemoryLayer(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Create the HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/agents", get(list_agents))
        .route("/execute", post(execute))
        .route("/performance", get(performance))
        .route("/metrics/recent", get(recent_metrics))
        .route("/memory/stats", get(memory_stats))
        .route("/memory/sweep", post(sweep_memory))
        .route("/memory/semantic/:function", delete(purge_semantic))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        agent_count: state.engine.list_agents().len(),
    })
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    Json(state.engine.list_agents())
}

#[instrument(skip_all)]
async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.request_timeout);
    let parameters = if request.parameters.is_null() {
        Value::Object(Default::default())
    } else {
        request.parameters
    };

    let result = state
        .engine
        .execute_with_timeout(&request.function, parameters, request.context, timeout)
        .await?;
    Ok(Json(result))
}

async fn performance(State(state): State<AppState>) -> Json<PerformanceReport> {
    Json(state.engine.get_performance_report())
}

async fn recent_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Json<Vec<ExecutionMetric>> {
    Json(state.engine.recent_metrics(query.limit.unwrap_or(100)))
}

async fn memory_stats(State(state): State<AppState>) -> Json<MemoryStats> {
    Json(state.engine.get_memory_stats().await)
}

async fn sweep_memory(State(state): State<AppState>) -> Json<Value> {
    let removed = state.engine.memory().sweep_expired().await;
    Json(json!({ "removed": removed }))
}

async fn purge_semantic(State(state): State<AppState>, Path(function): Path<String>) -> Json<Value> {
    let removed = state.engine.memory().purge_semantic_function(&function).await;
    info!("Purged {} semantic entries for '{}'", removed, function);
    Json(json!({ "function": function, "removed": removed }))
}

/// Start the HTTP server and wait for shutdown signal
pub async fn serve(engine: Arc<MultiAgentSystem>, settings: &Settings, addr: Option<SocketAddr>) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => format!("{}:{}", settings.server.host, settings.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?,
    };

    engine.start();
    let app = create_router(AppState::new(engine.clone(), settings));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await;

    engine.shutdown().await;
    if let Err(e) = served {
        error!("HTTP server error: {}", e);
        return Err(e.into());
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down gracefully");
    }
}
