use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::types::{Execution, ExecutionStatus, InboundEvent, LogEntry};
use crate::graph::WorkflowVersion;

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Serialize)]
pub struct PublishResponse {
    pub workflow_id: String,
    pub version: u32,
    pub nodes: usize,
}

#[derive(Serialize)]
pub struct EventResponse {
    pub handled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Deserialize)]
pub struct ListExecutionsQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub logs: Vec<LogEntry>,
}

#[derive(Serialize)]
pub struct NodeInfo {
    pub node_type: String,
    pub handler: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /projects/{id}/workflows
pub async fn publish_workflow(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<PublishResponse>, AppError> {
    let version: WorkflowVersion = serde_json::from_value(body)
        .map_err(|e| AppError::BadRequest(format!("Invalid workflow version: {}", e)))?;

    let workflow_id = version.workflow_id.clone();
    let version_number = version.version;
    let nodes = version.nodes.len();

    state
        .engine
        .publish(&project_id, version)
        .await
        .map_err(|e| AppError::BadRequest(format!("{:#}", e)))?;

    Ok(Json(PublishResponse {
        workflow_id,
        version: version_number,
        nodes,
    }))
}

/// POST /projects/{id}/events
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(mut event): Json<InboundEvent>,
) -> Result<Json<EventResponse>, AppError> {
    event.project_id = project_id;

    let execution = state.engine.handle_event(event).await?;

    Ok(Json(match execution {
        Some(exec) => EventResponse {
            handled: true,
            execution_id: Some(exec.id),
            status: Some(exec.status.to_string()),
            error: exec.error,
        },
        None => EventResponse {
            handled: false,
            execution_id: None,
            status: None,
            error: None,
        },
    }))
}

/// GET /executions
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Vec<Execution>>, AppError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => Some(parse_status(s)?),
    };

    let executions = state.engine.deps().store.list(status).await?;
    Ok(Json(executions))
}

/// GET /executions/{id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionDetail>, AppError> {
    let store = &state.engine.deps().store;
    let execution = store
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Execution not found: {}", id)))?;
    let logs = store.logs(&id).await?;

    Ok(Json(ExecutionDetail { execution, logs }))
}

/// DELETE /executions/{id}
pub async fn delete_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let store = &state.engine.deps().store;
    if store.get(&id).await?.is_none() {
        return Err(AppError::NotFound(format!("Execution not found: {}", id)));
    }
    store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

/// GET /nodes
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeInfo>> {
    let nodes = state
        .engine
        .registry()
        .list()
        .into_iter()
        .map(|(node_type, handler)| NodeInfo { node_type, handler })
        .collect();
    Json(nodes)
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn parse_status(s: &str) -> Result<ExecutionStatus, AppError> {
    match s {
        "running" => Ok(ExecutionStatus::Running),
        "waiting" => Ok(ExecutionStatus::Waiting),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        other => Err(AppError::BadRequest(format!(
            "Unknown status filter: {}",
            other
        ))),
    }
}
