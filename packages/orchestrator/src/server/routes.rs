//! The six endpoints named by the HTTP admin surface: handlers deserialize,
//! call the Facade, and serialize the typed result or error. No business
//! logic lives here.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::facade::Orchestrator;
use crate::queue::{Job, JobStatus};

pub fn router() -> Router<Arc<Orchestrator>> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/robots/:id/heartbeat", post(heartbeat))
        .route("/queue/stats", get(queue_stats))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    workflow_id: Uuid,
    workflow_name: Option<String>,
    workflow_definition: serde_json::Value,
    #[serde(default)]
    variables: serde_json::Value,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    affinity_key: Option<String>,
    #[serde(default)]
    dedupe: bool,
}

async fn submit_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<Json<Job>, ApiError> {
    let mut job = Job::builder()
        .workflow_id(req.workflow_id)
        .workflow_definition(req.workflow_definition)
        .variables(req.variables)
        .priority(req.priority)
        .build();
    job.workflow_name = req.workflow_name;
    job.affinity_key = req.affinity_key;

    let job = orchestrator.submit_job(job, req.dedupe).await?;
    Ok(Json(job))
}

async fn get_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = orchestrator.queue.get_by_id(id).await?;
    Ok(Json(job))
}

async fn cancel_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = orchestrator.cancel_job(id).await?;
    Ok(Json(job))
}

async fn heartbeat(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    orchestrator.heartbeat(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct QueueStatsResponse {
    counts: Vec<(JobStatus, i64)>,
}

async fn queue_stats(State(orchestrator): State<Arc<Orchestrator>>) -> Result<Json<QueueStatsResponse>, ApiError> {
    let counts = orchestrator.queue_stats().await?;
    Ok(Json(QueueStatsResponse { counts }))
}

struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Conflict(_) | OrchestratorError::PreconditionFailed { .. } => StatusCode::CONFLICT,
            OrchestratorError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}
