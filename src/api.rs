use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{ChangeType, JobStatus, Phase};
use crate::manager::{JobManager, JobSnapshot};

/// Request body for `POST /orchestrate`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateRequest {
    pub task: String,
    pub language: Option<String>,
    pub max_iterations: Option<u32>,
    pub workspace_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateResponse {
    pub job_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_phase: String,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub files: Vec<FilePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub path: String,
    pub content: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Build the HTTP surface. Handlers are thin adapters over the manager;
/// no orchestration logic lives here.
pub fn router(manager: JobManager) -> Router {
    Router::new()
        .route("/orchestrate", post(orchestrate))
        .route("/status/:job_id", get(status))
        .route("/jobs", get(jobs))
        .route("/cancel/:job_id", post(cancel))
        .route("/health", get(health))
        .with_state(manager)
}

async fn orchestrate(
    State(manager): State<JobManager>,
    Json(req): Json<OrchestrateRequest>,
) -> Result<Json<OrchestrateResponse>, (StatusCode, Json<MessageResponse>)> {
    match manager
        .start(req.task, req.language, req.max_iterations, req.workspace_path)
        .await
    {
        Ok(job_id) => Ok(Json(OrchestrateResponse {
            message: format!("job {job_id} accepted"),
            job_id,
        })),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(MessageResponse {
                message: e.user_message(),
            }),
        )),
    }
}

async fn status(
    State(manager): State<JobManager>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<MessageResponse>)> {
    match manager.status(&job_id).await {
        Some(snapshot) => Ok(Json(status_payload(snapshot))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(MessageResponse {
                message: format!("no job {job_id}"),
            }),
        )),
    }
}

async fn jobs(State(manager): State<JobManager>) -> Json<Vec<StatusResponse>> {
    Json(manager.list().await.into_iter().map(status_payload).collect())
}

async fn cancel(
    State(manager): State<JobManager>,
    Path(job_id): Path<String>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<MessageResponse>)> {
    match manager.cancel(&job_id).await {
        Some(JobStatus::Cancelled) => Ok(Json(MessageResponse {
            message: format!("job {job_id} cancelled"),
        })),
        Some(status) => Ok(Json(MessageResponse {
            message: format!("job {job_id} already {}", status_word(status)),
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(MessageResponse {
                message: format!("no job {job_id}"),
            }),
        )),
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "crucible",
        timestamp: Utc::now(),
    })
}

fn status_payload(snapshot: JobSnapshot) -> StatusResponse {
    let current_phase = snapshot
        .timeline
        .last()
        .map(|entry| phase_word(entry.phase).to_string())
        .unwrap_or_else(|| "queued".to_string());

    let result = snapshot.result.map(|files| ResultPayload {
        files: files
            .into_iter()
            .map(|f| FilePayload {
                path: f.path,
                content: f.content,
                change_type: f.change_type,
            })
            .collect(),
        output_dir: snapshot.output_dir,
    });

    StatusResponse {
        job_id: snapshot.id,
        status: snapshot.status,
        progress: snapshot.progress,
        current_phase,
        iteration: snapshot.iteration,
        started_at: snapshot.started_at,
        finished_at: snapshot.finished_at,
        result,
        error: snapshot.error.map(|(kind, message)| ErrorPayload { kind, message }),
        warnings: snapshot.warnings,
    }
}

fn phase_word(phase: Phase) -> &'static str {
    match phase {
        Phase::Planning => "planning",
        Phase::Generating => "generating",
        Phase::Validating => "validating",
        Phase::Fixing => "fixing",
        Phase::Accept => "accept",
        Phase::Cancelled => "cancelled",
        Phase::Failed => "failed",
    }
}

fn status_word(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}
