//! Worker callback route: the task queue (or the emulation path behind a
//! bypass) delivers `(jobId, sessionId)` here.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::common::ApiError;
use crate::domains::invoices::lifecycle::{EngineError, ProcessOutcome};
use crate::server::app::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTaskRequest {
    pub job_id: uuid::Uuid,
    pub session_id: uuid::Uuid,
}

#[derive(Serialize)]
pub struct ProcessTaskResponse {
    status: &'static str,
}

/// `POST /api/tasks/process`
///
/// Always 200 for idempotent completions and no-ops; 503 only on
/// transient external failure so the queue redelivers with backoff.
pub async fn process_task_handler(
    State(state): State<AppState>,
    Json(request): Json<ProcessTaskRequest>,
) -> Result<Json<ProcessTaskResponse>, ApiError> {
    let outcome = state
        .engine
        .process(request.job_id, request.session_id)
        .await
        .map_err(|e| match e {
            EngineError::External(source) => ApiError::ExternalService(source),
        })?;

    let status = match outcome {
        ProcessOutcome::Completed => "completed",
        ProcessOutcome::AlreadyTerminal => "alreadyTerminal",
        ProcessOutcome::Contended => "contended",
        ProcessOutcome::NotFound => "notFound",
        ProcessOutcome::Failed => "failed",
    };

    Ok(Json(ProcessTaskResponse { status }))
}
