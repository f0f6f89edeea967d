//! Job routes: upload intake, status polling, client retry.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::common::ApiError;
use crate::domains::invoices::orchestration::{
    CreateJobsResponse, JobView, RetryResponse, UploadedFile,
};
use crate::server::app::AppState;
use crate::server::middleware::{BackstopIp, SessionId};

/// `POST /api/jobs` — multipart upload of 1..maxFiles PDFs.
pub async fn create_jobs_handler(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    BackstopIp(client_ip): BackstopIp,
    multipart: Multipart,
) -> Result<(StatusCode, Json<CreateJobsResponse>), ApiError> {
    let files = collect_files(multipart).await?;

    let response = state
        .facade
        .create_upload_jobs(session_id, files, client_ip)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn collect_files(mut multipart: Multipart) -> Result<Vec<UploadedFile>, ApiError> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        // Only file parts; other form fields are ignored.
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;

        files.push(UploadedFile {
            filename,
            content_type,
            bytes,
        });
    }

    Ok(files)
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge
    } else {
        ApiError::BadRequest {
            code: "badMultipart",
            detail: e.to_string(),
        }
    }
}

/// `GET /api/jobs/{jobId}` — status polling.
pub async fn get_job_handler(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.facade.get_job(job_id, session_id).await?))
}

/// `POST /api/jobs/{jobId}/retry` — client-initiated retry of a failed job.
pub async fn retry_job_handler(
    State(state): State<AppState>,
    SessionId(session_id): SessionId,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<RetryResponse>), ApiError> {
    let response = state.facade.retry_job(job_id, session_id).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}
