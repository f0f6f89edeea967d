//! Session routes: listing, CSV export, deletion.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use axum::Json;
use futures::stream;
use uuid::Uuid;

use crate::common::ApiError;
use crate::domains::invoices::export;
use crate::domains::invoices::orchestration::{DeleteSessionResponse, SessionJobsResponse};
use crate::server::app::AppState;
use crate::server::middleware::SessionId;

fn require_own_session(path_session: Uuid, header_session: Uuid) -> Result<(), ApiError> {
    if path_session != header_session {
        return Err(ApiError::NotFound("session not found".to_string()));
    }
    Ok(())
}

/// `GET /api/sessions/{sid}/jobs`
pub async fn list_session_jobs_handler(
    State(state): State<AppState>,
    SessionId(header_session): SessionId,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionJobsResponse>, ApiError> {
    require_own_session(session_id, header_session)?;
    Ok(Json(state.facade.list_session_jobs(session_id).await?))
}

/// `GET /api/sessions/{sid}/export.csv`
///
/// Streams header plus one chunk per completed job. The set is a snapshot
/// of "done at query time", newest first.
pub async fn export_csv_handler(
    State(state): State<AppState>,
    SessionId(header_session): SessionId,
    Path(session_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    require_own_session(session_id, header_session)?;

    let jobs = state.facade.done_session_jobs(session_id).await?;

    let mut chunks = vec![export::csv_header()];
    for job in &jobs {
        chunks.push(export::job_rows(job).map_err(ApiError::Internal)?);
    }

    let body = Body::from_stream(stream::iter(
        chunks
            .into_iter()
            .map(Ok::<_, std::convert::Infallible>),
    ));

    Response::builder()
        .header(header::CONTENT_TYPE, export::CSV_CONTENT_TYPE)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"session-{session_id}.csv\""),
        )
        .body(body)
        .map_err(|e| ApiError::Internal(e.into()))
}

/// `DELETE /api/sessions/{sid}`
pub async fn delete_session_handler(
    State(state): State<AppState>,
    SessionId(header_session): SessionId,
    Path(session_id): Path<Uuid>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    require_own_session(session_id, header_session)?;
    Ok(Json(state.facade.delete_session_data(session_id).await?))
}
