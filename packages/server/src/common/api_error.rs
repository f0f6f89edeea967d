//! Typed API errors and their HTTP mapping.
//!
//! The orchestration facade raises these; the axum layer turns them into
//! status codes and a JSON error body. Inside the lifecycle engine
//! contention is never an error, so none of these leak from the worker
//! path except `externalService`.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::kernel::rate_limit::RateLimitExceeded;

/// Per-file validation failure reported to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFailure {
    pub filename: String,
    pub code: &'static str,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{detail}")]
    BadRequest { code: &'static str, detail: String },

    #[error("file validation failed")]
    FileValidation { failures: Vec<FileFailure> },

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("rate limited: {detail}")]
    RateLimited {
        detail: String,
        retry_after_secs: u64,
        /// Next CET midnight for daily caps.
        reset_epoch: Option<i64>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{detail}")]
    Conflict { code: &'static str, detail: String },

    #[error("external service unavailable: {0}")]
    ExternalService(#[source] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::FileValidation { .. } => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::ExternalService(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest { code, .. } => code,
            ApiError::FileValidation { .. } => "fileValidation",
            ApiError::PayloadTooLarge => "payloadTooLarge",
            ApiError::RateLimited { .. } => "rateLimit",
            ApiError::NotFound(_) => "notFound",
            ApiError::Conflict { code, .. } => code,
            ApiError::ExternalService(_) => "externalService",
            ApiError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a [FileFailure]>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Internals get logged, not echoed.
        if matches!(self, ApiError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }

        let status = self.status();
        let detail = match &self {
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let files = match &self {
            ApiError::FileValidation { failures } => Some(failures.as_slice()),
            _ => None,
        };

        let body = Json(ErrorBody {
            error: self.code(),
            detail,
            files,
        });

        let mut response = (status, body).into_response();

        if let ApiError::RateLimited {
            retry_after_secs,
            reset_epoch,
            ..
        } = &self
        {
            let headers = response.headers_mut();
            if let Ok(value) = retry_after_secs.to_string().parse() {
                headers.insert(header::RETRY_AFTER, value);
            }
            if let Some(reset) = reset_epoch {
                if let Ok(value) = reset.to_string().parse() {
                    headers.insert("X-RateLimit-Reset", value);
                }
            }
        }

        response
    }
}

impl From<RateLimitExceeded> for ApiError {
    fn from(e: RateLimitExceeded) -> Self {
        ApiError::RateLimited {
            detail: format!("rate limit exceeded ({})", e.scope),
            retry_after_secs: e.retry_after_secs,
            reset_epoch: e.reset_epoch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_taxonomy() {
        assert_eq!(
            ApiError::FileValidation { failures: vec![] }.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("job".to_string()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict {
                code: "reuploadRequired",
                detail: "input file is gone".to_string()
            }
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::ExternalService(anyhow::anyhow!("down")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn rate_limited_response_carries_reset_headers() {
        let response = ApiError::RateLimited {
            detail: "daily cap".to_string(),
            retry_after_secs: 120,
            reset_epoch: Some(1_700_000_000),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "120");
        assert_eq!(response.headers()["X-RateLimit-Reset"], "1700000000");
    }
}
