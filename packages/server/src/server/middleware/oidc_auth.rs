//! Bearer verification for the worker callback route.
//!
//! The task queue signs deliveries with an OIDC token whose audience is
//! the callback URL. Anything that fails verification is rejected before
//! the handler runs. The bypass exists only for explicitly configured
//! local emulation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{extract::Request, middleware::Next, Json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::kernel::oidc::OidcVerifier;

/// Worker-route auth state. `verifier: None` means the emulation bypass
/// was explicitly configured.
#[derive(Clone)]
pub struct WorkerAuth {
    verifier: Option<Arc<dyn OidcVerifier>>,
}

impl WorkerAuth {
    pub fn verified(verifier: Arc<dyn OidcVerifier>) -> Self {
        Self {
            verifier: Some(verifier),
        }
    }

    /// Only for local development with emulation enabled.
    pub fn emulation_bypass() -> Self {
        Self { verifier: None }
    }
}

fn reject(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "unauthorized", "detail": detail })),
    )
        .into_response()
}

pub async fn worker_auth_middleware(auth: WorkerAuth, request: Request, next: Next) -> Response {
    let Some(verifier) = &auth.verifier else {
        debug!("worker auth bypassed (emulation)");
        return next.run(request).await;
    };

    let token = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = token else {
        return reject("missing bearer token");
    };

    match verifier.verify(token).await {
        Ok(claims) => {
            debug!(subject = %claims.subject, "worker delivery verified");
            next.run(request).await
        }
        Err(e) => {
            warn!(error = %e, "worker delivery rejected");
            reject("token verification failed")
        }
    }
}
