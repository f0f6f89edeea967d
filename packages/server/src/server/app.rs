//! Application setup and router assembly.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method};
use axum::routing::{delete, get, post};
use axum::{middleware, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::invoices::{
    EngineSettings, InvoiceFacade, ProcessingEngine, RetentionSweeper,
};
use crate::kernel::deps::ServerDeps;
use crate::kernel::dispatcher::{
    CloudTasksDispatcher, EmulationDispatcher, TaskDispatcher,
};
use crate::kernel::oidc::GoogleOidcVerifier;
use crate::server::middleware::{worker_auth_middleware, WorkerAuth};
use crate::server::routes::{
    config::config_handler,
    health::health_handler,
    jobs::{create_jobs_handler, get_job_handler, retry_job_handler},
    sessions::{delete_session_handler, export_csv_handler, list_session_jobs_handler},
    tasks::process_task_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: ServerDeps,
    pub facade: Arc<InvoiceFacade>,
    pub engine: Arc<ProcessingEngine>,
}

/// Wire the engine, dispatcher and facade from the dependency container.
///
/// Queue mode needs the full task-queue config triple; anything less runs
/// the worker in-process (emulation). The queue dispatcher keeps the
/// emulation path as its transient-failure fallback.
pub fn build_components(
    deps: ServerDeps,
    tokens: Arc<dyn extraction::TokenSource>,
) -> (Arc<InvoiceFacade>, Arc<ProcessingEngine>) {
    let engine = Arc::new(ProcessingEngine::new(
        deps.clone(),
        EngineSettings::from_config(&deps.config),
    ));

    let emulation = Arc::new(EmulationDispatcher::new(engine.clone()));

    let dispatcher: Arc<dyn TaskDispatcher> = if deps.config.queue_mode_configured() {
        let config = &deps.config;
        tracing::info!(
            max_attempts = config.task_queue_max_attempts,
            min_backoff_secs = config.task_queue_min_backoff_secs,
            max_backoff_secs = config.task_queue_max_backoff_secs,
            "queue mode; redelivery policy is applied at queue provisioning"
        );
        Arc::new(
            CloudTasksDispatcher::new(
                tokens,
                config.task_queue_path.clone().unwrap_or_default(),
                config.task_queue_target_url.clone().unwrap_or_default(),
                config.task_queue_service_account.clone().unwrap_or_default(),
            )
            .with_fallback(emulation),
        )
    } else {
        tracing::info!("task queue not configured; running in emulation mode");
        emulation
    };

    let facade = Arc::new(InvoiceFacade::new(deps.clone(), dispatcher));
    (facade, engine)
}

/// Worker-route auth per configuration. The bypass requires emulation to
/// be explicitly enabled; a configured callback URL always verifies.
pub fn build_worker_auth(deps: &ServerDeps) -> WorkerAuth {
    match &deps.config.task_queue_target_url {
        Some(audience) => WorkerAuth::verified(Arc::new(GoogleOidcVerifier::new(audience.clone()))),
        None if deps.config.emulation_enabled => WorkerAuth::emulation_bypass(),
        None => {
            // No queue and no explicit emulation: lock the route anyway.
            WorkerAuth::verified(Arc::new(GoogleOidcVerifier::new(String::new())))
        }
    }
}

/// Build the Axum application router.
pub fn build_app(state: AppState, worker_auth: WorkerAuth) -> Router {
    let config = state.deps.config.clone();

    // Whole-request cap: all files plus multipart framing slack.
    let body_limit = (config.max_size_bytes() as usize)
        .saturating_mul(config.max_files.max(1))
        .saturating_add(1024 * 1024);

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-session-id")]);

    let worker_routes = Router::new()
        .route("/tasks/process", post(process_task_handler))
        .layer(middleware::from_fn(move |request, next| {
            worker_auth_middleware(worker_auth.clone(), request, next)
        }));

    let api = Router::new()
        .route("/config", get(config_handler))
        .route("/healthz", get(health_handler))
        .route("/jobs", post(create_jobs_handler))
        .route("/jobs/:job_id", get(get_job_handler))
        .route("/jobs/:job_id/retry", post(retry_job_handler))
        .route("/sessions/:session_id/jobs", get(list_session_jobs_handler))
        .route(
            "/sessions/:session_id/export.csv",
            get(export_csv_handler),
        )
        .route("/sessions/:session_id", delete(delete_session_handler))
        .merge(worker_routes);

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn the retention sweeper when enabled. Returns the shutdown token.
pub fn spawn_retention(
    deps: ServerDeps,
    facade: Arc<InvoiceFacade>,
) -> CancellationToken {
    let shutdown = CancellationToken::new();
    if deps.config.retention_loop_enable {
        let sweeper = RetentionSweeper::new(deps, facade);
        let token = shutdown.clone();
        tokio::spawn(async move {
            sweeper.run(token).await;
        });
    }
    shutdown
}
