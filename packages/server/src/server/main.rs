// Main entry point for the invoice processing API server

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use extraction::ai::{GeminiExtractor, OpenAiExtractor};
use extraction::ocr::VisionOcr;
use extraction::{InvoiceLlm, OcrProvider, TokenSource};

use server_core::config::Config;
use server_core::kernel::blob_store::{BlobStore, LocalDiskBlobStore, MemoryBlobStore};
use server_core::kernel::clock::SystemClock;
use server_core::kernel::deps::ServerDeps;
use server_core::kernel::pdf::HeuristicPdfInspector;
use server_core::kernel::rate_limit::RateLimiter;
use server_core::kernel::store::{JobStore, LimiterStore};
use server_core::kernel::stores::{
    MemoryJobStore, MemoryLimiterStore, PostgresJobStore, PostgresLimiterStore,
};
use server_core::kernel::token_source::MetadataTokenSource;
use server_core::server::app::{
    build_app, build_components, build_worker_auth, spawn_retention, AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting invoice processing API");

    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);

    // Stores: Postgres when configured, in-memory otherwise (dev only).
    let (job_store, limiter_store): (Arc<dyn JobStore>, Arc<dyn LimiterStore>) =
        match &config.database_url {
            Some(database_url) => {
                tracing::info!("Connecting to database...");
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(database_url)
                    .await
                    .context("Failed to connect to database")?;

                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .context("Failed to run migrations")?;
                tracing::info!("Database connected, migrations complete");

                (
                    Arc::new(PostgresJobStore::new(pool.clone())),
                    Arc::new(PostgresLimiterStore::new(pool)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using in-memory stores");
                (
                    Arc::new(MemoryJobStore::new()),
                    Arc::new(MemoryLimiterStore::new()),
                )
            }
        };

    let blob_store: Arc<dyn BlobStore> = match &config.blob_local_root {
        Some(root) => Arc::new(LocalDiskBlobStore::new(root.clone())),
        None => {
            tracing::warn!("BLOB_LOCAL_ROOT not set; using in-memory blob store");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let tokens: Arc<dyn TokenSource> = Arc::new(MetadataTokenSource::new());

    let ocr: Arc<dyn OcrProvider> = Arc::new(
        VisionOcr::new(tokens.clone(), config.blob_bucket.clone())
            .with_language_hints(config.ocr_language_hints.clone()),
    );

    let gemini_key = config
        .gemini_api_key
        .clone()
        .context("GEMINI_API_KEY must be set")?;
    let openai_key = config
        .openai_api_key
        .clone()
        .context("OPENAI_API_KEY must be set")?;
    let llm_primary: Arc<dyn InvoiceLlm> = Arc::new(GeminiExtractor::new(gemini_key));
    let llm_fallback: Arc<dyn InvoiceLlm> = Arc::new(OpenAiExtractor::new(openai_key));

    let clock = Arc::new(SystemClock);
    let rate_limiter = Arc::new(RateLimiter::new(limiter_store, clock.clone(), &config));

    let deps = ServerDeps {
        clock,
        blob_store,
        job_store,
        rate_limiter,
        ocr,
        llm_primary,
        llm_fallback,
        pdf: Arc::new(HeuristicPdfInspector),
        config: config.clone(),
    };

    let (facade, engine) = build_components(deps.clone(), tokens);
    let worker_auth = build_worker_auth(&deps);
    let retention_shutdown = spawn_retention(deps.clone(), facade.clone());

    let app = build_app(
        AppState {
            deps,
            facade,
            engine,
        },
        worker_auth,
    );

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("Server error")?;

    retention_shutdown.cancel();
    Ok(())
}
