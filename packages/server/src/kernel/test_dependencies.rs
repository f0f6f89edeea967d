//! Test wiring: a full [`ServerDeps`] over in-memory stores and stub
//! providers, with handles kept for assertions.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use extraction::testing::{StubLlm, StubOcr};

use crate::config::Config;
use crate::kernel::blob_store::MemoryBlobStore;
use crate::kernel::clock::ManualClock;
use crate::kernel::deps::ServerDeps;
use crate::kernel::pdf::StaticPdfInspector;
use crate::kernel::rate_limit::RateLimiter;
use crate::kernel::stores::memory::{MemoryJobStore, MemoryLimiterStore};

/// A valid invoice reply used as the default LLM fixture.
pub const INVOICE_FIXTURE: &str = r#"{
    "invoiceNumber": "INV-001",
    "invoiceDate": "2024-03-01",
    "vendorName": "Acme GmbH",
    "currency": "EUR",
    "subtotal": 100.0,
    "tax": 19.0,
    "total": 119.0,
    "dueDate": "2024-03-31",
    "lineItems": [
        {"description": "Widgets", "quantity": 4, "unitPrice": 25, "lineTotal": 100}
    ]
}"#;

/// A config with test-friendly defaults, no environment reads.
pub fn test_config() -> Config {
    Config {
        port: 0,
        database_url: None,
        max_files: 10,
        max_size_mb: 20,
        max_pages: 30,
        accept_partial: false,
        ocr_sync_max_pages: 2,
        ocr_language_hints: vec![],
        preprocess_max_chars: 20_000,
        zone_strip_top: 0,
        zone_strip_bottom: 0,
        llm_prompt_version: "v2".to_string(),
        gemini_api_key: None,
        openai_api_key: None,
        retention_hours: 24,
        retention_loop_interval_min: 30,
        retention_loop_enable: false,
        rate_create_jobs_per_sec: 100.0,
        rate_create_jobs_burst: 100.0,
        rate_upload_file_per_sec: 100.0,
        rate_upload_file_burst: 100.0,
        rate_retry_per_sec: 100.0,
        rate_retry_burst: 100.0,
        daily_jobs_per_session: 1000,
        daily_jobs_global: 10_000,
        ip_limit_per_sec: None,
        ip_limit_burst: 30,
        task_queue_target_url: None,
        task_queue_path: None,
        task_queue_service_account: None,
        task_queue_max_attempts: 4,
        task_queue_min_backoff_secs: 30,
        task_queue_max_backoff_secs: 300,
        emulation_enabled: true,
        blob_bucket: "test-bucket".to_string(),
        blob_local_root: None,
        heartbeat_interval_secs: 30,
        attempt_budget_secs: 900,
    }
}

pub fn test_start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Full dependency container over fakes.
pub struct TestDependencies {
    pub deps: ServerDeps,
    pub clock: Arc<ManualClock>,
    pub blobs: Arc<MemoryBlobStore>,
    pub jobs: Arc<MemoryJobStore>,
    pub limiter_store: Arc<MemoryLimiterStore>,
    pub ocr: Arc<StubOcr>,
    pub primary: Arc<StubLlm>,
    pub fallback: Arc<StubLlm>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::build(
            config,
            Arc::new(StubOcr::new("Invoice INV-001\nTotal 119,00 EUR")),
            Arc::new(StubLlm::new("gemini", INVOICE_FIXTURE)),
            Arc::new(StubLlm::new("openai", INVOICE_FIXTURE)),
        )
    }

    pub fn build(
        config: Config,
        ocr: Arc<StubOcr>,
        primary: Arc<StubLlm>,
        fallback: Arc<StubLlm>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(test_start_time()));
        let blobs = Arc::new(MemoryBlobStore::new());
        let jobs = Arc::new(MemoryJobStore::new());
        let limiter_store = Arc::new(MemoryLimiterStore::new());
        let config = Arc::new(config);

        let rate_limiter = Arc::new(RateLimiter::new(
            limiter_store.clone(),
            clock.clone(),
            &config,
        ));

        let deps = ServerDeps {
            clock: clock.clone(),
            blob_store: blobs.clone(),
            job_store: jobs.clone(),
            rate_limiter,
            ocr: ocr.clone(),
            llm_primary: primary.clone(),
            llm_fallback: fallback.clone(),
            pdf: Arc::new(StaticPdfInspector(2)),
            config,
        };

        Self {
            deps,
            clock,
            blobs,
            jobs,
            limiter_store,
            ocr,
            primary,
            fallback,
        }
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
