//! Server dependencies (using traits for testability)
//!
//! This module provides the central dependency container used by the
//! lifecycle engine and the orchestration facade. All external services
//! use trait abstractions to enable testing.

use std::sync::Arc;

use extraction::{InvoiceLlm, OcrProvider};

use crate::config::Config;
use crate::kernel::blob_store::BlobStore;
use crate::kernel::clock::Clock;
use crate::kernel::pdf::PdfInspector;
use crate::kernel::rate_limit::RateLimiter;
use crate::kernel::store::JobStore;

/// Server dependencies accessible to the engine and facade.
#[derive(Clone)]
pub struct ServerDeps {
    pub clock: Arc<dyn Clock>,
    pub blob_store: Arc<dyn BlobStore>,
    pub job_store: Arc<dyn JobStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub ocr: Arc<dyn OcrProvider>,
    pub llm_primary: Arc<dyn InvoiceLlm>,
    pub llm_fallback: Arc<dyn InvoiceLlm>,
    pub pdf: Arc<dyn PdfInspector>,
    pub config: Arc<Config>,
}
