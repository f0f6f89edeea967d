//! OCR provider trait covering the synchronous and asynchronous tiers.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ocr::{OcrOperation, OcrPoll, OcrText};

/// An OCR provider with two tiers.
///
/// Short documents go through [`recognize`](OcrProvider::recognize), which
/// returns text in one call. Longer documents are submitted as an
/// asynchronous operation against an already-uploaded blob; the provider
/// writes JSON output shards under `output_prefix` in the same bucket and
/// the caller collects them once [`poll`](OcrProvider::poll) reports
/// [`OcrPoll::Done`].
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Synchronous tier: recognize text from inline PDF bytes.
    async fn recognize(&self, pdf_bytes: &[u8]) -> Result<OcrText>;

    /// Asynchronous tier: submit an operation reading `input_path` and
    /// writing shards under `output_prefix`. Returns the operation handle.
    async fn submit(&self, input_path: &str, output_prefix: &str) -> Result<OcrOperation>;

    /// Poll a previously submitted operation.
    async fn poll(&self, operation: &OcrOperation) -> Result<OcrPoll>;
}
