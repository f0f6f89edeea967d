//! Testing utilities including stub implementations.
//!
//! These are useful for testing applications that use the extraction
//! library without making real OCR or LLM calls. Stubs are deterministic
//! and record their calls for assertions.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{ExtractionError, Result};
use crate::traits::auth::TokenSource;
use crate::traits::llm::InvoiceLlm;
use crate::traits::ocr::OcrProvider;
use crate::types::ocr::{OcrOperation, OcrPoll, OcrText};

// =============================================================================
// StubLlm
// =============================================================================

/// A stub LLM returning a canned reply, with optional failure injection.
pub struct StubLlm {
    provider: &'static str,
    reply: Mutex<String>,
    /// Calls that fail with a 500 before replies start succeeding.
    fail_first: AtomicU32,
    calls: AtomicU32,
}

impl StubLlm {
    pub fn new(provider: &'static str, reply: impl Into<String>) -> Self {
        Self {
            provider,
            reply: Mutex::new(reply.into()),
            fail_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` calls with a provider 500.
    pub fn failing_first(self, n: u32) -> Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Replace the canned reply.
    pub fn set_reply(&self, reply: impl Into<String>) {
        *self.reply.lock().unwrap() = reply.into();
    }

    /// Number of extract calls made so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoiceLlm for StubLlm {
    fn provider(&self) -> &'static str {
        self.provider
    }

    async fn extract(&self, _text: &str, _prompt_version: &str) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first.load(Ordering::SeqCst) {
            return Err(ExtractionError::LlmUnavailable {
                provider: self.provider,
                status: 500,
            });
        }
        Ok(self.reply.lock().unwrap().clone())
    }
}

// =============================================================================
// StubOcr
// =============================================================================

/// Record of a call made to the stub OCR provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubOcrCall {
    Recognize,
    Submit { input_path: String },
    Poll { operation: String },
}

/// A stub OCR provider.
///
/// The sync tier returns canned text. The async tier hands out a fixed
/// operation name and reports `Running` for a configurable number of polls
/// before `Done` (or a terminal failure).
pub struct StubOcr {
    sync_text: Mutex<OcrText>,
    operation_name: String,
    polls_until_done: AtomicU32,
    fail_operation: Mutex<Option<String>>,
    calls: Mutex<Vec<StubOcrCall>>,
}

impl Default for StubOcr {
    fn default() -> Self {
        Self::new("stub text")
    }
}

impl StubOcr {
    pub fn new(sync_text: impl Into<String>) -> Self {
        Self {
            sync_text: Mutex::new(OcrText::new(sync_text)),
            operation_name: "operations/stub-op-1".to_string(),
            polls_until_done: AtomicU32::new(0),
            fail_operation: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Report a sync-tier confidence.
    pub fn with_confidence(self, confidence: f64) -> Self {
        self.sync_text.lock().unwrap().confidence = Some(confidence);
        self
    }

    /// Require `n` polls before the async operation completes.
    pub fn with_polls_until_done(self, n: u32) -> Self {
        self.polls_until_done.store(n, Ordering::SeqCst);
        self
    }

    /// Make the async operation fail terminally with `message`.
    pub fn with_operation_failure(self, message: impl Into<String>) -> Self {
        *self.fail_operation.lock().unwrap() = Some(message.into());
        self
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn calls(&self) -> Vec<StubOcrCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StubOcrCall::Submit { .. }))
            .count()
    }

    fn record(&self, call: StubOcrCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl OcrProvider for StubOcr {
    async fn recognize(&self, _pdf_bytes: &[u8]) -> Result<OcrText> {
        self.record(StubOcrCall::Recognize);
        Ok(self.sync_text.lock().unwrap().clone())
    }

    async fn submit(&self, input_path: &str, _output_prefix: &str) -> Result<OcrOperation> {
        self.record(StubOcrCall::Submit {
            input_path: input_path.to_string(),
        });
        Ok(OcrOperation {
            name: self.operation_name.clone(),
        })
    }

    async fn poll(&self, operation: &OcrOperation) -> Result<OcrPoll> {
        self.record(StubOcrCall::Poll {
            operation: operation.name.clone(),
        });

        if let Some(message) = self.fail_operation.lock().unwrap().clone() {
            return Ok(OcrPoll::Failed { message });
        }

        let remaining = self.polls_until_done.load(Ordering::SeqCst);
        if remaining > 0 {
            self.polls_until_done.store(remaining - 1, Ordering::SeqCst);
            return Ok(OcrPoll::Running);
        }
        Ok(OcrPoll::Done)
    }
}

// =============================================================================
// StaticTokenSource
// =============================================================================

/// A token source returning fixed tokens.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Default for StaticTokenSource {
    fn default() -> Self {
        Self::new("test-token")
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn identity_token(&self, _audience: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_llm_fails_then_succeeds() {
        let llm = StubLlm::new("stub", "{}").failing_first(2);
        assert!(llm.extract("x", "v2").await.is_err());
        assert!(llm.extract("x", "v2").await.is_err());
        assert!(llm.extract("x", "v2").await.is_ok());
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn stub_ocr_operation_lifecycle() {
        let ocr = StubOcr::new("text").with_polls_until_done(2);
        let op = ocr.submit("uploads/s/j.pdf", "vision/j/").await.unwrap();
        assert_eq!(ocr.poll(&op).await.unwrap(), OcrPoll::Running);
        assert_eq!(ocr.poll(&op).await.unwrap(), OcrPoll::Running);
        assert_eq!(ocr.poll(&op).await.unwrap(), OcrPoll::Done);
        assert_eq!(ocr.submit_count(), 1);
    }
}
