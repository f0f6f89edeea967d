//! LLM provider trait for structured invoice extraction.

use async_trait::async_trait;

use crate::error::Result;

/// A language-model provider that turns sanitized invoice text into a raw
/// JSON reply.
///
/// Implementations own their transport concerns (timeouts, bounded retries
/// with jittered backoff). The reply is raw provider output; the caller
/// parses it with the tolerant parser in [`crate::parser`].
#[async_trait]
pub trait InvoiceLlm: Send + Sync {
    /// Stable provider name for logs and error messages.
    fn provider(&self) -> &'static str;

    /// Extract an invoice from sanitized document text.
    ///
    /// `prompt_version` pins the prompt template so results stay comparable
    /// across deployments.
    async fn extract(&self, text: &str, prompt_version: &str) -> Result<String>;
}
