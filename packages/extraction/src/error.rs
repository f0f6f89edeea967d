//! Typed errors for the extraction library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;

/// Errors that can occur during extraction operations.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// OCR request failed
    #[error("OCR error: {0}")]
    Ocr(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// LLM provider rejected the request (client-side error, will not heal)
    #[error("LLM error ({provider}): {message}")]
    Llm {
        provider: &'static str,
        message: String,
    },

    /// LLM provider unavailable (5xx / throttled); worth retrying
    #[error("LLM unavailable ({provider}): HTTP {status}")]
    LlmUnavailable {
        provider: &'static str,
        status: u16,
    },

    /// LLM replied but the reply could not be parsed into an invoice record
    #[error("unparseable reply from {provider}: {reason}")]
    UnparseableReply {
        provider: &'static str,
        reason: String,
    },

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Per-call timeout exceeded
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Token acquisition failed
    #[error("auth token error: {0}")]
    Token(String),

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl ExtractionError {
    /// Whether a retry at the task-delivery level could plausibly succeed.
    ///
    /// Parse failures and configuration errors are permanent; transport
    /// failures and timeouts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExtractionError::Ocr(_)
                | ExtractionError::LlmUnavailable { .. }
                | ExtractionError::Http(_)
                | ExtractionError::Timeout(_)
                | ExtractionError::Token(_)
        )
    }
}

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractionError>;
