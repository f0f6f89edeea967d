//! OCR provider types.

use serde::{Deserialize, Serialize};

/// Recognized text from a synchronous OCR call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrText {
    pub text: String,
    /// Mean per-character confidence in [0, 1] when the provider reports
    /// one. Absent for tiers that do not expose confidences.
    pub confidence: Option<f64>,
}

impl OcrText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
        }
    }
}

/// Handle to a running asynchronous OCR operation.
///
/// The operation name is opaque provider state; it is persisted on the job
/// so a later attempt resumes polling instead of resubmitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrOperation {
    pub name: String,
}

/// Poll result for an asynchronous OCR operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcrPoll {
    /// Still running; poll again later.
    Running,
    /// Finished; output shards are available under the submitted prefix.
    Done,
    /// Terminally failed. Resubmission is permitted.
    Failed { message: String },
}

impl OcrPoll {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OcrPoll::Running)
    }
}
