//! Job model: one PDF's processing lifecycle.

use chrono::{DateTime, Duration, Utc};
use extraction::InvoiceRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Job status. Transitions are forward-only; the single permitted
/// regression is `failed → queued` (or stale non-terminal → queued) via an
/// explicit client retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Uploaded,
    Queued,
    Processing,
    Extracting,
    Llm,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Position in the forward order; used by the forward-only gate.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Uploaded => 0,
            JobStatus::Queued => 1,
            JobStatus::Processing => 2,
            JobStatus::Extracting => 3,
            JobStatus::Llm => 4,
            JobStatus::Done => 5,
            JobStatus::Failed => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Extracting => "extracting",
            JobStatus::Llm => "llm",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker lock on a job. Holder-owned critical section; staleness is
/// judged on `max(locked_at, heartbeat_at)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingLock {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    pub id: Uuid,
    pub session_id: Uuid,

    // Input metadata
    pub filename: String,
    pub size_bytes: u64,
    pub page_count: u32,
    pub blob_path: String,

    // State
    #[builder(default)]
    pub status: JobStatus,
    /// Stage name → first wall-clock timestamp. Write-once per key.
    #[builder(default)]
    pub stages: BTreeMap<String, DateTime<Utc>>,
    #[builder(default)]
    pub processing_lock: Option<ProcessingLock>,
    /// Incremented on each lock acquisition.
    #[builder(default)]
    pub attempt: u32,
    /// User-initiated retries; capped by the facade.
    #[builder(default)]
    pub manual_retries: u32,

    // Resumable stage state
    #[builder(default)]
    pub ocr_operation_name: Option<String>,

    // Result
    #[builder(default)]
    pub result_json: Option<InvoiceRecord>,
    #[builder(default)]
    pub confidence_score: Option<f64>,
    #[builder(default)]
    pub error: Option<String>,

    // Liveness
    #[builder(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Stamp a stage timestamp; no-op when the stage was already stamped.
    pub fn stamp_stage(&mut self, stage: JobStatus, now: DateTime<Utc>) {
        self.stages.entry(stage.as_str().to_string()).or_insert(now);
    }

    pub fn stage_at(&self, stage: JobStatus) -> Option<DateTime<Utc>> {
        self.stages.get(stage.as_str()).copied()
    }

    /// Latest liveness signal of the lock holder.
    pub fn liveness(&self) -> Option<DateTime<Utc>> {
        let locked_at = self.processing_lock.as_ref().map(|l| l.locked_at);
        match (locked_at, self.heartbeat_at) {
            (Some(l), Some(h)) => Some(l.max(h)),
            (l, h) => l.or(h),
        }
    }

    /// Whether the current lock may be taken over.
    pub fn lock_is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        match self.liveness() {
            Some(live) => now - live >= stale_after,
            None => true,
        }
    }

    pub fn locked_by(&self) -> Option<&str> {
        self.processing_lock.as_ref().map(|l| l.locked_by.as_str())
    }

    pub fn holds_lock(&self, worker_id: &str) -> bool {
        self.locked_by() == Some(worker_id)
    }
}
