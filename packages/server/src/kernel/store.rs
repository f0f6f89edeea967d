//! Storage traits for job documents and rate-limit state.
//!
//! The job store is a transactional document store: every mutation is an
//! optimistic compare-and-swap on a per-document version, which is the
//! primitive the lifecycle lock protocol is built on.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domains::invoices::job::Job;

/// A job document together with its store version.
#[derive(Debug, Clone)]
pub struct VersionedJob {
    pub job: Job,
    pub version: i64,
}

/// Outcome of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write committed.
    Committed,
    /// Another writer got there first; re-read and re-decide.
    Conflict,
    /// The document no longer exists (e.g. session deleted mid-flight).
    Missing,
}

/// Transactional document store for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a fresh job document at version 1. Errors if the id exists.
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Option<VersionedJob>>;

    /// Compare-and-swap write: commits only when the stored version still
    /// equals `expected_version`.
    async fn update(&self, job: &Job, expected_version: i64) -> Result<WriteOutcome>;

    /// Liveness write by the lock holder. Does not bump the version, so it
    /// never conflicts with the holder's own staged writes. Returns false
    /// when the job is gone or the lock moved on.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Delete the document. Returns whether it existed.
    async fn delete(&self, job_id: Uuid) -> Result<bool>;

    /// All jobs of one session, `created_at` descending.
    async fn list_by_session(&self, session_id: Uuid) -> Result<Vec<Job>>;

    /// Done jobs of one session, `created_at` descending. Backed by the
    /// composite `(session_id, status, created_at)` index in the Postgres
    /// store.
    async fn list_done_by_session(&self, session_id: Uuid) -> Result<Vec<Job>>;

    /// Jobs older than `cutoff`, for the retention sweeper. Bounded.
    async fn list_created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;
}

/// Small-document store for rate-limit state (token buckets, daily
/// counters), also CAS-versioned.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Read a document and its version.
    async fn read(&self, key: &str) -> Result<Option<(serde_json::Value, i64)>>;

    /// Versioned write. `expected_version: None` inserts only when the key
    /// is absent. Returns false on conflict.
    async fn write(
        &self,
        key: &str,
        value: &serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<bool>;
}
