//! The job lifecycle engine.
//!
//! One invocation drives a single job as far as it can: claim the lock in
//! a CAS read-modify-write, run the OCR → sanitize → LLM stages with
//! write-once stage markers, commit the terminal transition, clean up
//! blobs. Every persisted write re-checks lock ownership, so racing
//! workers and duplicate task deliveries are safe: at most one worker
//! makes progress on a job at a time, and everyone else exits silently.

use std::time::Duration as StdDuration;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use extraction::ocr::shard_text;
use extraction::sanitize::{sanitize, SanitizeConfig};
use extraction::types::ocr::{OcrOperation, OcrPoll, OcrText};
use extraction::{confidence, parser, ExtractionError, InvoiceRecord};

use super::job::{Job, JobStatus, ProcessingLock};
use crate::config::Config;
use crate::kernel::deps::ServerDeps;
use crate::kernel::dispatcher::TaskHandler;
use crate::kernel::store::{VersionedJob, WriteOutcome};

/// CAS retries inside one gated write before conceding the job.
const GATED_WRITE_RETRIES: u32 = 3;

/// Engine tuning. Everything here is per-process.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Worker id recorded in the lock.
    pub worker_id: String,
    pub heartbeat_interval: StdDuration,
    /// First async-OCR poll delay; doubles up to `ocr_poll_max`.
    pub ocr_poll_initial: StdDuration,
    pub ocr_poll_max: StdDuration,
    /// Budget for the OCR stage within one attempt.
    pub ocr_stage_timeout: StdDuration,
    /// Budget for the whole attempt (worker callback duration cap).
    pub attempt_budget: StdDuration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            heartbeat_interval: StdDuration::from_secs(config.heartbeat_interval_secs),
            ocr_poll_initial: StdDuration::from_secs(2),
            ocr_poll_max: StdDuration::from_secs(20),
            ocr_stage_timeout: StdDuration::from_secs(600),
            attempt_budget: StdDuration::from_secs(config.attempt_budget_secs),
        }
    }

    /// Locks older than this (by liveness timestamp) may be taken over.
    pub fn stale_after(&self) -> Duration {
        stale_threshold(self.heartbeat_interval)
    }
}

/// Stale-lock threshold: ten minutes or three missed heartbeats,
/// whichever is larger.
pub fn stale_threshold(heartbeat_interval: StdDuration) -> Duration {
    let three_heartbeats =
        Duration::from_std(heartbeat_interval * 3).unwrap_or_else(|_| Duration::minutes(10));
    three_heartbeats.max(Duration::minutes(10))
}

/// How one delivery ended. All variants are success to the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Terminal `done` committed by this invocation.
    Completed,
    /// Job was already `done` or `failed`; idempotent no-op.
    AlreadyTerminal,
    /// Another worker holds a fresh lock or won a race; no-op.
    Contended,
    /// Job document is gone (session deleted); no-op.
    NotFound,
    /// Permanent failure recorded on the job.
    Failed,
}

/// Errors surfaced to the worker route. Only transient external failures
/// land here; the queue redelivers on the resulting 503.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("external dependency failed: {0}")]
    External(#[source] anyhow::Error),
}

/// Internal stage control flow.
enum StageError {
    /// Lock ownership lost; exit without error.
    LockLost,
    /// Transient external failure; leave the lock for stale takeover.
    Transient(anyhow::Error),
    /// Permanent failure; job transitions to `failed`.
    Permanent(String),
}

fn classify(e: ExtractionError) -> StageError {
    if e.is_transient() {
        StageError::Transient(anyhow::Error::new(e))
    } else {
        StageError::Permanent(e.to_string())
    }
}

pub struct ProcessingEngine {
    deps: ServerDeps,
    settings: EngineSettings,
}

impl ProcessingEngine {
    pub fn new(deps: ServerDeps, settings: EngineSettings) -> Self {
        Self { deps, settings }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    fn sanitize_config(&self) -> SanitizeConfig {
        SanitizeConfig {
            max_chars: self.deps.config.preprocess_max_chars,
            strip_top: self.deps.config.zone_strip_top,
            strip_bottom: self.deps.config.zone_strip_bottom,
        }
    }

    /// Process one task delivery for `job_id`.
    pub async fn process(
        &self,
        job_id: Uuid,
        session_id: Uuid,
    ) -> Result<ProcessOutcome, EngineError> {
        let mut current = match self.claim(job_id).await? {
            Claim::Claimed(vjob) => vjob,
            Claim::NoOp(outcome) => {
                debug!(%job_id, ?outcome, "delivery is a no-op");
                return Ok(outcome);
            }
        };

        if current.job.session_id != session_id {
            warn!(%job_id, payload_session = %session_id, "task payload session mismatch");
        }

        let attempt = current.job.attempt;
        info!(
            %job_id,
            worker_id = %self.settings.worker_id,
            attempt,
            "claimed job"
        );

        let deadline = Instant::now() + self.settings.attempt_budget;

        // Background liveness writes while the stages run.
        let cancel = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(job_id, cancel.clone());

        let result = self.run_stages(&mut current, deadline).await;

        cancel.cancel();
        let _ = heartbeat.await;

        match result {
            Ok(()) => {
                info!(%job_id, attempt, "job done");
                self.cleanup_input_blob(&current.job).await;
                Ok(ProcessOutcome::Completed)
            }
            Err(StageError::LockLost) => {
                info!(%job_id, "lock lost mid-attempt; yielding to the new holder");
                Ok(ProcessOutcome::Contended)
            }
            Err(StageError::Transient(e)) => {
                // Leave the lock in place: redelivery observes it stale and
                // resumes from the persisted markers.
                warn!(%job_id, error = %e, "transient failure; deferring to redelivery");
                Err(EngineError::External(e))
            }
            Err(StageError::Permanent(message)) => {
                warn!(%job_id, error = %message, "permanent failure");
                self.mark_failed(&mut current, &message).await;
                Ok(ProcessOutcome::Failed)
            }
        }
    }

    // =========================================================================
    // Lock acquisition
    // =========================================================================

    async fn claim(&self, job_id: Uuid) -> Result<Claim, EngineError> {
        let read = self
            .deps
            .job_store
            .get(job_id)
            .await
            .map_err(EngineError::External)?;

        let Some(vjob) = read else {
            // Redelivery for a deleted job is expected; succeed silently.
            return Ok(Claim::NoOp(ProcessOutcome::NotFound));
        };

        if vjob.job.status.is_terminal() {
            return Ok(Claim::NoOp(ProcessOutcome::AlreadyTerminal));
        }

        let now = self.deps.clock.now();
        if let Some(lock) = &vjob.job.processing_lock {
            let fresh = !vjob.job.lock_is_stale(now, self.settings.stale_after());
            if fresh && lock.locked_by != self.settings.worker_id {
                return Ok(Claim::NoOp(ProcessOutcome::Contended));
            }
        }

        let mut job = vjob.job.clone();
        job.processing_lock = Some(ProcessingLock {
            locked_by: self.settings.worker_id.clone(),
            locked_at: now,
        });
        job.attempt += 1;
        job.status = JobStatus::Processing;
        job.stamp_stage(JobStatus::Processing, now);
        job.updated_at = now;

        match self
            .deps
            .job_store
            .update(&job, vjob.version)
            .await
            .map_err(EngineError::External)?
        {
            WriteOutcome::Committed => Ok(Claim::Claimed(VersionedJob {
                job,
                version: vjob.version + 1,
            })),
            // At-most-once progress per delivery: a losing race is success.
            WriteOutcome::Conflict => Ok(Claim::NoOp(ProcessOutcome::Contended)),
            WriteOutcome::Missing => Ok(Claim::NoOp(ProcessOutcome::NotFound)),
        }
    }

    // =========================================================================
    // Stages
    // =========================================================================

    async fn run_stages(
        &self,
        current: &mut VersionedJob,
        deadline: Instant,
    ) -> Result<(), StageError> {
        let (record, ocr_quality) = match current.job.result_json.clone() {
            // A prior attempt already extracted; never re-invoke the LLM.
            Some(record) => (record, None),
            None => {
                let ocr_text = self.ocr_stage(current, deadline).await?;
                let sanitized = sanitize(
                    &ocr_text.text,
                    current.job.page_count,
                    &self.sanitize_config(),
                );

                self.transition(current, JobStatus::Llm).await?;
                let record = self.llm_stage(&sanitized).await?;
                (record, ocr_text.confidence)
            }
        };

        let score = confidence::score(&record, ocr_quality);

        self.gated(current, move |job, now| {
            if job.result_json.is_none() {
                job.result_json = Some(record.clone());
            }
            job.confidence_score = Some(score);
            job.stamp_stage(JobStatus::Llm, now);
            job.stamp_stage(JobStatus::Done, now);
            job.status = JobStatus::Done;
            job.processing_lock = None;
        })
        .await
    }

    async fn ocr_stage(
        &self,
        current: &mut VersionedJob,
        deadline: Instant,
    ) -> Result<OcrText, StageError> {
        if current.job.page_count <= self.deps.config.ocr_sync_max_pages {
            return self.ocr_sync(current).await;
        }
        self.ocr_async(current, deadline).await
    }

    async fn ocr_sync(&self, current: &mut VersionedJob) -> Result<OcrText, StageError> {
        let bytes = self
            .deps
            .blob_store
            .get(&current.job.blob_path)
            .await
            .map_err(StageError::Transient)?
            .ok_or_else(|| StageError::Permanent("input file is gone".to_string()))?;

        let text = self
            .deps
            .ocr
            .recognize(&bytes)
            .await
            .map_err(classify)?;

        self.transition(current, JobStatus::Extracting).await?;
        Ok(text)
    }

    async fn ocr_async(
        &self,
        current: &mut VersionedJob,
        deadline: Instant,
    ) -> Result<OcrText, StageError> {
        let job_id = current.job.id;
        let output_prefix = format!("vision/{job_id}/");

        let operation = match current.job.ocr_operation_name.clone() {
            // Resume: never race a resubmit against a pending operation.
            Some(name) => {
                debug!(%job_id, operation = %name, "resuming OCR operation");
                OcrOperation { name }
            }
            None => {
                let input_exists = self
                    .deps
                    .blob_store
                    .exists(&current.job.blob_path)
                    .await
                    .map_err(StageError::Transient)?;
                if !input_exists {
                    return Err(StageError::Permanent("input file is gone".to_string()));
                }

                let operation = self
                    .deps
                    .ocr
                    .submit(&current.job.blob_path, &output_prefix)
                    .await
                    .map_err(classify)?;

                // Persist the handle before the first poll: a crash after
                // this point resumes instead of resubmitting.
                let name = operation.name.clone();
                self.gated(current, move |job, now| {
                    job.ocr_operation_name = Some(name.clone());
                    if job.status.rank() < JobStatus::Extracting.rank() {
                        job.status = JobStatus::Extracting;
                    }
                    job.stamp_stage(JobStatus::Extracting, now);
                })
                .await?;
                operation
            }
        };

        // Resumed attempts re-enter as `processing`; move forward again.
        self.transition(current, JobStatus::Extracting).await?;

        let poll_deadline = deadline.min(Instant::now() + self.settings.ocr_stage_timeout);
        let mut delay = self.settings.ocr_poll_initial;
        loop {
            match self.deps.ocr.poll(&operation).await.map_err(classify)? {
                OcrPoll::Done => break,
                OcrPoll::Failed { message } => {
                    // Known-terminal-failed: clear the handle so a retry
                    // is allowed to submit a new operation.
                    self.gated(current, |job, _now| {
                        job.ocr_operation_name = None;
                    })
                    .await?;
                    return Err(StageError::Permanent(format!(
                        "ocr operation failed: {message}"
                    )));
                }
                OcrPoll::Running => {
                    if Instant::now() + delay > poll_deadline {
                        return Err(StageError::Transient(anyhow!(
                            "ocr operation still running at stage budget"
                        )));
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.settings.ocr_poll_max);
                }
            }
        }

        let text = self.collect_shards(&output_prefix).await?;

        self.gated(current, |job, _now| {
            job.ocr_operation_name = None;
        })
        .await?;

        Ok(OcrText {
            text,
            confidence: None,
        })
    }

    /// Read, concatenate and delete the async-tier output shards.
    async fn collect_shards(&self, prefix: &str) -> Result<String, StageError> {
        let paths = self
            .deps
            .blob_store
            .list(prefix)
            .await
            .map_err(StageError::Transient)?;

        let mut text = String::new();
        for path in &paths {
            let Some(bytes) = self
                .deps
                .blob_store
                .get(path)
                .await
                .map_err(StageError::Transient)?
            else {
                continue;
            };
            let shard = shard_text(&bytes)
                .map_err(|e| StageError::Permanent(format!("unreadable ocr output: {e}")))?;
            if !text.is_empty() && !shard.is_empty() {
                text.push('\n');
            }
            text.push_str(&shard);
        }

        // Intermediates are owned by this attempt; drop them before unlock.
        for path in &paths {
            if let Err(e) = self.deps.blob_store.delete(path).await {
                warn!(path, error = %e, "failed to delete OCR intermediate");
            }
        }

        Ok(text)
    }

    async fn llm_stage(&self, text: &str) -> Result<InvoiceRecord, StageError> {
        let prompt_version = &self.deps.config.llm_prompt_version;
        let primary = &self.deps.llm_primary;
        let fallback = &self.deps.llm_fallback;

        // One attempt per provider within the stage; HTTP-level retries
        // live in the clients.
        match primary.extract(text, prompt_version).await {
            Ok(reply) => match parser::parse_invoice(primary.provider(), &reply) {
                Ok(record) => return Ok(record),
                Err(e) => warn!(provider = primary.provider(), error = %e, "unparseable primary reply"),
            },
            Err(e) => warn!(provider = primary.provider(), error = %e, "primary LLM failed"),
        }

        match fallback.extract(text, prompt_version).await {
            Ok(reply) => parser::parse_invoice(fallback.provider(), &reply)
                .map_err(|e| StageError::Permanent(e.to_string())),
            Err(e) => Err(classify(e)),
        }
    }

    // =========================================================================
    // Gated writes
    // =========================================================================

    /// Forward a status if the job has not moved past it, and stamp its
    /// stage marker.
    async fn transition(
        &self,
        current: &mut VersionedJob,
        to: JobStatus,
    ) -> Result<(), StageError> {
        self.gated(current, move |job, now| {
            if job.status.rank() < to.rank() {
                job.status = to;
            }
            job.stamp_stage(to, now);
        })
        .await
    }

    /// CAS write that only commits while this worker still owns the lock.
    ///
    /// Every attempt re-reads the document and mutates the fresh copy.
    /// Heartbeats advance `heartbeatAt` without bumping the version, so a
    /// write built from an older snapshot would pass the CAS check and
    /// revert them — making the lock look stale and inviting a takeover
    /// mid-attempt. A conflict after the fresh read means another writer
    /// touched the document; re-check ownership and retry.
    async fn gated<F>(&self, current: &mut VersionedJob, mutate: F) -> Result<(), StageError>
    where
        F: Fn(&mut Job, DateTime<Utc>),
    {
        let job_id = current.job.id;

        for _ in 0..GATED_WRITE_RETRIES {
            let fresh = self
                .deps
                .job_store
                .get(job_id)
                .await
                .map_err(StageError::Transient)?;
            let Some(vjob) = fresh else {
                return Err(StageError::LockLost);
            };
            if !vjob.job.holds_lock(&self.settings.worker_id) {
                return Err(StageError::LockLost);
            }
            *current = vjob;

            let now = self.deps.clock.now();
            let mut job = current.job.clone();
            mutate(&mut job, now);
            job.updated_at = now;

            match self
                .deps
                .job_store
                .update(&job, current.version)
                .await
                .map_err(StageError::Transient)?
            {
                WriteOutcome::Committed => {
                    current.job = job;
                    current.version += 1;
                    return Ok(());
                }
                WriteOutcome::Missing => return Err(StageError::LockLost),
                WriteOutcome::Conflict => continue,
            }
        }

        // Persistent conflicts: someone else is writing; concede.
        Err(StageError::LockLost)
    }

    async fn mark_failed(&self, current: &mut VersionedJob, message: &str) {
        let message = message.to_string();
        let result = self
            .gated(current, move |job, now| {
                job.status = JobStatus::Failed;
                job.error = Some(message.clone());
                job.stamp_stage(JobStatus::Failed, now);
                job.processing_lock = None;
            })
            .await;

        match result {
            Ok(()) => {}
            Err(StageError::LockLost) => {
                info!(job_id = %current.job.id, "lock lost while recording failure");
            }
            Err(StageError::Transient(e)) => {
                warn!(job_id = %current.job.id, error = %e, "could not record failure; redelivery will retry");
            }
            Err(StageError::Permanent(e)) => {
                warn!(job_id = %current.job.id, error = %e, "could not record failure");
            }
        }
    }

    // =========================================================================
    // Heartbeat & cleanup
    // =========================================================================

    fn spawn_heartbeat(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.deps.job_store.clone();
        let clock = self.deps.clock.clone();
        let worker_id = self.settings.worker_id.clone();
        let interval = self.settings.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.heartbeat(job_id, &worker_id, clock.now()).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(%job_id, "heartbeat skipped: lock no longer held");
                            }
                            Err(e) => warn!(%job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }

    /// Best-effort input blob delete after `done`. Failures never regress
    /// the committed status; retention sweeps leftovers.
    async fn cleanup_input_blob(&self, job: &Job) {
        if let Err(e) = self.deps.blob_store.delete(&job.blob_path).await {
            warn!(job_id = %job.id, error = %e, "input blob cleanup failed");
        }
    }
}

enum Claim {
    Claimed(VersionedJob),
    NoOp(ProcessOutcome),
}

#[async_trait::async_trait]
impl TaskHandler for ProcessingEngine {
    async fn handle(&self, job_id: Uuid, session_id: Uuid) {
        match self.process(job_id, session_id).await {
            Ok(outcome) => debug!(%job_id, ?outcome, "emulated task finished"),
            Err(e) => warn!(%job_id, error = %e, "emulated task failed; job awaits retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::blob_store::BlobStore;
    use crate::kernel::clock::Clock;
    use crate::kernel::store::JobStore;
    use crate::kernel::test_dependencies::{TestDependencies, INVOICE_FIXTURE};
    use bytes::Bytes;
    use extraction::testing::{StubLlm, StubOcr, StubOcrCall};
    use std::sync::Arc;

    fn engine(t: &TestDependencies) -> ProcessingEngine {
        let settings = EngineSettings {
            worker_id: "test-worker".to_string(),
            heartbeat_interval: StdDuration::from_secs(30),
            ocr_poll_initial: StdDuration::from_millis(1),
            ocr_poll_max: StdDuration::from_millis(2),
            ocr_stage_timeout: StdDuration::from_secs(5),
            attempt_budget: StdDuration::from_secs(30),
        };
        ProcessingEngine::new(t.deps.clone(), settings)
    }

    /// Insert a queued job with its input blob present.
    async fn seed_job(t: &TestDependencies, page_count: u32) -> Job {
        let now = t.clock.now();
        let job_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let blob_path = format!("uploads/{session_id}/{job_id}.pdf");

        t.blobs
            .put(&blob_path, Bytes::from_static(b"%PDF-1.4 test"))
            .await
            .unwrap();

        let mut job = Job::builder()
            .id(job_id)
            .session_id(session_id)
            .filename("a.pdf")
            .size_bytes(13u64)
            .page_count(page_count)
            .blob_path(blob_path)
            .created_at(now)
            .updated_at(now)
            .build();
        job.status = JobStatus::Queued;
        job.stamp_stage(JobStatus::Uploaded, now);
        job.stamp_stage(JobStatus::Queued, now);
        t.jobs.insert(&job).await.unwrap();
        job
    }

    async fn stored(t: &TestDependencies, job_id: Uuid) -> Job {
        t.jobs.get(job_id).await.unwrap().unwrap().job
    }

    #[tokio::test]
    async fn happy_path_sync_tier_completes() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        let job = seed_job(&t, 2).await;

        let outcome = engine.process(job.id, job.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let done = stored(&t, job.id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert!(done.processing_lock.is_none());
        assert_eq!(done.attempt, 1);

        let record = done.result_json.clone().unwrap();
        assert_eq!(record.invoice_number, "INV-001");
        let score = done.confidence_score.unwrap();
        assert!((0.0..=1.0).contains(&score));

        // Sync tier was used.
        assert_eq!(t.ocr.calls(), vec![StubOcrCall::Recognize]);

        // Stage markers exist and are non-decreasing along the order.
        let order = [
            JobStatus::Uploaded,
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Extracting,
            JobStatus::Llm,
            JobStatus::Done,
        ];
        for pair in order.windows(2) {
            let earlier = done.stage_at(pair[0]).unwrap();
            let later = done.stage_at(pair[1]).unwrap();
            assert!(earlier <= later, "{:?} after {:?}", pair[0], pair[1]);
        }

        // Input blob cleaned up after the terminal commit.
        assert!(!t.blobs.exists(&done.blob_path).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_jobs_are_idempotent_no_ops() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        let job = seed_job(&t, 2).await;

        assert_eq!(
            engine.process(job.id, job.session_id).await.unwrap(),
            ProcessOutcome::Completed
        );
        let first = stored(&t, job.id).await;

        // Duplicate delivery: same terminal state, no extra work.
        assert_eq!(
            engine.process(job.id, job.session_id).await.unwrap(),
            ProcessOutcome::AlreadyTerminal
        );
        let second = stored(&t, job.id).await;

        assert_eq!(second.attempt, first.attempt);
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(second.result_json, first.result_json);
        assert_eq!(t.primary.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_a_silent_no_op() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        assert_eq!(
            engine
                .process(Uuid::new_v4(), Uuid::new_v4())
                .await
                .unwrap(),
            ProcessOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn fresh_foreign_lock_is_contended() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        let seeded = seed_job(&t, 2).await;

        let versioned = t.jobs.get(seeded.id).await.unwrap().unwrap();
        let mut locked = versioned.job.clone();
        locked.processing_lock = Some(ProcessingLock {
            locked_by: "other-worker".to_string(),
            locked_at: t.clock.now(),
        });
        locked.status = JobStatus::Processing;
        locked.attempt = 1;
        t.jobs.update(&locked, versioned.version).await.unwrap();

        assert_eq!(
            engine.process(seeded.id, seeded.session_id).await.unwrap(),
            ProcessOutcome::Contended
        );

        let after = stored(&t, seeded.id).await;
        assert_eq!(after.attempt, 1);
        assert_eq!(after.locked_by(), Some("other-worker"));
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over_and_async_ocr_resumes() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        let seeded = seed_job(&t, 10).await;

        // A crashed worker left a lock and a submitted operation behind.
        let versioned = t.jobs.get(seeded.id).await.unwrap().unwrap();
        let mut crashed = versioned.job.clone();
        crashed.status = JobStatus::Extracting;
        crashed.attempt = 1;
        crashed.ocr_operation_name = Some(t.ocr.operation_name().to_string());
        crashed.processing_lock = Some(ProcessingLock {
            locked_by: "crashed-worker".to_string(),
            locked_at: t.clock.now() - Duration::minutes(30),
        });
        crashed.stamp_stage(JobStatus::Processing, t.clock.now() - Duration::minutes(30));
        crashed.stamp_stage(JobStatus::Extracting, t.clock.now() - Duration::minutes(30));
        t.jobs.update(&crashed, versioned.version).await.unwrap();

        // The finished operation's output shard is waiting in the bucket.
        let shard_path = format!("vision/{}/output-1.json", seeded.id);
        t.blobs
            .put(
                &shard_path,
                Bytes::from_static(
                    br#"{"responses":[{"fullTextAnnotation":{"text":"Invoice INV-001"}}]}"#,
                ),
            )
            .await
            .unwrap();

        let outcome = engine.process(seeded.id, seeded.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let done = stored(&t, seeded.id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.attempt, 2);
        assert!(done.ocr_operation_name.is_none());

        // Resumed, not resubmitted.
        assert_eq!(t.ocr.submit_count(), 0);
        assert!(t
            .ocr
            .calls()
            .iter()
            .any(|c| matches!(c, StubOcrCall::Poll { .. })));

        // Intermediate shards were cleaned up.
        assert!(!t.blobs.exists(&shard_path).await.unwrap());
    }

    #[tokio::test]
    async fn async_tier_submits_once_and_persists_the_operation() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        let seeded = seed_job(&t, 10).await;

        // Operation completes immediately; provider wrote one shard.
        let shard_path = format!("vision/{}/output-1.json", seeded.id);
        t.blobs
            .put(
                &shard_path,
                Bytes::from_static(
                    br#"{"responses":[{"fullTextAnnotation":{"text":"Invoice INV-001"}}]}"#,
                ),
            )
            .await
            .unwrap();

        let outcome = engine.process(seeded.id, seeded.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);
        assert_eq!(t.ocr.submit_count(), 1);
    }

    #[tokio::test]
    async fn primary_llm_failure_falls_back() {
        let t = TestDependencies::build(
            crate::kernel::test_dependencies::test_config(),
            Arc::new(StubOcr::new("Invoice INV-001")),
            Arc::new(StubLlm::new("gemini", INVOICE_FIXTURE).failing_first(100)),
            Arc::new(StubLlm::new("openai", INVOICE_FIXTURE)),
        );
        let engine = engine(&t);
        let job = seed_job(&t, 2).await;

        let outcome = engine.process(job.id, job.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let done = stored(&t, job.id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.result_json.unwrap().invoice_number, "INV-001");
        assert_eq!(t.primary.call_count(), 1);
        assert_eq!(t.fallback.call_count(), 1);
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn unparseable_replies_from_both_providers_fail_permanently() {
        let t = TestDependencies::build(
            crate::kernel::test_dependencies::test_config(),
            Arc::new(StubOcr::new("Invoice INV-001")),
            Arc::new(StubLlm::new("gemini", "no json here")),
            Arc::new(StubLlm::new("openai", "also not json")),
        );
        let engine = engine(&t);
        let job = seed_job(&t, 2).await;

        let outcome = engine.process(job.id, job.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);

        let failed = stored(&t, job.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.clone().unwrap().contains("unparseable"));
        assert!(failed.processing_lock.is_none());
        assert!(failed.stage_at(JobStatus::Failed).is_some());
        assert!(failed.result_json.is_none());
    }

    #[tokio::test]
    async fn existing_result_skips_ocr_and_llm() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        let seeded = seed_job(&t, 2).await;

        let versioned = t.jobs.get(seeded.id).await.unwrap().unwrap();
        let mut with_result = versioned.job.clone();
        with_result.result_json =
            Some(extraction::parser::parse_invoice("fixture", INVOICE_FIXTURE).unwrap());
        t.jobs.update(&with_result, versioned.version).await.unwrap();

        let outcome = engine.process(seeded.id, seeded.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        let done = stored(&t, seeded.id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert!(t.ocr.calls().is_empty());
        assert_eq!(t.primary.call_count(), 0);
        assert_eq!(t.fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn terminal_ocr_operation_failure_clears_the_handle() {
        let t = TestDependencies::build(
            crate::kernel::test_dependencies::test_config(),
            Arc::new(StubOcr::new("unused").with_operation_failure("document too noisy")),
            Arc::new(StubLlm::new("gemini", INVOICE_FIXTURE)),
            Arc::new(StubLlm::new("openai", INVOICE_FIXTURE)),
        );
        let engine = engine(&t);
        let job = seed_job(&t, 10).await;

        let outcome = engine.process(job.id, job.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);

        let failed = stored(&t, job.id).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.ocr_operation_name.is_none());
        assert!(failed.error.unwrap().contains("ocr operation failed"));
    }

    /// Store wrapper that lands a heartbeat right before every read, the
    /// way the background heartbeat task interleaves with staged writes.
    struct HeartbeatingStore {
        inner: Arc<crate::kernel::stores::memory::MemoryJobStore>,
        clock: Arc<crate::kernel::clock::ManualClock>,
        worker_id: String,
    }

    #[async_trait::async_trait]
    impl JobStore for HeartbeatingStore {
        async fn insert(&self, job: &Job) -> anyhow::Result<()> {
            self.inner.insert(job).await
        }

        async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<VersionedJob>> {
            self.clock.advance(Duration::seconds(31));
            let _ = self
                .inner
                .heartbeat(job_id, &self.worker_id, self.clock.now())
                .await?;
            self.inner.get(job_id).await
        }

        async fn update(&self, job: &Job, expected_version: i64) -> anyhow::Result<WriteOutcome> {
            self.inner.update(job, expected_version).await
        }

        async fn heartbeat(
            &self,
            job_id: Uuid,
            worker_id: &str,
            at: DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            self.inner.heartbeat(job_id, worker_id, at).await
        }

        async fn delete(&self, job_id: Uuid) -> anyhow::Result<bool> {
            self.inner.delete(job_id).await
        }

        async fn list_by_session(&self, session_id: Uuid) -> anyhow::Result<Vec<Job>> {
            self.inner.list_by_session(session_id).await
        }

        async fn list_done_by_session(&self, session_id: Uuid) -> anyhow::Result<Vec<Job>> {
            self.inner.list_done_by_session(session_id).await
        }

        async fn list_created_before(
            &self,
            cutoff: DateTime<Utc>,
            limit: usize,
        ) -> anyhow::Result<Vec<Job>> {
            self.inner.list_created_before(cutoff, limit).await
        }
    }

    #[tokio::test]
    async fn staged_writes_never_revert_interleaved_heartbeats() {
        let t = TestDependencies::new();
        let mut deps = t.deps.clone();
        deps.job_store = Arc::new(HeartbeatingStore {
            inner: t.jobs.clone(),
            clock: t.clock.clone(),
            worker_id: "test-worker".to_string(),
        });

        let settings = EngineSettings {
            worker_id: "test-worker".to_string(),
            heartbeat_interval: StdDuration::from_secs(30),
            ocr_poll_initial: StdDuration::from_millis(1),
            ocr_poll_max: StdDuration::from_millis(2),
            ocr_stage_timeout: StdDuration::from_secs(5),
            attempt_budget: StdDuration::from_secs(30),
        };
        let engine = ProcessingEngine::new(deps, settings);

        let job = seed_job(&t, 2).await;
        let outcome = engine.process(job.id, job.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);

        // The last heartbeat landed just before the terminal commit's
        // read; the commit must carry it forward, not write back the
        // stale snapshot from the previous staged write.
        let done = stored(&t, job.id).await;
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.heartbeat_at, Some(t.clock.now()));
    }

    #[tokio::test]
    async fn missing_input_blob_fails_permanently() {
        let t = TestDependencies::new();
        let engine = engine(&t);
        let job = seed_job(&t, 2).await;
        t.blobs.delete(&job.blob_path).await.unwrap();

        let outcome = engine.process(job.id, job.session_id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Failed);
        let failed = stored(&t, job.id).await;
        assert!(failed.error.unwrap().contains("input file is gone"));
    }
}
