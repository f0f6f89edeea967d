//! Orchestration facade: upload intake, retry, listing, deletion.
//!
//! The HTTP layer is a thin adapter over this; everything here is
//! directly testable against in-memory stores and stub providers.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use extraction::InvoiceRecord;

use super::job::{Job, JobStatus};
use super::lifecycle::stale_threshold;
use crate::common::{ApiError, FileFailure};
use crate::kernel::deps::ServerDeps;
use crate::kernel::dispatcher::{DispatchMode, TaskDispatcher};
use crate::kernel::rate_limit::LimitAction;
use crate::kernel::store::WriteOutcome;

const MANUAL_RETRY_CAP: u32 = 3;
const PDF_MIME: &str = "application/pdf";

/// One file of a multipart upload.
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: Uuid,
    pub filename: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsInfo {
    pub max_files: usize,
    pub max_size_mb: u64,
    pub max_pages: u32,
    pub daily_jobs_per_session: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobsResponse {
    pub session_id: Uuid,
    pub jobs: Vec<JobSummary>,
    pub limits: LimitsInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<&'static str>,
}

/// Full per-job view for status polling.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stages: std::collections::BTreeMap<String, DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_json: Option<InvoiceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub size_bytes: u64,
    pub page_count: u32,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            stages: job.stages,
            result_json: job.result_json,
            confidence_score: job.confidence_score,
            error: job.error,
            size_bytes: job.size_bytes,
            page_count: job.page_count,
        }
    }
}

/// Lightweight projection for session listings.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProjection {
    pub job_id: Uuid,
    pub filename: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJobsResponse {
    pub session_id: Uuid,
    pub jobs: Vec<JobProjection>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteSessionResponse {
    pub session_id: Uuid,
    pub deleted: usize,
}

pub struct InvoiceFacade {
    deps: ServerDeps,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl InvoiceFacade {
    pub fn new(deps: ServerDeps, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self { deps, dispatcher }
    }

    pub fn limits(&self) -> LimitsInfo {
        let config = &self.deps.config;
        LimitsInfo {
            max_files: config.max_files,
            max_size_mb: config.max_size_mb,
            max_pages: config.max_pages,
            daily_jobs_per_session: config.daily_jobs_per_session,
        }
    }

    // =========================================================================
    // Upload intake
    // =========================================================================

    pub async fn create_upload_jobs(
        &self,
        session_id: Uuid,
        files: Vec<UploadedFile>,
        client_ip: Option<IpAddr>,
    ) -> Result<CreateJobsResponse, ApiError> {
        let config = self.deps.config.clone();

        if let Some(ip) = client_ip {
            self.deps.rate_limiter.check_ip(ip)?;
        }
        self.deps
            .rate_limiter
            .check_action(session_id, LimitAction::CreateJobs, 1.0)
            .await?;

        if files.is_empty() {
            return Err(ApiError::FileValidation {
                failures: vec![FileFailure {
                    filename: String::new(),
                    code: "noFiles",
                    detail: "at least one file is required".to_string(),
                }],
            });
        }
        if files.len() > config.max_files {
            return Err(ApiError::FileValidation {
                failures: vec![FileFailure {
                    filename: String::new(),
                    code: "tooManyFiles",
                    detail: format!("at most {} files per upload", config.max_files),
                }],
            });
        }

        self.deps
            .rate_limiter
            .check_daily(session_id, files.len() as u64)
            .await?;

        // Validate everything before touching storage.
        let mut failures = Vec::new();
        let mut valid = Vec::new();
        for file in files {
            match self.validate_file(&file) {
                Ok(page_count) => valid.push((file, page_count)),
                Err(failure) => failures.push(failure),
            }
        }

        if !failures.is_empty() && !(config.accept_partial && !valid.is_empty()) {
            return Err(ApiError::FileValidation { failures });
        }

        let mut jobs = Vec::new();
        let mut any_emulated = false;
        for (file, page_count) in valid {
            self.deps
                .rate_limiter
                .check_action(session_id, LimitAction::UploadFile, 1.0)
                .await?;

            let (summary, emulated) = self.admit_file(session_id, file, page_count).await?;
            any_emulated |= emulated;
            jobs.push(summary);
        }

        Ok(CreateJobsResponse {
            session_id,
            jobs,
            limits: self.limits(),
            note: any_emulated.then_some("emulation"),
        })
    }

    fn validate_file(&self, file: &UploadedFile) -> Result<u32, FileFailure> {
        let config = &self.deps.config;

        if file.content_type != PDF_MIME {
            return Err(FileFailure {
                filename: file.filename.clone(),
                code: "badMime",
                detail: format!("expected {PDF_MIME}, got {}", file.content_type),
            });
        }
        if file.bytes.len() as u64 > config.max_size_bytes() {
            return Err(FileFailure {
                filename: file.filename.clone(),
                code: "tooLarge",
                detail: format!("file exceeds {} MB", config.max_size_mb),
            });
        }

        let page_count = self.deps.pdf.page_count(&file.bytes).map_err(|e| FileFailure {
            filename: file.filename.clone(),
            code: "unreadable",
            detail: e.to_string(),
        })?;

        if page_count > config.max_pages {
            return Err(FileFailure {
                filename: file.filename.clone(),
                code: "tooManyPages",
                detail: format!("{page_count} pages exceeds limit of {}", config.max_pages),
            });
        }

        Ok(page_count)
    }

    /// Store the blob, create the job, enqueue the task.
    async fn admit_file(
        &self,
        session_id: Uuid,
        file: UploadedFile,
        page_count: u32,
    ) -> Result<(JobSummary, bool), ApiError> {
        let now = self.deps.clock.now();
        let job_id = self.deps.clock.new_id();
        let blob_path = format!("uploads/{session_id}/{job_id}.pdf");
        let size_bytes = file.bytes.len() as u64;

        self.deps
            .blob_store
            .put(&blob_path, file.bytes)
            .await
            .map_err(ApiError::ExternalService)?;

        let mut job = Job::builder()
            .id(job_id)
            .session_id(session_id)
            .filename(file.filename.clone())
            .size_bytes(size_bytes)
            .page_count(page_count)
            .blob_path(blob_path)
            .created_at(now)
            .updated_at(now)
            .build();
        job.stamp_stage(JobStatus::Uploaded, now);

        self.deps
            .job_store
            .insert(&job)
            .await
            .map_err(ApiError::ExternalService)?;

        let mut emulated = false;
        match self.dispatcher.dispatch(job_id, session_id, 0).await {
            Ok(mode) => {
                emulated = mode == DispatchMode::Emulated;
                job.status = JobStatus::Queued;
                job.stamp_stage(JobStatus::Queued, self.deps.clock.now());
                job.updated_at = self.deps.clock.now();
                if let Err(e) = self.deps.job_store.update(&job, 1).await {
                    warn!(%job_id, error = %e, "could not mark job queued");
                }
            }
            Err(e) => {
                // The job stays `uploaded`; a client retry can re-enqueue.
                warn!(%job_id, error = %e, "enqueue failed");
            }
        }

        info!(%job_id, %session_id, filename = %file.filename, "job admitted");
        Ok((
            JobSummary {
                job_id,
                filename: file.filename,
                status: job.status,
            },
            emulated,
        ))
    }

    // =========================================================================
    // Status & retry
    // =========================================================================

    pub async fn get_job(&self, job_id: Uuid, session_id: Uuid) -> Result<JobView, ApiError> {
        let job = self.owned_job(job_id, session_id).await?;
        Ok(job.into())
    }

    pub async fn retry_job(
        &self,
        job_id: Uuid,
        session_id: Uuid,
    ) -> Result<RetryResponse, ApiError> {
        self.deps
            .rate_limiter
            .check_action(session_id, LimitAction::Retry, 1.0)
            .await?;

        let stale_after = stale_threshold(StdDuration::from_secs(
            self.deps.config.heartbeat_interval_secs,
        ));

        for _ in 0..2 {
            let versioned = self
                .deps
                .job_store
                .get(job_id)
                .await
                .map_err(ApiError::ExternalService)?
                .filter(|v| v.job.session_id == session_id)
                .ok_or_else(|| ApiError::NotFound("job not found".to_string()))?;

            let mut job = versioned.job;
            let now = self.deps.clock.now();

            let takeover_eligible =
                !job.status.is_terminal() && job.lock_is_stale(now, stale_after);
            match job.status {
                JobStatus::Failed => {}
                JobStatus::Done => {
                    return Err(ApiError::Conflict {
                        code: "terminal",
                        detail: "job already completed".to_string(),
                    })
                }
                _ if takeover_eligible => {}
                _ => {
                    return Err(ApiError::Conflict {
                        code: "inProgress",
                        detail: "job is still being processed".to_string(),
                    })
                }
            }

            if job.manual_retries >= MANUAL_RETRY_CAP {
                return Err(ApiError::RateLimited {
                    detail: format!("retry limit of {MANUAL_RETRY_CAP} reached"),
                    retry_after_secs: 0,
                    reset_epoch: None,
                });
            }

            if !self
                .deps
                .blob_store
                .exists(&job.blob_path)
                .await
                .map_err(ApiError::ExternalService)?
            {
                return Err(ApiError::Conflict {
                    code: "reuploadRequired",
                    detail: "input file is gone; upload it again".to_string(),
                });
            }

            job.error = None;
            job.status = JobStatus::Queued;
            job.manual_retries += 1;
            job.processing_lock = None;
            job.updated_at = now;

            match self
                .deps
                .job_store
                .update(&job, versioned.version)
                .await
                .map_err(ApiError::ExternalService)?
            {
                WriteOutcome::Committed => {
                    self.dispatcher
                        .dispatch(job_id, session_id, job.manual_retries)
                        .await
                        .map_err(ApiError::ExternalService)?;

                    info!(%job_id, manual_retries = job.manual_retries, "job re-queued");
                    return Ok(RetryResponse {
                        job_id,
                        status: JobStatus::Queued,
                    });
                }
                WriteOutcome::Conflict => continue,
                WriteOutcome::Missing => {
                    return Err(ApiError::NotFound("job not found".to_string()))
                }
            }
        }

        Err(ApiError::Conflict {
            code: "conflict",
            detail: "job changed concurrently; try again".to_string(),
        })
    }

    // =========================================================================
    // Listing & deletion
    // =========================================================================

    pub async fn list_session_jobs(
        &self,
        session_id: Uuid,
    ) -> Result<SessionJobsResponse, ApiError> {
        let jobs = self
            .deps
            .job_store
            .list_by_session(session_id)
            .await
            .map_err(ApiError::ExternalService)?;
        Ok(SessionJobsResponse {
            session_id,
            jobs: jobs
                .into_iter()
                .map(|job| JobProjection {
                    job_id: job.id,
                    filename: job.filename,
                    status: job.status,
                    created_at: job.created_at,
                    confidence_score: job.confidence_score,
                    error: job.error,
                })
                .collect(),
        })
    }

    /// Done jobs for the CSV export, newest first.
    pub async fn done_session_jobs(&self, session_id: Uuid) -> Result<Vec<Job>, ApiError> {
        self.deps
            .job_store
            .list_done_by_session(session_id)
            .await
            .map_err(ApiError::ExternalService)
    }

    /// Delete all jobs and blobs of one session. Idempotent; reports how
    /// many job documents went away.
    pub async fn delete_session_data(
        &self,
        session_id: Uuid,
    ) -> Result<DeleteSessionResponse, ApiError> {
        let jobs = self
            .deps
            .job_store
            .list_by_session(session_id)
            .await
            .map_err(ApiError::ExternalService)?;

        let mut deleted = 0;
        for job in jobs {
            if let Err(e) = self.deps.blob_store.delete(&job.blob_path).await {
                warn!(job_id = %job.id, error = %e, "blob delete failed; retention will sweep");
            }
            match self.deps.job_store.delete(job.id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "job delete failed"),
            }
        }

        info!(%session_id, deleted, "session data deleted");
        Ok(DeleteSessionResponse {
            session_id,
            deleted,
        })
    }

    async fn owned_job(&self, job_id: Uuid, session_id: Uuid) -> Result<Job, ApiError> {
        self.deps
            .job_store
            .get(job_id)
            .await
            .map_err(ApiError::ExternalService)?
            .map(|v| v.job)
            .filter(|job| job.session_id == session_id)
            .ok_or_else(|| ApiError::NotFound("job not found".to_string()))
    }
}
