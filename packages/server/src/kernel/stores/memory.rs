//! In-memory store implementations for testing and development.
//!
//! Data is lost on restart; the versioning semantics match the Postgres
//! store exactly so lifecycle tests exercise the real protocol.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::domains::invoices::job::Job;
use crate::kernel::store::{JobStore, LimiterStore, VersionedJob, WriteOutcome};

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, (Job, i64)>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            anyhow::bail!("job {} already exists", job.id);
        }
        jobs.insert(job.id, (job.clone(), 1));
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<VersionedJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .map(|(job, version)| VersionedJob {
                job: job.clone(),
                version: *version,
            }))
    }

    async fn update(&self, job: &Job, expected_version: i64) -> Result<WriteOutcome> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job.id) {
            None => Ok(WriteOutcome::Missing),
            Some((_, version)) if *version != expected_version => Ok(WriteOutcome::Conflict),
            Some(slot) => {
                *slot = (job.clone(), expected_version + 1);
                Ok(WriteOutcome::Committed)
            }
        }
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&job_id) {
            Some((job, _)) if job.holds_lock(worker_id) => {
                job.heartbeat_at = Some(at);
                job.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool> {
        Ok(self.jobs.lock().unwrap().remove(&job_id).is_some())
    }

    async fn list_by_session(&self, session_id: Uuid) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|(job, _)| job.session_id == session_id)
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_done_by_session(&self, session_id: Uuid) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|(job, _)| {
                job.session_id == session_id
                    && job.status == crate::domains::invoices::job::JobStatus::Done
            })
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn list_created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|(job, _)| job.created_at < cutoff)
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

/// In-memory limiter store.
#[derive(Default)]
pub struct MemoryLimiterStore {
    docs: Mutex<HashMap<String, (serde_json::Value, i64)>>,
}

impl MemoryLimiterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LimiterStore for MemoryLimiterStore {
    async fn read(&self, key: &str) -> Result<Option<(serde_json::Value, i64)>> {
        Ok(self.docs.lock().unwrap().get(key).cloned())
    }

    async fn write(
        &self,
        key: &str,
        value: &serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<bool> {
        let mut docs = self.docs.lock().unwrap();
        match (docs.get(key), expected_version) {
            (None, None) => {
                docs.insert(key.to_string(), (value.clone(), 1));
                Ok(true)
            }
            (Some((_, version)), Some(expected)) if *version == expected => {
                docs.insert(key.to_string(), (value.clone(), expected + 1));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::invoices::job::JobStatus;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn job(session_id: Uuid, created: DateTime<Utc>) -> Job {
        Job::builder()
            .id(Uuid::new_v4())
            .session_id(session_id)
            .filename("a.pdf")
            .size_bytes(10u64)
            .page_count(1u32)
            .blob_path("uploads/x/y.pdf")
            .created_at(created)
            .updated_at(created)
            .build()
    }

    #[tokio::test]
    async fn cas_update_detects_conflicts() {
        let store = MemoryJobStore::new();
        let job = job(Uuid::new_v4(), t(0));
        store.insert(&job).await.unwrap();

        let read = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(read.version, 1);

        let mut a = read.job.clone();
        a.status = JobStatus::Queued;
        assert_eq!(
            store.update(&a, read.version).await.unwrap(),
            WriteOutcome::Committed
        );

        // Second writer with the stale version loses.
        let mut b = read.job.clone();
        b.status = JobStatus::Failed;
        assert_eq!(
            store.update(&b, read.version).await.unwrap(),
            WriteOutcome::Conflict
        );

        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().job.status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn update_of_deleted_job_reports_missing() {
        let store = MemoryJobStore::new();
        let job = job(Uuid::new_v4(), t(0));
        store.insert(&job).await.unwrap();
        assert!(store.delete(job.id).await.unwrap());
        assert!(!store.delete(job.id).await.unwrap());
        assert_eq!(store.update(&job, 1).await.unwrap(), WriteOutcome::Missing);
    }

    #[tokio::test]
    async fn done_listing_is_created_at_descending() {
        let store = MemoryJobStore::new();
        let session = Uuid::new_v4();
        let mut older = job(session, t(0));
        let mut newer = job(session, t(100));
        older.status = JobStatus::Done;
        newer.status = JobStatus::Done;
        let mut failed = job(session, t(50));
        failed.status = JobStatus::Failed;
        store.insert(&older).await.unwrap();
        store.insert(&newer).await.unwrap();
        store.insert(&failed).await.unwrap();
        store.insert(&job(Uuid::new_v4(), t(10))).await.unwrap();

        let done = store.list_done_by_session(session).await.unwrap();
        assert_eq!(
            done.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![newer.id, older.id]
        );
    }

    #[tokio::test]
    async fn heartbeat_requires_the_lock_holder() {
        let store = MemoryJobStore::new();
        let mut j = job(Uuid::new_v4(), t(0));
        j.processing_lock = Some(crate::domains::invoices::job::ProcessingLock {
            locked_by: "w1".to_string(),
            locked_at: t(0),
        });
        store.insert(&j).await.unwrap();

        assert!(store.heartbeat(j.id, "w1", t(30)).await.unwrap());
        assert!(!store.heartbeat(j.id, "w2", t(30)).await.unwrap());
        assert_eq!(
            store.get(j.id).await.unwrap().unwrap().job.heartbeat_at,
            Some(t(30))
        );
    }

    #[tokio::test]
    async fn limiter_store_insert_and_cas() {
        let store = MemoryLimiterStore::new();
        let doc = serde_json::json!({"count": 1});

        assert!(store.write("k", &doc, None).await.unwrap());
        // Double insert loses.
        assert!(!store.write("k", &doc, None).await.unwrap());

        let (read, version) = store.read("k").await.unwrap().unwrap();
        assert_eq!(read["count"], 1);
        assert!(store
            .write("k", &serde_json::json!({"count": 2}), Some(version))
            .await
            .unwrap());
        assert!(!store
            .write("k", &serde_json::json!({"count": 9}), Some(version))
            .await
            .unwrap());
    }
}
