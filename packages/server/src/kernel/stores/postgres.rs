//! PostgreSQL store implementations.
//!
//! The job document lives in a `jsonb` column; `session_id`, `status` and
//! `created_at` are mirrored into indexed columns so the done-by-session
//! query runs off the composite index. Writes are optimistic: the
//! `version` column is the CAS token.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domains::invoices::job::Job;
use crate::kernel::store::{JobStore, LimiterStore, VersionedJob, WriteOutcome};

/// Job store backed by the `jobs` table.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(row: &PgRow) -> Result<VersionedJob> {
        let doc: serde_json::Value = row.try_get("doc")?;
        let version: i64 = row.try_get("version")?;
        let job: Job = serde_json::from_value(doc).context("corrupt job document")?;
        Ok(VersionedJob { job, version })
    }

    fn decode_jobs(rows: Vec<PgRow>) -> Result<Vec<Job>> {
        rows.iter()
            .map(|row| Self::decode(row).map(|v| v.job))
            .collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, session_id, status, created_at, version, doc)
            VALUES ($1, $2, $3, $4, 1, $5)
            "#,
        )
        .bind(job.id)
        .bind(job.session_id)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(serde_json::to_value(job)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<VersionedJob>> {
        let row = sqlx::query("SELECT doc, version FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn update(&self, job: &Job, expected_version: i64) -> Result<WriteOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, doc = $2, version = version + 1
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(job.status.as_str())
        .bind(serde_json::to_value(job)?)
        .bind(job.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(WriteOutcome::Committed);
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE id = $1")
            .bind(job.id)
            .fetch_one(&self.pool)
            .await?;

        Ok(if exists > 0 {
            WriteOutcome::Conflict
        } else {
            WriteOutcome::Missing
        })
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, at: DateTime<Utc>) -> Result<bool> {
        // Touches only the heartbeat field inside the document and leaves
        // the version alone, so the holder's staged CAS writes still apply.
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET doc = jsonb_set(doc, '{heartbeatAt}', to_jsonb($2::text))
            WHERE id = $1 AND doc->'processingLock'->>'lockedBy' = $3
            "#,
        )
        .bind(job_id)
        .bind(at.to_rfc3339())
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn delete(&self, job_id: Uuid) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn list_by_session(&self, session_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT doc, version FROM jobs
            WHERE session_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_jobs(rows)
    }

    async fn list_done_by_session(&self, session_id: Uuid) -> Result<Vec<Job>> {
        // Served by idx_jobs_session_status_created.
        let rows = sqlx::query(
            r#"
            SELECT doc, version FROM jobs
            WHERE session_id = $1 AND status = 'done'
            ORDER BY created_at DESC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_jobs(rows)
    }

    async fn list_created_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT doc, version FROM jobs
            WHERE created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Self::decode_jobs(rows)
    }
}

/// Limiter store backed by the `rate_limits` table.
pub struct PostgresLimiterStore {
    pool: PgPool,
}

impl PostgresLimiterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LimiterStore for PostgresLimiterStore {
    async fn read(&self, key: &str) -> Result<Option<(serde_json::Value, i64)>> {
        let row = sqlx::query("SELECT doc, version FROM rate_limits WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<_> {
            let doc: serde_json::Value = row.try_get("doc")?;
            let version: i64 = row.try_get("version")?;
            Ok((doc, version))
        })
        .transpose()
    }

    async fn write(
        &self,
        key: &str,
        value: &serde_json::Value,
        expected_version: Option<i64>,
    ) -> Result<bool> {
        let written = match expected_version {
            None => sqlx::query(
                r#"
                INSERT INTO rate_limits (key, doc, version)
                VALUES ($1, $2, 1)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?
            .rows_affected(),
            Some(expected) => sqlx::query(
                r#"
                UPDATE rate_limits
                SET doc = $2, version = version + 1
                WHERE key = $1 AND version = $3
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(expected)
            .execute(&self.pool)
            .await?
            .rows_affected(),
        };

        Ok(written > 0)
    }
}
