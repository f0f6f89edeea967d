//! Retention sweeper: expires sessions older than the retention window.
//!
//! One cooperative task per process. Single-flight by construction: the
//! loop body runs to completion before the next tick is considered.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::orchestration::InvoiceFacade;
use crate::kernel::deps::ServerDeps;

/// Jobs examined per sweep.
const SWEEP_BATCH: usize = 500;

pub struct RetentionSweeper {
    deps: ServerDeps,
    facade: Arc<InvoiceFacade>,
}

impl RetentionSweeper {
    pub fn new(deps: ServerDeps, facade: Arc<InvoiceFacade>) -> Self {
        Self { deps, facade }
    }

    /// Run until cancelled. Spawn exactly once per process.
    pub async fn run(self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.deps.config.retention_loop_interval_min * 60);
        info!(
            interval_min = self.deps.config.retention_loop_interval_min,
            retention_hours = self.deps.config.retention_hours,
            "retention sweeper starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_once().await {
                        warn!(error = %e, "retention sweep failed");
                    }
                }
            }
        }

        info!("retention sweeper stopped");
    }

    /// One bounded sweep: expired jobs grouped by session, each session
    /// deleted through the facade.
    pub async fn sweep_once(&self) -> anyhow::Result<usize> {
        let cutoff =
            self.deps.clock.now() - ChronoDuration::hours(self.deps.config.retention_hours);

        let expired = self
            .deps
            .job_store
            .list_created_before(cutoff, SWEEP_BATCH)
            .await?;

        let sessions: BTreeSet<Uuid> = expired.iter().map(|job| job.session_id).collect();

        let mut deleted = 0;
        for session_id in sessions {
            match self.facade.delete_session_data(session_id).await {
                Ok(result) => deleted += result.deleted,
                Err(e) => warn!(%session_id, error = %e, "session expiry failed"),
            }
        }

        if deleted > 0 {
            info!(deleted, "retention sweep removed expired jobs");
        }
        Ok(deleted)
    }
}
