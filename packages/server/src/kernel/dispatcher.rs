//! Task dispatch: hand `(jobId, sessionId)` to the worker entry point.
//!
//! Two modes. Emulation schedules the handler on the local runtime (never
//! inline, so intake latency stays flat). Queue mode creates an OIDC-signed
//! HTTP task against the worker callback URL; task names derive from the
//! job id so queue-side dedup absorbs duplicate enqueues, and a transient
//! enqueue failure falls back to emulation when configured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use extraction::TokenSource;

const CLOUD_TASKS_API_URL: &str = "https://cloudtasks.googleapis.com/v2";

/// Worker entry point the emulation path schedules directly.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, job_id: Uuid, session_id: Uuid);
}

/// Which path a dispatch took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Queued,
    Emulated,
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue one processing task. `generation` feeds the task name so a
    /// client retry gets a fresh name while duplicate enqueues of the same
    /// generation dedup in the queue.
    async fn dispatch(
        &self,
        job_id: Uuid,
        session_id: Uuid,
        generation: u32,
    ) -> Result<DispatchMode>;
}

// =============================================================================
// Emulation
// =============================================================================

/// Runs the worker in-process. Local development and queue fallback.
pub struct EmulationDispatcher {
    handler: Arc<dyn TaskHandler>,
}

impl EmulationDispatcher {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl TaskDispatcher for EmulationDispatcher {
    async fn dispatch(
        &self,
        job_id: Uuid,
        session_id: Uuid,
        _generation: u32,
    ) -> Result<DispatchMode> {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler.handle(job_id, session_id).await;
        });
        Ok(DispatchMode::Emulated)
    }
}

// =============================================================================
// Cloud Tasks
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    task: Task,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Task {
    name: String,
    http_request: HttpRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequest {
    http_method: &'static str,
    url: String,
    body: String,
    oidc_token: OidcToken,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken {
    service_account_email: String,
    audience: String,
}

/// Queue-backed dispatcher.
pub struct CloudTasksDispatcher {
    client: Client,
    tokens: Arc<dyn TokenSource>,
    /// `projects/{p}/locations/{l}/queues/{q}`
    queue_path: String,
    target_url: String,
    service_account: String,
    base_url: String,
    fallback: Option<Arc<EmulationDispatcher>>,
}

impl CloudTasksDispatcher {
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        queue_path: impl Into<String>,
        target_url: impl Into<String>,
        service_account: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            tokens,
            queue_path: queue_path.into(),
            target_url: target_url.into(),
            service_account: service_account.into(),
            base_url: CLOUD_TASKS_API_URL.to_string(),
            fallback: None,
        }
    }

    /// In-process fallback for transient enqueue failures.
    pub fn with_fallback(mut self, fallback: Arc<EmulationDispatcher>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Set a custom base URL (for tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn create_task(&self, job_id: Uuid, session_id: Uuid, generation: u32) -> Result<()> {
        let payload = serde_json::json!({ "jobId": job_id, "sessionId": session_id });
        let request = CreateTaskRequest {
            task: Task {
                name: format!("{}/tasks/job-{}-{}", self.queue_path, job_id, generation),
                http_request: HttpRequest {
                    http_method: "POST",
                    url: self.target_url.clone(),
                    body: base64::engine::general_purpose::STANDARD
                        .encode(payload.to_string()),
                    oidc_token: OidcToken {
                        service_account_email: self.service_account.clone(),
                        audience: self.target_url.clone(),
                    },
                },
            },
        };

        let token = self
            .tokens
            .access_token()
            .await
            .context("acquiring queue API token")?;

        let url = format!("{}/{}/tasks", self.base_url, self.queue_path);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .timeout(Duration::from_secs(10))
            .json(&request)
            .send()
            .await
            .context("sending create-task request")?;

        let status = response.status();
        // A duplicate name inside the dedup window means the task is
        // already enqueued; that is success for our caller.
        if status == reqwest::StatusCode::CONFLICT {
            info!(%job_id, "task already enqueued (deduplicated)");
            return Ok(());
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("task queue error: {status} - {text}");
        }

        Ok(())
    }
}

#[async_trait]
impl TaskDispatcher for CloudTasksDispatcher {
    async fn dispatch(
        &self,
        job_id: Uuid,
        session_id: Uuid,
        generation: u32,
    ) -> Result<DispatchMode> {
        match self.create_task(job_id, session_id, generation).await {
            Ok(()) => Ok(DispatchMode::Queued),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(%job_id, error = %e, "enqueue failed; falling back to emulation");
                    fallback.dispatch(job_id, session_id, generation).await
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelHandler(mpsc::UnboundedSender<(Uuid, Uuid)>);

    #[async_trait]
    impl TaskHandler for ChannelHandler {
        async fn handle(&self, job_id: Uuid, session_id: Uuid) {
            let _ = self.0.send((job_id, session_id));
        }
    }

    #[tokio::test]
    async fn emulation_schedules_the_handler_asynchronously() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = EmulationDispatcher::new(Arc::new(ChannelHandler(tx)));

        let job_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let mode = dispatcher.dispatch(job_id, session_id, 0).await.unwrap();

        assert_eq!(mode, DispatchMode::Emulated);
        assert_eq!(rx.recv().await, Some((job_id, session_id)));
    }
}
