use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,
    pub database_url: Option<String>,

    // Upload limits
    pub max_files: usize,
    pub max_size_mb: u64,
    pub max_pages: u32,
    /// Reject the whole upload when any file fails validation; when false,
    /// valid files proceed and failures are reported per file.
    pub accept_partial: bool,

    // OCR
    pub ocr_sync_max_pages: u32,
    pub ocr_language_hints: Vec<String>,

    // Sanitizer
    pub preprocess_max_chars: usize,
    pub zone_strip_top: usize,
    pub zone_strip_bottom: usize,

    // LLM
    pub llm_prompt_version: String,
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,

    // Retention
    pub retention_hours: i64,
    pub retention_loop_interval_min: u64,
    pub retention_loop_enable: bool,

    // Rate limits: per-action token buckets (rate per second, burst)
    pub rate_create_jobs_per_sec: f64,
    pub rate_create_jobs_burst: f64,
    pub rate_upload_file_per_sec: f64,
    pub rate_upload_file_burst: f64,
    pub rate_retry_per_sec: f64,
    pub rate_retry_burst: f64,

    // Rate limits: daily caps (fixed-CET calendar day)
    pub daily_jobs_per_session: u32,
    pub daily_jobs_global: u32,

    // Rate limits: optional per-IP backstop
    pub ip_limit_per_sec: Option<f64>,
    pub ip_limit_burst: u32,

    // Task queue
    pub task_queue_target_url: Option<String>,
    pub task_queue_path: Option<String>,
    pub task_queue_service_account: Option<String>,
    /// Queue-level redelivery policy; applied when provisioning the queue.
    pub task_queue_max_attempts: u32,
    pub task_queue_min_backoff_secs: u64,
    pub task_queue_max_backoff_secs: u64,
    pub emulation_enabled: bool,

    // Blobs
    pub blob_bucket: String,
    pub blob_local_root: Option<String>,

    // Worker
    pub heartbeat_interval_secs: u64,
    pub attempt_budget_secs: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            port: env_parse("PORT", 8080)?,
            database_url: env::var("DATABASE_URL").ok(),

            max_files: env_parse("MAX_FILES", 10)?,
            max_size_mb: env_parse("MAX_SIZE_MB", 20)?,
            max_pages: env_parse("MAX_PAGES", 30)?,
            accept_partial: env_flag("ACCEPT_PARTIAL_UPLOADS", false),

            ocr_sync_max_pages: env_parse("OCR_SYNC_MAX_PAGES", 2)?,
            ocr_language_hints: env::var("OCR_LANGUAGE_HINTS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|_| vec!["en".to_string(), "nl".to_string(), "de".to_string()]),

            preprocess_max_chars: env_parse("PREPROCESS_MAX_CHARS", 20_000)?,
            zone_strip_top: env_parse("ZONE_STRIP_TOP", 0)?,
            zone_strip_bottom: env_parse("ZONE_STRIP_BOTTOM", 0)?,

            llm_prompt_version: env::var("LLM_PROMPT_VERSION")
                .unwrap_or_else(|_| extraction::prompts::PROMPT_VERSION.to_string()),
            gemini_api_key: env::var("GEMINI_API_KEY").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),

            retention_hours: env_parse("RETENTION_HOURS", 24)?,
            retention_loop_interval_min: env_parse("RETENTION_LOOP_INTERVAL_MIN", 30)?,
            retention_loop_enable: env_flag("RETENTION_LOOP_ENABLE", true),

            rate_create_jobs_per_sec: env_parse("RATE_CREATE_JOBS_PER_SEC", 0.5)?,
            rate_create_jobs_burst: env_parse("RATE_CREATE_JOBS_BURST", 5.0)?,
            rate_upload_file_per_sec: env_parse("RATE_UPLOAD_FILE_PER_SEC", 2.0)?,
            rate_upload_file_burst: env_parse("RATE_UPLOAD_FILE_BURST", 20.0)?,
            rate_retry_per_sec: env_parse("RATE_RETRY_PER_SEC", 0.2)?,
            rate_retry_burst: env_parse("RATE_RETRY_BURST", 3.0)?,

            daily_jobs_per_session: env_parse("DAILY_JOBS_PER_SESSION", 50)?,
            daily_jobs_global: env_parse("DAILY_JOBS_GLOBAL", 1000)?,

            ip_limit_per_sec: env::var("IP_LIMIT_PER_SEC")
                .ok()
                .map(|v| v.parse().context("IP_LIMIT_PER_SEC must be a number"))
                .transpose()?,
            ip_limit_burst: env_parse("IP_LIMIT_BURST", 30)?,

            task_queue_target_url: env::var("TASK_QUEUE_TARGET_URL").ok(),
            task_queue_path: env::var("TASK_QUEUE_PATH").ok(),
            task_queue_service_account: env::var("TASK_QUEUE_SERVICE_ACCOUNT").ok(),
            task_queue_max_attempts: env_parse("TASK_QUEUE_MAX_ATTEMPTS", 4)?,
            task_queue_min_backoff_secs: env_parse("TASK_QUEUE_MIN_BACKOFF_SECS", 30)?,
            task_queue_max_backoff_secs: env_parse("TASK_QUEUE_MAX_BACKOFF_SECS", 300)?,
            emulation_enabled: env_flag("EMULATION_ENABLED", false),

            blob_bucket: env::var("BLOB_BUCKET").unwrap_or_else(|_| "invoice-uploads".to_string()),
            blob_local_root: env::var("BLOB_LOCAL_ROOT").ok(),

            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL_SECS", 30)?,
            attempt_budget_secs: env_parse("ATTEMPT_BUDGET_SECS", 900)?,
        })
    }

    /// Queue mode requires the full task-queue triple; anything less runs
    /// in emulation.
    pub fn queue_mode_configured(&self) -> bool {
        self.task_queue_target_url.is_some()
            && self.task_queue_path.is_some()
            && self.task_queue_service_account.is_some()
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        // Only read defaults for keys unlikely to be set in CI.
        assert_eq!(env_parse::<u32>("NOT_A_REAL_KEY_PAGES", 30).unwrap(), 30);
        assert!(!env_flag("NOT_A_REAL_KEY_FLAG", false));
        assert!(env_flag("NOT_A_REAL_KEY_FLAG2", true));
    }
}
