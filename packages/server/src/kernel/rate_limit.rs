//! Multi-axis rate limiting.
//!
//! Three independent mechanisms, all of which must pass:
//!
//! 1. Token buckets per `(session, action)`, persisted in the limiter
//!    store so they hold across instances.
//! 2. Daily counters per session and global, rolling over at fixed-CET
//!    midnight.
//! 3. An optional in-memory per-IP backstop.
//!
//! Persisted writes are optimistic with bounded retries and then **fail
//! open**: the limiter is a soft-policy concern and must not take the
//! service down with it.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::{Clock as _, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::Quota;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::kernel::clock::{next_cet_midnight_epoch, secs_until_next_cet_midnight, cet_day_key, Clock};
use crate::kernel::store::LimiterStore;

/// CAS attempts before failing open.
const WRITE_RETRIES: u32 = 4;

/// Rate-limited actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAction {
    CreateJobs,
    UploadFile,
    Retry,
}

impl LimitAction {
    pub fn key(&self) -> &'static str {
        match self {
            LimitAction::CreateJobs => "createJobs",
            LimitAction::UploadFile => "uploadFile",
            LimitAction::Retry => "retry",
        }
    }
}

/// Refill rate and burst for one action.
#[derive(Debug, Clone, Copy)]
pub struct ActionLimit {
    pub rate_per_sec: f64,
    pub burst: f64,
}

/// A rejected check, with the hint the HTTP layer surfaces.
#[derive(Debug, Clone)]
pub struct RateLimitExceeded {
    pub scope: &'static str,
    pub retry_after_secs: u64,
    /// Next CET midnight for daily caps; absent for bucket rejections.
    pub reset_epoch: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketDoc {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterDoc {
    count: u64,
}

type IpLimiter = governor::RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

pub struct RateLimiter {
    store: Arc<dyn LimiterStore>,
    clock: Arc<dyn Clock>,
    create_jobs: ActionLimit,
    upload_file: ActionLimit,
    retry: ActionLimit,
    daily_per_session: u64,
    daily_global: u64,
    ip_limiter: Option<IpLimiter>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn LimiterStore>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let ip_limiter = config.ip_limit_per_sec.and_then(|rate| {
            let period = Duration::from_secs_f64(1.0 / rate.max(0.001));
            let burst = NonZeroU32::new(config.ip_limit_burst.max(1)).unwrap_or(nonzero_ext::nonzero!(1u32));
            Quota::with_period(period).map(|q| governor::RateLimiter::keyed(q.allow_burst(burst)))
        });

        Self {
            store,
            clock,
            create_jobs: ActionLimit {
                rate_per_sec: config.rate_create_jobs_per_sec,
                burst: config.rate_create_jobs_burst,
            },
            upload_file: ActionLimit {
                rate_per_sec: config.rate_upload_file_per_sec,
                burst: config.rate_upload_file_burst,
            },
            retry: ActionLimit {
                rate_per_sec: config.rate_retry_per_sec,
                burst: config.rate_retry_burst,
            },
            daily_per_session: u64::from(config.daily_jobs_per_session),
            daily_global: u64::from(config.daily_jobs_global),
            ip_limiter,
        }
    }

    fn limit_for(&self, action: LimitAction) -> ActionLimit {
        match action {
            LimitAction::CreateJobs => self.create_jobs,
            LimitAction::UploadFile => self.upload_file,
            LimitAction::Retry => self.retry,
        }
    }

    /// Token-bucket check for one `(session, action)` pair.
    pub async fn check_action(
        &self,
        session_id: Uuid,
        action: LimitAction,
        cost: f64,
    ) -> Result<(), RateLimitExceeded> {
        let limit = self.limit_for(action);
        let key = format!("bucket:{}:{}", session_id, action.key());

        for _ in 0..WRITE_RETRIES {
            let now = self.clock.now();

            let (mut doc, version) = match self.store.read(&key).await {
                Ok(Some((value, version))) => {
                    match serde_json::from_value::<BucketDoc>(value) {
                        Ok(doc) => (doc, Some(version)),
                        Err(e) => {
                            warn!(key, error = %e, "corrupt bucket document; resetting");
                            (
                                BucketDoc {
                                    tokens: limit.burst,
                                    last_refill: now,
                                },
                                Some(version),
                            )
                        }
                    }
                }
                Ok(None) => (
                    BucketDoc {
                        tokens: limit.burst,
                        last_refill: now,
                    },
                    None,
                ),
                Err(e) => {
                    warn!(key, error = %e, "limiter store read failed; failing open");
                    return Ok(());
                }
            };

            // Refill, capped at burst.
            let elapsed = (now - doc.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
            doc.tokens = (doc.tokens + elapsed * limit.rate_per_sec).min(limit.burst);
            doc.last_refill = now;

            if doc.tokens < cost {
                let deficit = cost - doc.tokens;
                let retry_after = (deficit / limit.rate_per_sec).ceil().max(1.0) as u64;
                return Err(RateLimitExceeded {
                    scope: action.key(),
                    retry_after_secs: retry_after,
                    reset_epoch: None,
                });
            }

            doc.tokens -= cost;
            let value = match serde_json::to_value(&doc) {
                Ok(value) => value,
                Err(e) => {
                    warn!(key, error = %e, "bucket serialization failed; failing open");
                    return Ok(());
                }
            };

            match self.store.write(&key, &value, version).await {
                Ok(true) => return Ok(()),
                Ok(false) => continue, // CAS conflict, retry
                Err(e) => {
                    warn!(key, error = %e, "limiter store write failed; failing open");
                    return Ok(());
                }
            }
        }

        warn!(key, "bucket write contention exhausted; failing open");
        Ok(())
    }

    /// Daily-cap check: increments the per-session and global counters for
    /// the current fixed-CET day by `count`.
    pub async fn check_daily(
        &self,
        session_id: Uuid,
        count: u64,
    ) -> Result<(), RateLimitExceeded> {
        let day = cet_day_key(self.clock.now().timestamp());
        let session_key = format!("daily:{session_id}:{day}");
        let global_key = format!("daily:global:{day}");

        self.bump_counter(&session_key, count, self.daily_per_session)
            .await?;
        self.bump_counter(&global_key, count, self.daily_global).await
    }

    async fn bump_counter(
        &self,
        key: &str,
        count: u64,
        limit: u64,
    ) -> Result<(), RateLimitExceeded> {
        for _ in 0..WRITE_RETRIES {
            let (current, version) = match self.store.read(key).await {
                Ok(Some((value, version))) => {
                    let doc: CounterDoc =
                        serde_json::from_value(value).unwrap_or(CounterDoc { count: 0 });
                    (doc.count, Some(version))
                }
                Ok(None) => (0, None),
                Err(e) => {
                    warn!(key, error = %e, "limiter store read failed; failing open");
                    return Ok(());
                }
            };

            if current + count > limit {
                let unix = self.clock.now().timestamp();
                return Err(RateLimitExceeded {
                    scope: "daily",
                    retry_after_secs: secs_until_next_cet_midnight(unix) as u64,
                    reset_epoch: Some(next_cet_midnight_epoch(unix)),
                });
            }

            let value = serde_json::json!({ "count": current + count });
            match self.store.write(key, &value, version).await {
                Ok(true) => return Ok(()),
                Ok(false) => continue,
                Err(e) => {
                    warn!(key, error = %e, "limiter store write failed; failing open");
                    return Ok(());
                }
            }
        }

        warn!(key, "counter write contention exhausted; failing open");
        Ok(())
    }

    /// Optional per-IP backstop. No-op when not configured.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), RateLimitExceeded> {
        let Some(limiter) = &self.ip_limiter else {
            return Ok(());
        };

        limiter.check_key(&ip).map_err(|not_until| {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            RateLimitExceeded {
                scope: "ip",
                retry_after_secs: wait.as_secs().max(1),
                reset_epoch: None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::clock::ManualClock;
    use crate::kernel::stores::memory::MemoryLimiterStore;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn config() -> Config {
        let mut config = crate::kernel::test_dependencies::test_config();
        config.rate_create_jobs_per_sec = 1.0;
        config.rate_create_jobs_burst = 2.0;
        config.rate_retry_per_sec = 1.0;
        config.rate_retry_burst = 1.0;
        config.daily_jobs_per_session = 3;
        config.daily_jobs_global = 100;
        config
    }

    fn limiter_at(start: DateTime<Utc>) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let limiter = RateLimiter::new(
            Arc::new(MemoryLimiterStore::new()),
            clock.clone(),
            &config(),
        );
        (limiter, clock)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn bucket_allows_burst_then_rejects_with_retry_after() {
        let (limiter, _clock) = limiter_at(noon());
        let session = Uuid::new_v4();

        // burst = 2 at 1/s
        assert!(limiter
            .check_action(session, LimitAction::CreateJobs, 1.0)
            .await
            .is_ok());
        assert!(limiter
            .check_action(session, LimitAction::CreateJobs, 1.0)
            .await
            .is_ok());

        let rejected = limiter
            .check_action(session, LimitAction::CreateJobs, 1.0)
            .await
            .unwrap_err();
        assert_eq!(rejected.scope, "createJobs");
        assert_eq!(rejected.retry_after_secs, 1);
        assert!(rejected.reset_epoch.is_none());
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let (limiter, clock) = limiter_at(noon());
        let session = Uuid::new_v4();

        for _ in 0..2 {
            limiter
                .check_action(session, LimitAction::CreateJobs, 1.0)
                .await
                .unwrap();
        }
        assert!(limiter
            .check_action(session, LimitAction::CreateJobs, 1.0)
            .await
            .is_err());

        clock.advance(chrono::Duration::seconds(2));
        assert!(limiter
            .check_action(session, LimitAction::CreateJobs, 1.0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn buckets_are_scoped_per_session_and_action() {
        let (limiter, _clock) = limiter_at(noon());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        limiter
            .check_action(a, LimitAction::Retry, 1.0)
            .await
            .unwrap();
        // Session a's retry bucket (burst 1) is empty; other scopes are not.
        assert!(limiter.check_action(a, LimitAction::Retry, 1.0).await.is_err());
        assert!(limiter
            .check_action(a, LimitAction::CreateJobs, 1.0)
            .await
            .is_ok());
        assert!(limiter.check_action(b, LimitAction::Retry, 1.0).await.is_ok());
    }

    #[tokio::test]
    async fn daily_cap_rejects_with_cet_reset_hint() {
        let (limiter, clock) = limiter_at(noon());
        let session = Uuid::new_v4();

        // cap = 3
        limiter.check_daily(session, 2).await.unwrap();
        limiter.check_daily(session, 1).await.unwrap();
        let rejected = limiter.check_daily(session, 1).await.unwrap_err();

        assert_eq!(rejected.scope, "daily");
        let unix = clock.now().timestamp();
        assert_eq!(
            rejected.retry_after_secs,
            secs_until_next_cet_midnight(unix) as u64
        );
        let reset = rejected.reset_epoch.unwrap();
        assert_eq!((reset + 3600) % 86400, 0);
    }

    #[tokio::test]
    async fn daily_counter_rolls_over_at_cet_midnight() {
        let (limiter, clock) = limiter_at(noon());
        let session = Uuid::new_v4();

        limiter.check_daily(session, 3).await.unwrap();
        assert!(limiter.check_daily(session, 1).await.is_err());

        // 23:00 UTC = CET midnight: a fresh day key.
        clock.set(Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap());
        assert!(limiter.check_daily(session, 1).await.is_ok());
    }

    struct BrokenStore;

    #[async_trait]
    impl LimiterStore for BrokenStore {
        async fn read(&self, _key: &str) -> AnyResult<Option<(serde_json::Value, i64)>> {
            anyhow::bail!("store down")
        }

        async fn write(
            &self,
            _key: &str,
            _value: &serde_json::Value,
            _expected_version: Option<i64>,
        ) -> AnyResult<bool> {
            anyhow::bail!("store down")
        }
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let clock = Arc::new(ManualClock::new(noon()));
        let limiter = RateLimiter::new(Arc::new(BrokenStore), clock, &config());
        let session = Uuid::new_v4();

        assert!(limiter
            .check_action(session, LimitAction::CreateJobs, 1.0)
            .await
            .is_ok());
        assert!(limiter.check_daily(session, 1).await.is_ok());
    }
}
