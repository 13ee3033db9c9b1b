//! Engine configuration.
//!
//! An immutable value injected into [`crate::dispatcher::Dispatcher`] and
//! [`crate::reconciler::Reconciler`] at construction — never a global or
//! lazily-initialized singleton.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub jobs_per_min_limit: u32,
    pub concurrent_jobs_limit: u32,
    pub job_lease_seconds: u64,
    pub job_retry_delay_seconds: u64,
    pub job_throttle_backoff_seconds: u64,
    pub job_pending_timeout_seconds: u64,
    pub job_retry_scan_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs_per_min_limit: 4,
            concurrent_jobs_limit: 2,
            job_lease_seconds: 60,
            job_retry_delay_seconds: 5,
            job_throttle_backoff_seconds: 15,
            job_pending_timeout_seconds: 10,
            job_retry_scan_seconds: 5,
        }
    }
}

impl Config {
    /// Build a `Config` from the environment, falling back to defaults for
    /// any key that's unset or fails to parse.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            jobs_per_min_limit: env_or("JOBS_PER_MIN_LIMIT", defaults.jobs_per_min_limit),
            concurrent_jobs_limit: env_or(
                "CONCURRENT_JOBS_LIMIT",
                defaults.concurrent_jobs_limit,
            ),
            job_lease_seconds: env_or("JOB_LEASE_SECONDS", defaults.job_lease_seconds),
            job_retry_delay_seconds: env_or(
                "JOB_RETRY_DELAY_SECONDS",
                defaults.job_retry_delay_seconds,
            ),
            job_throttle_backoff_seconds: env_or(
                "JOB_THROTTLE_BACKOFF_SECONDS",
                defaults.job_throttle_backoff_seconds,
            ),
            job_pending_timeout_seconds: env_or(
                "JOB_PENDING_TIMEOUT_SECONDS",
                defaults.job_pending_timeout_seconds,
            ),
            job_retry_scan_seconds: env_or(
                "JOB_RETRY_SCAN_SECONDS",
                defaults.job_retry_scan_seconds,
            ),
        })
    }

    pub fn retry_scan_interval(&self) -> Duration {
        Duration::from_secs(self.job_retry_scan_seconds)
    }

    /// `backoff(n) = min(BASE_BACKOFF * (1 + n), 300s)`.
    pub fn throttle_backoff(&self, throttle_count: u32) -> chrono::Duration {
        let base = self.job_throttle_backoff_seconds as i64;
        let secs = (base * (1 + throttle_count as i64)).min(300);
        chrono::Duration::seconds(secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
