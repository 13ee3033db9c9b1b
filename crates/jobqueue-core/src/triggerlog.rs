//! The trigger-log rate limiter.
//!
//! Consulted by [`crate::dispatcher::Dispatcher`] on `submit`/`retry`/
//! `replay`. The window is the closed/open interval `[now-60s, now]`.

use chrono::{DateTime, Duration, Utc};

use crate::error::JobQueueError;
use crate::model::TenantId;
use crate::store::Store;

pub const WINDOW_SECONDS: i64 = 60;

/// Checks the per-tenant, per-minute trigger rate limit. Returns
/// `Err(JobQueueError::RateLimited { retry_after })` if the tenant has
/// already made `limit` or more triggers within the trailing window.
pub async fn check_rate_limit(
    store: &dyn Store,
    tenant_id: TenantId,
    limit: u32,
    now: DateTime<Utc>,
) -> Result<(), JobQueueError> {
    let window_start = now - Duration::seconds(WINDOW_SECONDS);
    let count = store
        .count_recent_triggers(tenant_id, window_start, now)
        .await?;
    if count < limit as u64 {
        return Ok(());
    }

    let oldest = store
        .oldest_trigger_in_window(tenant_id, window_start, now)
        .await?
        .unwrap_or(window_start);
    let elapsed = now - oldest;
    let retry_after = (Duration::seconds(WINDOW_SECONDS) - elapsed).max(Duration::zero());
    Err(JobQueueError::RateLimited { retry_after })
}
