//! The storage and messaging seams the engine is built against. All engine
//! state lives behind [`Store`]; there is no in-process queue of jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Job, JobId, JobStatus, JobTrigger, TenantId};

/// Transactional persistence for `Job` and `JobTrigger` rows.
///
/// Implementations must provide `SELECT … FOR UPDATE`-style row locking for
/// `lock_job`: while a `JobGuard` is held, no other caller may observe or
/// mutate the same row until it is dropped (committed or rolled back).
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a freshly submitted job. Returns `Ok(None)` and leaves no new
    /// row if a unique-constraint race on `(tenant_id, idempotency_key)`
    /// lost to a concurrent insert — the caller should then look the
    /// existing row up via `find_by_idempotency_key`.
    async fn insert_job(&self, job: &Job) -> anyhow::Result<bool>;

    /// Row-lock and fetch a job by id. Returns `None` if it doesn't exist.
    async fn lock_job(&self, id: JobId) -> anyhow::Result<Option<Job>>;

    /// Persist a job previously obtained from `lock_job`, releasing the lock.
    async fn save_job(&self, job: &Job) -> anyhow::Result<()>;

    /// Fetch a job without locking it (read path, e.g. `GET /jobs/{id}`).
    async fn get_job(&self, tenant_id: TenantId, id: JobId) -> anyhow::Result<Option<Job>>;

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> anyhow::Result<Option<Job>>;

    /// List jobs for a tenant, newest first, optionally filtered by status.
    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> anyhow::Result<Vec<Job>>;

    async fn delete_job(&self, tenant_id: TenantId, id: JobId) -> anyhow::Result<bool>;

    /// Count jobs per status for a tenant.
    async fn count_by_status(&self, tenant_id: TenantId) -> anyhow::Result<Vec<(JobStatus, u64)>>;

    /// The oldest eligible job for a tenant: PENDING, or THROTTLED with
    /// `next_run_at <= now`, ordered oldest-first. Used by `Dispatcher::lease`.
    async fn lock_next_leasable(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>>;

    /// Jobs whose `next_run_at`/`next_retry_at`/`lease_until`/`updated_at`
    /// make them eligible for one of the reconciler's four categories.
    /// `limit` bounds the work per category per sweep.
    async fn scan_pending_timed_out(
        &self,
        now: DateTime<Utc>,
        pending_timeout_seconds: u64,
        limit: u32,
    ) -> anyhow::Result<Vec<JobId>>;

    async fn scan_throttled_ready(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<JobId>>;

    async fn scan_failed_ready(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<JobId>>;

    async fn scan_lease_expired(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<JobId>>;

    async fn insert_trigger(&self, trigger: &JobTrigger) -> anyhow::Result<()>;

    /// Count of tenant triggers with `triggered_at` in `[window_start, now]`.
    async fn count_recent_triggers(
        &self,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    /// Timestamp of the oldest trigger still inside the rate-limit window,
    /// used to compute `retry_after`.
    async fn oldest_trigger_in_window(
        &self,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>>;

    async fn count_running(&self, tenant_id: TenantId) -> anyhow::Result<u32>;
}

/// The message queue abstraction decoupling Dispatcher from Runner.
/// Re-enqueueing a DONE/DLQ job must be a safe no-op at the Runner, since the
/// broker itself is at-least-once.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job_id: JobId) -> anyhow::Result<()>;
}

/// No-op queue, useful when the caller drives the Runner itself (tests, the
/// demo binary's synchronous loop).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpJobQueue;

#[async_trait]
impl JobQueue for NoOpJobQueue {
    async fn enqueue(&self, _job_id: JobId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A handed-down capability for a `RowPipeline` to report progress without
/// holding a reference to the Runner or the Store directly.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(
        &self,
        progress: u8,
        processed_rows: u64,
        stage: Option<crate::model::JobStage>,
    ) -> anyhow::Result<()>;
}

/// External collaborator: given an input payload, returns an output summary.
/// May take arbitrary wall-clock time and may fail. Implementations may
/// stream progress through the handed-down `ProgressReporter`.
#[async_trait]
pub trait RowPipeline: Send + Sync {
    async fn run(
        &self,
        input_payload: &serde_json::Value,
        reporter: &dyn ProgressReporter,
    ) -> anyhow::Result<serde_json::Value>;
}
