//! The Dispatcher: tenant-scoped entry points into the engine.
//!
//! Every method here is a short transaction against the [`Store`] followed
//! by a post-commit [`JobQueue::enqueue`] — never inside the transaction, so
//! the Runner always sees a persisted row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::JobQueueError;
use crate::model::{Job, JobId, JobStage, JobStatus, JobTrigger, TenantId};
use crate::runner::RunnerProgressReporter;
use crate::state_machine;
use crate::store::{JobQueue, RowPipeline, Store};
use crate::triggerlog;

/// Summary counts returned by `stats`.
#[derive(Debug, Clone)]
pub struct Stats {
    pub pending: u64,
    pub throttled: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub dlq: u64,
    pub triggers_last_minute: u64,
    pub concurrent_running: u32,
    pub concurrent_jobs_limit: u32,
    pub jobs_per_min_limit: u32,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: Config,
    pipeline: Option<Arc<dyn RowPipeline>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            config,
            pipeline: None,
        }
    }

    /// Attaches a `RowPipeline` the Dispatcher can invoke synchronously from
    /// `complete` when a caller omits `output_result` (`spec.md` §4.2).
    pub fn with_pipeline(mut self, pipeline: Arc<dyn RowPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[instrument(skip(self, input_payload), fields(tenant_id = %tenant_id))]
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        label: impl Into<String> + std::fmt::Debug,
        input_payload: serde_json::Value,
        max_attempts: Option<u32>,
        idempotency_key: Option<String>,
    ) -> Result<Job, JobQueueError> {
        let now = self.now();

        if let Some(key) = idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_by_idempotency_key(tenant_id, key).await? {
                if !existing.status.is_terminal() {
                    debug!(job_id = %existing.id, "idempotent submit returned existing job");
                    return Ok(existing);
                }
            }
        }

        triggerlog::check_rate_limit(
            self.store.as_ref(),
            tenant_id,
            self.config.jobs_per_min_limit,
            now,
        )
        .await?;

        let max_attempts = max_attempts.unwrap_or(3).clamp(1, 10);
        let mut job = state_machine::submit(
            tenant_id,
            label.into(),
            input_payload,
            max_attempts,
            idempotency_key.clone(),
            now,
        );

        if !self.store.insert_job(&job).await? {
            // Lost a unique-constraint race on (tenant_id, idempotency_key).
            if let Some(key) = idempotency_key.as_deref() {
                if let Some(existing) =
                    self.store.find_by_idempotency_key(tenant_id, key).await?
                {
                    return Ok(existing);
                }
            }
            return Err(JobQueueError::Conflict(
                "job could not be inserted".to_string(),
            ));
        }

        self.store
            .insert_trigger(&JobTrigger {
                tenant_id,
                job_id: Some(job.id),
                triggered_at: now,
            })
            .await?;

        info!(job_id = %job.id, "job submitted");
        self.queue.enqueue(job.id).await?;
        job.updated_at = now;
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn retry(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobQueueError> {
        self.retry_or_replay(tenant_id, job_id, &[JobStatus::Failed, JobStatus::Done], false)
            .await
    }

    #[instrument(skip(self))]
    pub async fn replay(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobQueueError> {
        self.retry_or_replay(tenant_id, job_id, &[JobStatus::Dlq], true)
            .await
    }

    async fn retry_or_replay(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        allowed: &[JobStatus],
        replayed: bool,
    ) -> Result<Job, JobQueueError> {
        let now = self.now();
        triggerlog::check_rate_limit(
            self.store.as_ref(),
            tenant_id,
            self.config.jobs_per_min_limit,
            now,
        )
        .await?;

        let mut job = self
            .store
            .lock_job(job_id)
            .await?
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or(JobQueueError::NotFound)?;

        if !allowed.contains(&job.status) {
            return Err(JobQueueError::Conflict(format!(
                "job in status {:?} cannot be {}",
                job.status,
                if replayed { "replayed" } else { "retried" }
            )));
        }

        state_machine::reset_for_retry(&mut job, now, replayed);
        self.store.save_job(&job).await?;
        self.store
            .insert_trigger(&JobTrigger {
                tenant_id,
                job_id: Some(job.id),
                triggered_at: now,
            })
            .await?;

        self.queue.enqueue(job.id).await?;
        Ok(job)
    }

    /// `POST /jobs/lease` — worker-facing. Selects the oldest eligible job
    /// for the tenant and applies lease-accept/throttle/dlq-on-lease.
    /// Returns `Ok(None)` when there is nothing to do.
    #[instrument(skip(self))]
    pub async fn lease(
        &self,
        tenant_id: TenantId,
        worker_id: &str,
        lease_seconds: u64,
    ) -> Result<Option<Job>, JobQueueError> {
        let now = self.now();
        let Some(mut job) = self.store.lock_next_leasable(tenant_id, now).await? else {
            return Ok(None);
        };

        let concurrent_running = self.store.count_running(tenant_id).await?;
        let outcome = state_machine::attempt_lease(
            &mut job,
            worker_id,
            lease_seconds,
            concurrent_running,
            &self.config,
            now,
        );
        self.store.save_job(&job).await?;
        debug!(job_id = %job.id, ?outcome, "lease attempt");
        Ok(Some(job))
    }

    #[instrument(skip(self))]
    pub async fn progress(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        new_progress: u8,
        processed_rows: u64,
        stage: Option<JobStage>,
    ) -> Result<Job, JobQueueError> {
        let now = self.now();
        let mut job = self.load_locked(tenant_id, job_id).await?;
        state_machine::progress(
            &mut job,
            new_progress,
            processed_rows,
            stage,
            self.config.job_lease_seconds,
            now,
        )?;
        self.store.save_job(&job).await?;
        Ok(job)
    }

    /// `complete` — if `output_result` is omitted and a `RowPipeline` is
    /// attached, invokes it synchronously against `input_payload` first
    /// (`spec.md` §4.2). Otherwise the caller (typically the Runner) has
    /// already produced the result.
    #[instrument(skip(self, output_result))]
    pub async fn complete(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        output_result: Option<serde_json::Value>,
    ) -> Result<Job, JobQueueError> {
        let output_result = match output_result {
            Some(result) => result,
            None => {
                let pipeline = self.pipeline.as_ref().ok_or_else(|| {
                    JobQueueError::Validation(
                        "output_result omitted and no RowPipeline is attached".into(),
                    )
                })?;
                let job = self.load_locked(tenant_id, job_id).await?;
                let reporter = RunnerProgressReporter {
                    store: self.store.clone(),
                    clock: self.clock.clone(),
                    job_id,
                    lease_seconds: self.config.job_lease_seconds,
                };
                pipeline.run(&job.input_payload, &reporter).await?
            }
        };

        let now = self.now();
        let mut job = self.load_locked(tenant_id, job_id).await?;
        state_machine::complete(&mut job, output_result, now)?;
        self.store.save_job(&job).await?;
        info!(job_id = %job.id, "job completed");
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn fail(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        reason: impl Into<String> + std::fmt::Debug,
        retry_in_seconds: Option<u64>,
    ) -> Result<Job, JobQueueError> {
        let now = self.now();
        let mut job = self.load_locked(tenant_id, job_id).await?;
        state_machine::fail(&mut job, reason.into(), retry_in_seconds, &self.config, now)?;
        self.store.save_job(&job).await?;
        warn!(job_id = %job.id, status = ?job.status, "job failed");
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn stats(&self, tenant_id: TenantId) -> Result<Stats, JobQueueError> {
        let now = self.now();
        let counts = self.store.count_by_status(tenant_id).await?;
        let mut stats = Stats {
            pending: 0,
            throttled: 0,
            running: 0,
            done: 0,
            failed: 0,
            dlq: 0,
            triggers_last_minute: 0,
            concurrent_running: 0,
            concurrent_jobs_limit: self.config.concurrent_jobs_limit,
            jobs_per_min_limit: self.config.jobs_per_min_limit,
        };
        for (status, count) in counts {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Throttled => stats.throttled = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Done => stats.done = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Dlq => stats.dlq = count,
            }
        }
        stats.concurrent_running = self.store.count_running(tenant_id).await?;
        let window_start = now - chrono::Duration::seconds(triggerlog::WINDOW_SECONDS);
        stats.triggers_last_minute = self
            .store
            .count_recent_triggers(tenant_id, window_start, now)
            .await?;
        Ok(stats)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, tenant_id: TenantId, job_id: JobId) -> Result<(), JobQueueError> {
        if !self.store.delete_job(tenant_id, job_id).await? {
            return Err(JobQueueError::NotFound);
        }
        Ok(())
    }

    async fn load_locked(&self, tenant_id: TenantId, job_id: JobId) -> Result<Job, JobQueueError> {
        self.store
            .lock_job(job_id)
            .await?
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or(JobQueueError::NotFound)
    }
}
