//! The Reconciler: a periodic sweep that repairs lease expiry, throttle
//! readiness, failed-retry readiness, and pending timeouts.
//!
//! Each job is handled under its own row lock; a failure on one row must not
//! block others. Each pass processes at most [`MAX_PER_CATEGORY`] jobs per
//! category.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::model::JobId;
use crate::state_machine;
use crate::store::{JobQueue, Store};

pub const MAX_PER_CATEGORY: u32 = 50;

pub struct Reconciler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl Reconciler {
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
        }
    }

    pub fn scan_interval(&self) -> StdDuration {
        self.config.retry_scan_interval()
    }

    /// Run the four reconciliation categories in order, once.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let now = self.clock.now();

        let pending_timed_out = self
            .store
            .scan_pending_timed_out(now, self.config.job_pending_timeout_seconds, MAX_PER_CATEGORY)
            .await?;
        let mut moved = 0;
        for job_id in &pending_timed_out {
            if self.reconcile_one(*job_id, |job, now| {
                state_machine::reconcile_pending_timeout(
                    job,
                    self.config.job_pending_timeout_seconds,
                    &self.config,
                    now,
                )
            })
            .await
            {
                moved += 1;
            }
        }
        info!(category = "pending_timeout", scanned = pending_timed_out.len(), moved, "reconciler pass");

        let throttled_ready = self
            .store
            .scan_throttled_ready(now, MAX_PER_CATEGORY)
            .await?;
        let mut re_enqueued = 0;
        for job_id in &throttled_ready {
            if self
                .reconcile_one(*job_id, |job, now| state_machine::reconcile_throttled_ready(job, now))
                .await
            {
                self.queue.enqueue(*job_id).await?;
                re_enqueued += 1;
            }
        }
        info!(category = "throttled_ready", scanned = throttled_ready.len(), re_enqueued, "reconciler pass");

        let failed_ready = self.store.scan_failed_ready(now, MAX_PER_CATEGORY).await?;
        let mut retried = 0;
        for job_id in &failed_ready {
            let job_after = self.reconcile_one_returning(*job_id, |job, now| {
                state_machine::reconcile_failed_ready(job, now)
            })
            .await;
            if let Some(job) = job_after {
                if job.status == crate::model::JobStatus::Pending {
                    self.queue.enqueue(*job_id).await?;
                    retried += 1;
                }
            }
        }
        info!(category = "failed_ready", scanned = failed_ready.len(), retried, "reconciler pass");

        let lease_expired = self.store.scan_lease_expired(now, MAX_PER_CATEGORY).await?;
        let mut recovered = 0;
        for job_id in &lease_expired {
            if self
                .reconcile_one(*job_id, |job, now| {
                    state_machine::reconcile_lease_expired(job, &self.config, now)
                })
                .await
            {
                recovered += 1;
            }
        }
        info!(category = "lease_expired", scanned = lease_expired.len(), recovered, "reconciler pass");

        Ok(())
    }

    async fn reconcile_one(
        &self,
        job_id: JobId,
        apply: impl FnOnce(&mut crate::model::Job, chrono::DateTime<chrono::Utc>) -> bool,
    ) -> bool {
        self.reconcile_one_returning(job_id, apply).await.is_some()
    }

    async fn reconcile_one_returning(
        &self,
        job_id: JobId,
        apply: impl FnOnce(&mut crate::model::Job, chrono::DateTime<chrono::Utc>) -> bool,
    ) -> Option<crate::model::Job> {
        let now = self.clock.now();
        let job = match self.store.lock_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(err) => {
                warn!(job_id = %job_id, %err, "reconciler failed to lock job, skipping");
                return None;
            }
        };
        let mut job = job;
        if !apply(&mut job, now) {
            return None;
        }
        if let Err(err) = self.store.save_job(&job).await {
            warn!(job_id = %job_id, %err, "reconciler failed to save job, skipping");
            return None;
        }
        Some(job)
    }
}
