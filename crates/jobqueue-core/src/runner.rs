//! The Runner: activated once per `enqueue(job_id)`. Decoupled from the
//! Dispatcher through the [`crate::store::JobQueue`] abstraction.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::model::{JobId, JobStage, JobStatus};
use crate::state_machine::{self, LeaseOutcome};
use crate::store::{ProgressReporter, RowPipeline, Store};

/// Hands the `RowPipeline` a capability to report progress mid-run. Each
/// call is its own short transaction; the reporter also renews the lease by
/// virtue of going through [`state_machine::progress`]. Shared by the
/// Runner's background loop and the Dispatcher's synchronous `complete`
/// path (`spec.md` §4.2: "if output_result omitted, invoke RowPipeline
/// synchronously").
pub(crate) struct RunnerProgressReporter {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) job_id: JobId,
    pub(crate) lease_seconds: u64,
}

#[async_trait]
impl ProgressReporter for RunnerProgressReporter {
    async fn report(
        &self,
        progress: u8,
        processed_rows: u64,
        stage: Option<JobStage>,
    ) -> anyhow::Result<()> {
        let now = self.clock.now();
        let Some(mut job) = self.store.lock_job(self.job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Running {
            // Reconciler or an administrative delete already moved this job
            // on; the pipeline's progress report is stale.
            return Ok(());
        }
        if let Err(err) =
            state_machine::progress(&mut job, progress, processed_rows, stage, self.lease_seconds, now)
        {
            warn!(job_id = %self.job_id, %err, "stale progress report ignored");
            return Ok(());
        }
        self.store.save_job(&job).await?;
        Ok(())
    }
}

pub struct Runner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    pipeline: Arc<dyn RowPipeline>,
    config: Config,
}

impl Runner {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        pipeline: Arc<dyn RowPipeline>,
        config: Config,
    ) -> Self {
        Self {
            store,
            clock,
            pipeline,
            config,
        }
    }

    /// Run one activation for `job_id`. Each numbered step from `spec.md`
    /// §4.3 is its own short transaction.
    #[instrument(skip(self))]
    pub async fn run_once(&self, job_id: JobId) -> anyhow::Result<()> {
        let now = self.clock.now();

        // Step 1: lease-or-throttle under a fresh row lock.
        let Some(mut job) = self.store.lock_job(job_id).await? else {
            return Ok(());
        };
        let ready = match job.status {
            JobStatus::Pending => true,
            JobStatus::Throttled => job.next_run_at.map(|t| t <= now).unwrap_or(true),
            _ => false,
        };
        if !ready {
            return Ok(());
        }

        let tenant_id = job.tenant_id;
        let concurrent_running = self.store.count_running(tenant_id).await?;
        let worker_id = format!("runner-{}", uuid::Uuid::new_v4());
        let outcome = state_machine::attempt_lease(
            &mut job,
            &worker_id,
            self.config.job_lease_seconds,
            concurrent_running,
            &self.config,
            now,
        );
        self.store.save_job(&job).await?;

        if outcome != LeaseOutcome::Leased {
            return Ok(());
        }

        // Step 2: drop the transaction and run the pipeline.
        let input_payload = job.input_payload.clone();
        let reporter = RunnerProgressReporter {
            store: self.store.clone(),
            clock: self.clock.clone(),
            job_id,
            lease_seconds: self.config.job_lease_seconds,
        };
        let result = self.pipeline.run(&input_payload, &reporter).await;

        match result {
            Ok(output) => {
                // Step 3: re-lock, verify still RUNNING, complete.
                let now = self.clock.now();
                let Some(mut job) = self.store.lock_job(job_id).await? else {
                    return Ok(());
                };
                if job.status != JobStatus::Running {
                    info!(job_id = %job_id, status = ?job.status, "abandoning completion, reconciler already acted");
                    return Ok(());
                }
                state_machine::complete(&mut job, output, now)?;
                self.store.save_job(&job).await?;
                info!(job_id = %job_id, "pipeline completed job");
                Ok(())
            }
            Err(err) => {
                // Step 4: re-lock, fail-retryable/fail-terminal.
                let now = self.clock.now();
                if let Some(mut job) = self.store.lock_job(job_id).await? {
                    if job.status == JobStatus::Running {
                        state_machine::apply_fail_effect(
                            &mut job,
                            err.to_string(),
                            None,
                            &self.config,
                            now,
                        );
                        self.store.save_job(&job).await?;
                    }
                }
                error!(job_id = %job_id, %err, "pipeline failed job");
                Err(err)
            }
        }
    }
}
