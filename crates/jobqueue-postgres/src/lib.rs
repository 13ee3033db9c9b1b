//! PostgreSQL implementation of `jobqueue-core`'s [`Store`] trait.
//!
//! # Database schema
//!
//! See `migrations/0001_init.sql` for the full DDL. In short:
//!
//! ```sql
//! CREATE TYPE job_status AS ENUM ('PENDING', 'THROTTLED', 'RUNNING', 'DONE', 'FAILED', 'DLQ');
//! CREATE TYPE job_stage AS ENUM ('VALIDATING', 'PROCESSING', 'FINALIZING', 'DONE');
//!
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY,
//!     tenant_id UUID NOT NULL,
//!     status job_status NOT NULL DEFAULT 'PENDING',
//!     ...
//!     input_payload JSONB NOT NULL DEFAULT '{}'::jsonb,
//!     output_result JSONB NOT NULL DEFAULT 'null'::jsonb,
//!     events JSONB NOT NULL DEFAULT '[]'::jsonb,
//!     ...
//! );
//!
//! CREATE UNIQUE INDEX idx_jobs_tenant_idempotency_key ON jobs (tenant_id, idempotency_key)
//!     WHERE idempotency_key IS NOT NULL;
//! CREATE INDEX idx_jobs_tenant_status ON jobs (tenant_id, status);
//! CREATE INDEX idx_jobs_next_run_at ON jobs (next_run_at) WHERE next_run_at IS NOT NULL;
//!
//! CREATE TABLE job_triggers (
//!     id BIGSERIAL PRIMARY KEY,
//!     tenant_id UUID NOT NULL,
//!     job_id UUID REFERENCES jobs (id) ON DELETE CASCADE,
//!     triggered_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX idx_job_triggers_tenant_triggered_at ON job_triggers (tenant_id, triggered_at);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobqueue_postgres::PgStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/jobqueue").await?;
//! sqlx::migrate!().run(&pool).await?;
//! let store = PgStore::new(pool);
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobqueue_core::{Job, JobEvent, JobId, JobStage, JobStatus, JobTrigger, Store, TenantId};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "PENDING",
        JobStatus::Throttled => "THROTTLED",
        JobStatus::Running => "RUNNING",
        JobStatus::Done => "DONE",
        JobStatus::Failed => "FAILED",
        JobStatus::Dlq => "DLQ",
    }
}

fn status_from_str(s: &str) -> anyhow::Result<JobStatus> {
    Ok(match s {
        "PENDING" => JobStatus::Pending,
        "THROTTLED" => JobStatus::Throttled,
        "RUNNING" => JobStatus::Running,
        "DONE" => JobStatus::Done,
        "FAILED" => JobStatus::Failed,
        "DLQ" => JobStatus::Dlq,
        other => anyhow::bail!("unknown job_status {other}"),
    })
}

fn stage_to_str(stage: JobStage) -> &'static str {
    match stage {
        JobStage::Validating => "VALIDATING",
        JobStage::Processing => "PROCESSING",
        JobStage::Finalizing => "FINALIZING",
        JobStage::Done => "DONE",
    }
}

fn stage_from_str(s: &str) -> anyhow::Result<JobStage> {
    Ok(match s {
        "VALIDATING" => JobStage::Validating,
        "PROCESSING" => JobStage::Processing,
        "FINALIZING" => JobStage::Finalizing,
        "DONE" => JobStage::Done,
        other => anyhow::bail!("unknown job_stage {other}"),
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> anyhow::Result<Job> {
    let events_json: serde_json::Value = row.try_get("events")?;
    let events: Vec<JobEvent> = serde_json::from_value(events_json)?;

    Ok(Job {
        id: JobId(row.try_get::<Uuid, _>("id")?),
        tenant_id: TenantId(row.try_get::<Uuid, _>("tenant_id")?),
        label: row.try_get("label")?,
        status: status_from_str(row.try_get::<String, _>("status")?.as_str())?,
        stage: stage_from_str(row.try_get::<String, _>("stage")?.as_str())?,
        progress: row.try_get::<i16, _>("progress")? as u8,
        processed_rows: row.try_get::<i64, _>("processed_rows")? as u64,
        total_rows: row.try_get::<i64, _>("total_rows")? as u64,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        locked_by: row.try_get("locked_by")?,
        lease_until: row.try_get("lease_until")?,
        next_retry_at: row.try_get("next_retry_at")?,
        next_run_at: row.try_get("next_run_at")?,
        throttle_count: row.try_get::<i32, _>("throttle_count")? as u32,
        failure_reason: row.try_get("failure_reason")?,
        idempotency_key: row.try_get("idempotency_key")?,
        input_payload: row.try_get("input_payload")?,
        output_result: row.try_get("output_result")?,
        events,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_ran_at: row.try_get("last_ran_at")?,
    })
}

/// PostgreSQL-backed job store. Row locking for `lock_job` and
/// `lock_next_leasable` uses `SELECT … FOR UPDATE`; every mutation happens
/// through `lock_job`/`save_job` or `lock_next_leasable`/`save_job` pairs so
/// the lock scopes exactly one engine transition.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool, for migrations and health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_job(&self, job: &Job) -> Result<bool> {
        let events_json = serde_json::to_value(&job.events)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, tenant_id, label, status, stage, progress, processed_rows, total_rows,
                attempts, max_attempts, locked_by, lease_until, next_retry_at, next_run_at,
                throttle_count, failure_reason, idempotency_key, input_payload, output_result,
                events, created_at, updated_at, last_ran_at
            ) VALUES (
                $1, $2, $3, $4::job_status, $5::job_stage, $6, $7, $8,
                $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19,
                $20, $21, $22, $23
            )
            ON CONFLICT (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            "#,
        )
        .bind(job.id.0)
        .bind(job.tenant_id.0)
        .bind(&job.label)
        .bind(status_to_str(job.status))
        .bind(stage_to_str(job.stage))
        .bind(job.progress as i16)
        .bind(job.processed_rows as i64)
        .bind(job.total_rows as i64)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(&job.locked_by)
        .bind(job.lease_until)
        .bind(job.next_retry_at)
        .bind(job.next_run_at)
        .bind(job.throttle_count as i32)
        .bind(&job.failure_reason)
        .bind(&job.idempotency_key)
        .bind(&job.input_payload)
        .bind(&job.output_result)
        .bind(events_json)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.last_ran_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn lock_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let events_json = serde_json::to_value(&job.events)?;
        sqlx::query(
            r#"
            UPDATE jobs SET
                label = $2, status = $3::job_status, stage = $4::job_stage, progress = $5,
                processed_rows = $6, total_rows = $7, attempts = $8, max_attempts = $9,
                locked_by = $10, lease_until = $11, next_retry_at = $12, next_run_at = $13,
                throttle_count = $14, failure_reason = $15, idempotency_key = $16,
                input_payload = $17, output_result = $18, events = $19,
                updated_at = $20, last_ran_at = $21
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(&job.label)
        .bind(status_to_str(job.status))
        .bind(stage_to_str(job.stage))
        .bind(job.progress as i16)
        .bind(job.processed_rows as i64)
        .bind(job.total_rows as i64)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(&job.locked_by)
        .bind(job.lease_until)
        .bind(job.next_retry_at)
        .bind(job.next_run_at)
        .bind(job.throttle_count as i32)
        .bind(&job.failure_reason)
        .bind(&job.idempotency_key)
        .bind(&job.input_payload)
        .bind(&job.output_result)
        .bind(events_json)
        .bind(job.updated_at)
        .bind(job.last_ran_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, tenant_id: TenantId, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 AND tenant_id = $2")
            .bind(id.0)
            .bind(tenant_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_by_idempotency_key(&self, tenant_id: TenantId, key: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2")
            .bind(tenant_id.0)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE tenant_id = $1 AND status = $2::job_status \
                     ORDER BY created_at DESC LIMIT $3 OFFSET $4",
                )
                .bind(tenant_id.0)
                .bind(status_to_str(status))
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE tenant_id = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                )
                .bind(tenant_id.0)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(row_to_job).collect()
    }

    async fn delete_job(&self, tenant_id: TenantId, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND tenant_id = $2")
            .bind(id.0)
            .bind(tenant_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_by_status(&self, tenant_id: TenantId) -> Result<Vec<(JobStatus, u64)>> {
        let rows = sqlx::query(
            "SELECT status::text AS status, COUNT(*) AS count FROM jobs \
             WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status = status_from_str(row.try_get::<String, _>("status")?.as_str())?;
                let count: i64 = row.try_get("count")?;
                Ok((status, count as u64))
            })
            .collect()
    }

    async fn lock_next_leasable(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<Option<Job>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE tenant_id = $1
              AND (
                status = 'PENDING'::job_status
                OR (status = 'THROTTLED'::job_status AND (next_run_at IS NULL OR next_run_at <= $2))
              )
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(tenant_id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn scan_pending_timed_out(
        &self,
        now: DateTime<Utc>,
        pending_timeout_seconds: u64,
        limit: u32,
    ) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'PENDING'::job_status \
             AND updated_at < $1 - make_interval(secs => $2) LIMIT $3",
        )
        .bind(now)
        .bind(pending_timeout_seconds as f64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| JobId(r.get::<Uuid, _>("id"))).collect())
    }

    async fn scan_throttled_ready(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'THROTTLED'::job_status \
             AND (next_run_at IS NULL OR next_run_at <= $1) LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| JobId(r.get::<Uuid, _>("id"))).collect())
    }

    async fn scan_failed_ready(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'FAILED'::job_status \
             AND (next_retry_at IS NULL OR next_retry_at <= $1) LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| JobId(r.get::<Uuid, _>("id"))).collect())
    }

    async fn scan_lease_expired(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'RUNNING'::job_status AND lease_until < $1 LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| JobId(r.get::<Uuid, _>("id"))).collect())
    }

    async fn insert_trigger(&self, trigger: &JobTrigger) -> Result<()> {
        sqlx::query("INSERT INTO job_triggers (tenant_id, job_id, triggered_at) VALUES ($1, $2, $3)")
            .bind(trigger.tenant_id.0)
            .bind(trigger.job_id.map(|id| id.0))
            .bind(trigger.triggered_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_recent_triggers(
        &self,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM job_triggers \
             WHERE tenant_id = $1 AND triggered_at >= $2 AND triggered_at <= $3",
        )
        .bind(tenant_id.0)
        .bind(window_start)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    async fn oldest_trigger_in_window(
        &self,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(triggered_at) AS oldest FROM job_triggers \
             WHERE tenant_id = $1 AND triggered_at >= $2 AND triggered_at <= $3",
        )
        .bind(tenant_id.0)
        .bind(window_start)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("oldest")?)
    }

    async fn count_running(&self, tenant_id: TenantId) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM jobs WHERE tenant_id = $1 AND status = 'RUNNING'::job_status",
        )
        .bind(tenant_id.0)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u32)
    }
}
