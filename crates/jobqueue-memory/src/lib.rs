//! In-memory [`Store`] and [`JobQueue`] implementation, backed by
//! `dashmap`. Intended for the demo binary and as a lightweight deployment
//! target that doesn't need Postgres; not a substitute for `jobqueue-postgres`
//! under real concurrent load — it serializes every operation behind a
//! single mutex rather than locking rows individually.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jobqueue_core::{Job, JobId, JobQueue, JobStatus, JobTrigger, Store, TenantId};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<JobId, Job>,
    triggers: Mutex<Vec<JobTrigger>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<bool> {
        if let Some(key) = job.idempotency_key.as_deref() {
            let clash = self
                .jobs
                .iter()
                .any(|e| e.tenant_id == job.tenant_id && e.idempotency_key.as_deref() == Some(key));
            if clash {
                return Ok(false);
            }
        }
        self.jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn lock_job(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|e| e.clone()))
    }

    async fn save_job(&self, job: &Job) -> anyhow::Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, tenant_id: TenantId, id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self
            .jobs
            .get(&id)
            .filter(|j| j.tenant_id == tenant_id)
            .map(|e| e.clone()))
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> anyhow::Result<Option<Job>> {
        Ok(self
            .jobs
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.idempotency_key.as_deref() == Some(key))
            .map(|e| e.clone()))
    }

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> anyhow::Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| status.map(|s| e.status == s).unwrap_or(true))
            .map(|e| e.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn delete_job(&self, tenant_id: TenantId, id: JobId) -> anyhow::Result<bool> {
        if self.jobs.get(&id).map(|j| j.tenant_id) != Some(tenant_id) {
            return Ok(false);
        }
        Ok(self.jobs.remove(&id).is_some())
    }

    async fn count_by_status(&self, tenant_id: TenantId) -> anyhow::Result<Vec<(JobStatus, u64)>> {
        let statuses = [
            JobStatus::Pending,
            JobStatus::Throttled,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Dlq,
        ];
        Ok(statuses
            .into_iter()
            .map(|s| {
                let count = self
                    .jobs
                    .iter()
                    .filter(|e| e.tenant_id == tenant_id && e.status == s)
                    .count() as u64;
                (s, count)
            })
            .collect())
    }

    async fn lock_next_leasable(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Job>> {
        let mut candidates: Vec<Job> = self
            .jobs
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| match e.status {
                JobStatus::Pending => true,
                JobStatus::Throttled => e.next_run_at.map(|t| t <= now).unwrap_or(true),
                _ => false,
            })
            .map(|e| e.clone())
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(candidates.into_iter().next())
    }

    async fn scan_pending_timed_out(
        &self,
        now: DateTime<Utc>,
        pending_timeout_seconds: u64,
        limit: u32,
    ) -> anyhow::Result<Vec<JobId>> {
        let deadline = chrono::Duration::seconds(pending_timeout_seconds as i64);
        Ok(self
            .jobs
            .iter()
            .filter(|e| e.status == JobStatus::Pending && e.updated_at + deadline < now)
            .take(limit as usize)
            .map(|e| e.id)
            .collect())
    }

    async fn scan_throttled_ready(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> anyhow::Result<Vec<JobId>> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| {
                e.status == JobStatus::Throttled
                    && e.next_run_at.map(|t| t <= now).unwrap_or(true)
            })
            .take(limit as usize)
            .map(|e| e.id)
            .collect())
    }

    async fn scan_failed_ready(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<JobId>> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| {
                e.status == JobStatus::Failed
                    && e.next_retry_at.map(|t| t <= now).unwrap_or(true)
            })
            .take(limit as usize)
            .map(|e| e.id)
            .collect())
    }

    async fn scan_lease_expired(&self, now: DateTime<Utc>, limit: u32) -> anyhow::Result<Vec<JobId>> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| {
                e.status == JobStatus::Running && e.lease_until.map(|t| t < now).unwrap_or(false)
            })
            .take(limit as usize)
            .map(|e| e.id)
            .collect())
    }

    async fn insert_trigger(&self, trigger: &JobTrigger) -> anyhow::Result<()> {
        self.triggers.lock().unwrap().push(trigger.clone());
        Ok(())
    }

    async fn count_recent_triggers(
        &self,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let triggers = self.triggers.lock().unwrap();
        Ok(triggers
            .iter()
            .filter(|t| {
                t.tenant_id == tenant_id && t.triggered_at >= window_start && t.triggered_at <= now
            })
            .count() as u64)
    }

    async fn oldest_trigger_in_window(
        &self,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let triggers = self.triggers.lock().unwrap();
        Ok(triggers
            .iter()
            .filter(|t| {
                t.tenant_id == tenant_id && t.triggered_at >= window_start && t.triggered_at <= now
            })
            .map(|t| t.triggered_at)
            .min())
    }

    async fn count_running(&self, tenant_id: TenantId) -> anyhow::Result<u32> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.status == JobStatus::Running)
            .count() as u32)
    }
}

/// An in-process job queue that hands `job_id`s to whatever consumer drains
/// `receiver()` — typically a loop that calls `Runner::run_once`.
pub struct MemoryJobQueue {
    sender: mpsc::UnboundedSender<JobId>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Takes the receiving half. Can only be called once.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<JobId>> {
        self.receiver.lock().unwrap().take()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job_id: JobId) -> anyhow::Result<()> {
        self.sender.send(job_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId(Uuid::new_v4())
    }

    #[tokio::test]
    async fn insert_and_lock_roundtrip() {
        let store = MemoryStore::new();
        let job = Job::new(tenant(), "t", serde_json::json!({}), 3, None, Utc::now());
        assert!(store.insert_job(&job).await.unwrap());
        let fetched = store.lock_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[tokio::test]
    async fn idempotency_key_collision_rejected() {
        let store = MemoryStore::new();
        let tenant_id = tenant();
        let job1 = Job::new(
            tenant_id,
            "a",
            serde_json::json!({}),
            3,
            Some("k1".to_string()),
            Utc::now(),
        );
        let job2 = Job::new(
            tenant_id,
            "b",
            serde_json::json!({}),
            3,
            Some("k1".to_string()),
            Utc::now(),
        );
        assert!(store.insert_job(&job1).await.unwrap());
        assert!(!store.insert_job(&job2).await.unwrap());
    }
}
