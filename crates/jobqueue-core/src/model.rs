//! The Job and JobTrigger data model.
//!
//! A `Job` is the central entity of the engine: every field here is part of
//! the persisted row, and every mutation to a `Job` happens through the
//! [`crate::state_machine`] transitions, never ad hoc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque tenant identifier, derived upstream from an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Throttled,
    Running,
    Done,
    Failed,
    Dlq,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Dlq)
    }
}

/// Presentation-only progress marker, independent of `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStage {
    Validating,
    Processing,
    Finalizing,
    Done,
}

/// The kind of append-only event recorded against a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    Submitted,
    Leased,
    ProgressUpdated,
    Throttled,
    Failed,
    MovedToDlq,
    Done,
    RetryScheduled,
}

/// One entry in a job's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The central job entity. Every field here is part of the persisted row;
/// `events` is the append-only log embedded directly in it (no object-graph
/// cycle — see `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub label: String,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: u8,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_by: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub throttle_count: u32,
    pub failure_reason: Option<String>,
    pub idempotency_key: Option<String>,
    pub input_payload: serde_json::Value,
    pub output_result: serde_json::Value,
    pub events: Vec<JobEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_ran_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Construct a freshly submitted job. Callers go through
    /// [`crate::state_machine::submit`] rather than this directly, but the
    /// constructor lives here since it owns every default value.
    pub fn new(
        tenant_id: TenantId,
        label: impl Into<String>,
        input_payload: serde_json::Value,
        max_attempts: u32,
        idempotency_key: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            label: label.into(),
            status: JobStatus::Pending,
            stage: JobStage::Validating,
            progress: 0,
            processed_rows: 0,
            total_rows: 0,
            attempts: 0,
            max_attempts: max_attempts.clamp(1, 10),
            locked_by: None,
            lease_until: None,
            next_retry_at: None,
            next_run_at: None,
            throttle_count: 0,
            failure_reason: None,
            idempotency_key,
            input_payload,
            output_result: serde_json::Value::Null,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
            last_ran_at: None,
        }
    }

    pub fn add_event(&mut self, event_type: JobEventType, now: DateTime<Utc>) {
        self.add_event_with_metadata(event_type, now, None);
    }

    pub fn add_event_with_metadata(
        &mut self,
        event_type: JobEventType,
        now: DateTime<Utc>,
        metadata: Option<serde_json::Value>,
    ) {
        self.events.push(JobEvent {
            event_type,
            timestamp: now,
            metadata,
        });
        self.updated_at = now;
    }

    /// Checks the invariants from `spec.md` §3. Intended for debug assertions
    /// and property tests, not for hot-path validation.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.status {
            JobStatus::Running => {
                if self.locked_by.is_none() || self.lease_until.is_none() {
                    return Err("RUNNING job missing locked_by/lease_until".into());
                }
                if self.next_run_at.is_some() {
                    return Err("RUNNING job must not have next_run_at".into());
                }
            }
            JobStatus::Throttled => {
                if self.next_run_at.is_none() {
                    return Err("THROTTLED job missing next_run_at".into());
                }
                if self.locked_by.is_some() || self.lease_until.is_some() {
                    return Err("THROTTLED job must not hold a lease".into());
                }
            }
            JobStatus::Failed => {
                if self.attempts < 1 {
                    return Err("FAILED job must have attempts >= 1".into());
                }
                if self.next_retry_at.is_none() {
                    return Err("FAILED job missing next_retry_at".into());
                }
                if self.locked_by.is_some() {
                    return Err("FAILED job must not hold a lease".into());
                }
            }
            JobStatus::Dlq => {
                if self.attempts < self.max_attempts {
                    return Err("DLQ job must have exhausted attempts".into());
                }
                if self.locked_by.is_some() {
                    return Err("DLQ job must not hold a lease".into());
                }
            }
            JobStatus::Done => {
                if self.progress != 100 {
                    return Err("DONE job must have progress = 100".into());
                }
                if self.processed_rows != self.total_rows {
                    return Err("DONE job must have processed_rows = total_rows".into());
                }
            }
            JobStatus::Pending => {}
        }
        if self.progress > 100 {
            return Err("progress out of range".into());
        }
        Ok(())
    }
}

/// One row per externally-initiated run of a job (create, retry, replay).
/// Append-only; consulted only by the rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTrigger {
    pub tenant_id: TenantId,
    pub job_id: Option<JobId>,
    pub triggered_at: DateTime<Utc>,
}
