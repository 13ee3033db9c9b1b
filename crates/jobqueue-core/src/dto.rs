//! Serde DTOs for the tenant-facing HTTP contract described in `spec.md`
//! §6. HTTP parsing itself is out of scope for this crate; these types
//! exist so a transport layer built on top is a thin adapter rather than a
//! rewrite.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, JobQueueError};
use crate::model::{Job, JobStage, JobStatus};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    Json,
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub label: String,
    pub input_mode: InputMode,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub csv_file: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseRequest {
    pub worker_id: String,
    #[serde(default)]
    pub lease_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressRequest {
    pub progress: u8,
    pub processed_rows: u64,
    #[serde(default)]
    pub stage: Option<JobStage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub output_result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailRequest {
    pub failure_reason: String,
    #[serde(default)]
    pub retry_in_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub tenant_id: String,
    pub label: String,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: u8,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub failure_reason: Option<String>,
    pub input_payload: serde_json::Value,
    pub output_result: serde_json::Value,
    pub events: Vec<crate::model::JobEvent>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            tenant_id: job.tenant_id.to_string(),
            label: job.label.clone(),
            status: job.status,
            stage: job.stage,
            progress: job.progress,
            processed_rows: job.processed_rows,
            total_rows: job.total_rows,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            failure_reason: job.failure_reason.clone(),
            input_payload: job.input_payload.clone(),
            output_result: job.output_result.clone(),
            events: job.events.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsView {
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

impl From<&crate::dispatcher::Stats> for StatsView {
    fn from(s: &crate::dispatcher::Stats) -> Self {
        Self {
            pending: s.pending,
            throttled: s.throttled,
            running: s.running,
            done: s.done,
            failed: s.failed,
            dlq: s.dlq,
            triggers_last_minute: s.triggers_last_minute,
            concurrent_running: s.concurrent_running,
            concurrent_jobs_limit: s.concurrent_jobs_limit,
            jobs_per_min_limit: s.jobs_per_min_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Envelope<T> {
    Success {
        success: bool,
        data: T,
        error: Option<()>,
    },
    Failure {
        success: bool,
        data: Option<()>,
        error: ErrorBody,
    },
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope::Success {
            success: true,
            data,
            error: None,
        }
    }
}

impl Envelope<()> {
    pub fn err(e: &JobQueueError) -> Self {
        let code = match e.code() {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotAuthenticated => "not_authenticated",
            ErrorCode::AuthenticationFailed => "authentication_failed",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::NotFound => "not_found",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::ServerError => "server_error",
        };
        let retry_after = match e {
            JobQueueError::RateLimited { retry_after } => Some(retry_after.num_seconds()),
            _ => None,
        };
        Envelope::Failure {
            success: false,
            data: None,
            error: ErrorBody {
                code,
                message: e.to_string(),
                retry_after,
            },
        }
    }
}
