//! The pure job state machine: `(current Job, event, context) -> next Job`.
//!
//! Every function here is synchronous and does no I/O. Callers (Dispatcher,
//! Runner, Reconciler) are responsible for row-locking the `Job` before
//! calling in and persisting it afterwards.

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::JobQueueError;
use crate::model::{Job, JobEventType, JobStage, JobStatus};

/// Outcome of attempting to lease a job that is already known to be in an
/// eligible status (PENDING, or THROTTLED with `next_run_at <= now`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Leased,
    Throttled,
    MovedToDlq,
}

/// `submit` — create a job in PENDING, stage VALIDATING, attempts 0.
pub fn submit(
    tenant_id: crate::model::TenantId,
    label: impl Into<String>,
    input_payload: serde_json::Value,
    max_attempts: u32,
    idempotency_key: Option<String>,
    now: DateTime<Utc>,
) -> Job {
    let mut job = Job::new(
        tenant_id,
        label,
        input_payload,
        max_attempts,
        idempotency_key,
        now,
    );
    job.add_event(JobEventType::Submitted, now);
    job
}

/// `retry` / `replay` — reset a FAILED/DONE/DLQ job back to PENDING.
/// Callers enforce the status guard ({FAILED, DONE} for retry, {DLQ} for
/// replay) before calling this.
pub fn reset_for_retry(job: &mut Job, now: DateTime<Utc>, replayed: bool) {
    job.status = JobStatus::Pending;
    job.stage = JobStage::Validating;
    job.progress = 0;
    job.processed_rows = 0;
    job.attempts = 0;
    job.throttle_count = 0;
    job.failure_reason = None;
    job.output_result = serde_json::Value::Null;
    job.next_retry_at = None;
    job.next_run_at = None;
    job.locked_by = None;
    job.lease_until = None;
    let metadata = if replayed {
        serde_json::json!({"replayed": true})
    } else {
        serde_json::json!({"retried": true})
    };
    job.add_event_with_metadata(JobEventType::Submitted, now, Some(metadata));
}

/// Applies `lease-accept`, `throttle`, or `dlq-on-lease`. The caller must
/// already have confirmed `job.status` is PENDING, or THROTTLED with
/// `next_run_at <= now`.
pub fn attempt_lease(
    job: &mut Job,
    worker_id: &str,
    lease_seconds: u64,
    concurrent_running: u32,
    config: &Config,
    now: DateTime<Utc>,
) -> LeaseOutcome {
    if job.attempts >= job.max_attempts {
        job.status = JobStatus::Dlq;
        job.locked_by = None;
        job.lease_until = None;
        job.next_run_at = None;
        job.add_event(JobEventType::MovedToDlq, now);
        return LeaseOutcome::MovedToDlq;
    }

    if concurrent_running < config.concurrent_jobs_limit {
        job.status = JobStatus::Running;
        job.stage = JobStage::Processing;
        job.progress = job.progress.max(5);
        job.locked_by = Some(worker_id.to_string());
        job.lease_until = Some(now + chrono::Duration::seconds(lease_seconds as i64));
        job.next_run_at = None;
        job.last_ran_at = Some(now);
        job.add_event(JobEventType::Leased, now);
        job.add_event_with_metadata(
            JobEventType::ProgressUpdated,
            now,
            Some(serde_json::json!({"progress": job.progress})),
        );
        LeaseOutcome::Leased
    } else {
        job.status = JobStatus::Throttled;
        // Backoff is computed on the pre-increment count so the first
        // throttle (throttle_count 0 -> 1) yields BASE_BACKOFF, not 2x it.
        let backoff = config.throttle_backoff(job.throttle_count);
        job.throttle_count += 1;
        job.next_run_at = Some(now + backoff);
        job.locked_by = None;
        job.lease_until = None;
        job.add_event_with_metadata(
            JobEventType::Throttled,
            now,
            Some(serde_json::json!({"throttleCount": job.throttle_count})),
        );
        LeaseOutcome::Throttled
    }
}

/// `progress` — status must be RUNNING. Progress must not decrease.
pub fn progress(
    job: &mut Job,
    new_progress: u8,
    processed_rows: u64,
    stage: Option<JobStage>,
    lease_seconds: u64,
    now: DateTime<Utc>,
) -> Result<(), JobQueueError> {
    if job.status != JobStatus::Running {
        return Err(JobQueueError::Conflict(
            "job is not RUNNING, cannot record progress".into(),
        ));
    }
    let new_progress = new_progress.min(100).max(job.progress);
    job.progress = new_progress;
    job.processed_rows = processed_rows;
    if let Some(stage) = stage {
        job.stage = stage;
    }
    job.lease_until = Some(now + chrono::Duration::seconds(lease_seconds as i64));
    job.add_event_with_metadata(
        JobEventType::ProgressUpdated,
        now,
        Some(serde_json::json!({"progress": job.progress, "processedRows": job.processed_rows})),
    );
    Ok(())
}

/// `complete` — status must be RUNNING.
pub fn complete(
    job: &mut Job,
    output_result: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<(), JobQueueError> {
    if job.status != JobStatus::Running {
        return Err(JobQueueError::Conflict(
            "job is not RUNNING, cannot complete".into(),
        ));
    }
    job.status = JobStatus::Done;
    job.stage = JobStage::Done;
    job.progress = 100;
    job.processed_rows = job.total_rows;
    job.locked_by = None;
    job.lease_until = None;
    job.next_run_at = None;
    job.throttle_count = 0;
    job.output_result = output_result;
    job.add_event(JobEventType::Done, now);
    Ok(())
}

/// `fail-retryable` / `fail-terminal` — status must be RUNNING (public
/// Dispatcher path). Reconciler paths reuse [`apply_fail_effect`] directly
/// since they operate on PENDING/RUNNING jobs that never went through the
/// Dispatcher's own guard.
pub fn fail(
    job: &mut Job,
    reason: impl Into<String>,
    retry_in_seconds: Option<u64>,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<(), JobQueueError> {
    if job.status != JobStatus::Running {
        return Err(JobQueueError::Conflict(
            "job is not RUNNING, cannot fail".into(),
        ));
    }
    apply_fail_effect(job, reason, retry_in_seconds, config, now);
    Ok(())
}

/// The shared effect behind `fail-retryable`/`fail-terminal`: increments
/// `attempts`, then either schedules a retry or moves to DLQ depending on
/// whether the budget is exhausted. No status guard — callers (Dispatcher's
/// `fail`, and the Reconciler's pending-timeout/lease-expiry sweeps) each
/// enforce their own precondition before calling in.
pub fn apply_fail_effect(
    job: &mut Job,
    reason: impl Into<String>,
    retry_in_seconds: Option<u64>,
    config: &Config,
    now: DateTime<Utc>,
) {
    let reason = reason.into();
    job.attempts += 1;
    job.locked_by = None;
    job.lease_until = None;
    job.next_run_at = None;
    job.failure_reason = Some(reason.clone());

    if job.attempts >= job.max_attempts {
        job.status = JobStatus::Dlq;
        job.add_event_with_metadata(
            JobEventType::Failed,
            now,
            Some(serde_json::json!({"reason": reason, "attempt": job.attempts})),
        );
        job.add_event_with_metadata(
            JobEventType::MovedToDlq,
            now,
            Some(serde_json::json!({"reason": reason})),
        );
    } else {
        job.status = JobStatus::Failed;
        let retry_in = retry_in_seconds.unwrap_or(config.job_retry_delay_seconds);
        job.next_retry_at = Some(now + chrono::Duration::seconds(retry_in as i64));
        job.add_event_with_metadata(
            JobEventType::Failed,
            now,
            Some(serde_json::json!({"reason": reason, "attempt": job.attempts})),
        );
    }
}

/// `reconcile-throttled-ready` — status THROTTLED, `next_run_at` elapsed.
pub fn reconcile_throttled_ready(job: &mut Job, now: DateTime<Utc>) -> bool {
    if job.status != JobStatus::Throttled {
        return false;
    }
    let ready = job.next_run_at.map(|t| t <= now).unwrap_or(true);
    if !ready {
        return false;
    }
    job.status = JobStatus::Pending;
    job.next_run_at = None;
    job.add_event(JobEventType::RetryScheduled, now);
    true
}

/// `reconcile-pending-timeout` — status PENDING, stuck past the timeout.
/// Treated as fail-retryable/fail-terminal on the current `attempts + 1`.
pub fn reconcile_pending_timeout(
    job: &mut Job,
    pending_timeout_seconds: u64,
    config: &Config,
    now: DateTime<Utc>,
) -> bool {
    if job.status != JobStatus::Pending {
        return false;
    }
    let deadline = job.updated_at + chrono::Duration::seconds(pending_timeout_seconds as i64);
    if deadline > now {
        return false;
    }
    apply_fail_effect(job, "Pending timeout", None, config, now);
    true
}

/// `reconcile-failed-ready` — status FAILED, `next_retry_at` elapsed.
pub fn reconcile_failed_ready(job: &mut Job, now: DateTime<Utc>) -> bool {
    if job.status != JobStatus::Failed {
        return false;
    }
    let ready = job.next_retry_at.map(|t| t <= now).unwrap_or(true);
    if !ready {
        return false;
    }
    if job.attempts >= job.max_attempts {
        job.status = JobStatus::Dlq;
        job.next_retry_at = None;
        job.add_event(JobEventType::MovedToDlq, now);
    } else {
        job.status = JobStatus::Pending;
        job.stage = JobStage::Validating;
        job.next_retry_at = None;
        job.failure_reason = None;
        job.add_event_with_metadata(
            JobEventType::RetryScheduled,
            now,
            Some(serde_json::json!({"attempt": job.attempts + 1})),
        );
    }
    true
}

/// `reconcile-lease-expired` — status RUNNING, `lease_until` elapsed.
pub fn reconcile_lease_expired(job: &mut Job, config: &Config, now: DateTime<Utc>) -> bool {
    if job.status != JobStatus::Running {
        return false;
    }
    let expired = job.lease_until.map(|t| t < now).unwrap_or(false);
    if !expired {
        return false;
    }
    apply_fail_effect(job, "Worker lease expired", None, config, now);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TenantId;
    use uuid::Uuid;

    fn tenant() -> TenantId {
        TenantId(Uuid::new_v4())
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn submit_creates_pending_job_with_submitted_event() {
        let job = submit(tenant(), "label", serde_json::json!({}), 3, None, t(0));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stage, JobStage::Validating);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.events.len(), 1);
        assert_eq!(job.events[0].event_type, JobEventType::Submitted);
    }

    #[test]
    fn throttle_does_not_consume_attempts() {
        let config = Config::default();
        let mut job = submit(tenant(), "label", serde_json::json!({}), 3, None, t(0));
        let outcome = attempt_lease(&mut job, "w1", 60, 2, &config, t(1));
        assert_eq!(outcome, LeaseOutcome::Throttled);
        assert_eq!(job.status, JobStatus::Throttled);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.throttle_count, 1);
        assert!(job.locked_by.is_none());
        assert!(job.next_run_at.unwrap() > t(1));
    }

    #[test]
    fn lease_accept_sets_running_fields() {
        let config = Config::default();
        let mut job = submit(tenant(), "label", serde_json::json!({}), 3, None, t(0));
        let outcome = attempt_lease(&mut job, "w1", 60, 0, &config, t(1));
        assert_eq!(outcome, LeaseOutcome::Leased);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.locked_by.as_deref(), Some("w1"));
        assert!(job.progress >= 5);
        assert!(job.next_run_at.is_none());
    }

    #[test]
    fn dlq_on_lease_when_attempts_exhausted() {
        let config = Config::default();
        let mut job = submit(tenant(), "label", serde_json::json!({}), 1, None, t(0));
        job.attempts = 1;
        let outcome = attempt_lease(&mut job, "w1", 60, 0, &config, t(1));
        assert_eq!(outcome, LeaseOutcome::MovedToDlq);
        assert_eq!(job.status, JobStatus::Dlq);
    }

    #[test]
    fn fail_retryable_then_terminal_sequence() {
        let config = Config::default();
        let mut job = submit(tenant(), "label", serde_json::json!({}), 3, None, t(0));
        attempt_lease(&mut job, "w1", 60, 0, &config, t(1));

        fail(&mut job, "x", None, &config, t(2)).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);

        job.status = JobStatus::Running;
        fail(&mut job, "y", None, &config, t(3)).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);

        job.status = JobStatus::Running;
        fail(&mut job, "z", None, &config, t(4)).unwrap();
        assert_eq!(job.status, JobStatus::Dlq);
        assert_eq!(job.attempts, 3);

        let failed_events = job
            .events
            .iter()
            .filter(|e| e.event_type == JobEventType::Failed)
            .count();
        assert_eq!(failed_events, 3);
        let dlq_events = job
            .events
            .iter()
            .filter(|e| e.event_type == JobEventType::MovedToDlq)
            .count();
        assert_eq!(dlq_events, 1);
    }

    #[test]
    fn complete_requires_running() {
        let mut job = submit(tenant(), "label", serde_json::json!({}), 3, None, t(0));
        let err = complete(&mut job, serde_json::json!({}), t(1)).unwrap_err();
        assert!(matches!(err, JobQueueError::Conflict(_)));
    }

    #[test]
    fn complete_clears_throttle_count() {
        let config = Config::default();
        let mut job = submit(tenant(), "label", serde_json::json!({}), 3, None, t(0));
        job.throttle_count = 4;
        attempt_lease(&mut job, "w1", 60, 0, &config, t(1));
        complete(&mut job, serde_json::json!({"ok": true}), t(2)).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.throttle_count, 0);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn reconcile_lease_expired_marks_failed_with_reason() {
        let config = Config::default();
        let mut job = submit(tenant(), "label", serde_json::json!({}), 3, None, t(0));
        attempt_lease(&mut job, "w1", 60, 0, &config, t(1));
        let moved = reconcile_lease_expired(&mut job, &config, t(1) + chrono::Duration::seconds(61));
        assert!(moved);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("Worker lease expired"));
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn reconcile_pending_timeout_escalates_to_dlq_after_budget() {
        let config = Config::default();
        let mut job = submit(tenant(), "label", serde_json::json!({}), 1, None, t(0));
        let moved = reconcile_pending_timeout(&mut job, 10, &config, t(0) + chrono::Duration::seconds(11));
        assert!(moved);
        assert_eq!(job.status, JobStatus::Dlq);
        assert_eq!(job.attempts, 1);
    }
}
