//! The six literal scenarios from the engine's testable-properties spec,
//! run against the in-memory store with a fake clock so timing is
//! deterministic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobqueue_core::{Config, JobStatus};
use jobqueue_rowpipeline::DefaultRowPipeline;
use jobqueue_testing::TestHarness;
use uuid::Uuid;

fn start() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn tenant() -> jobqueue_core::TenantId {
    jobqueue_core::TenantId(Uuid::new_v4())
}

#[tokio::test]
async fn scenario_1_throttle_then_release() {
    let config = Config {
        concurrent_jobs_limit: 2,
        ..Config::default()
    };
    let h = TestHarness::at(config, Arc::new(DefaultRowPipeline), start());
    let t = tenant();

    let j1 = h
        .dispatcher
        .submit(t, "j1", serde_json::json!({}), None, None)
        .await
        .unwrap();
    let j2 = h
        .dispatcher
        .submit(t, "j2", serde_json::json!({}), None, None)
        .await
        .unwrap();
    h.dispatcher.lease(t, "w1", 60).await.unwrap();
    h.dispatcher.lease(t, "w2", 60).await.unwrap();
    let running = h.dispatcher.stats(t).await.unwrap().concurrent_running;
    assert_eq!(running, 2, "j1 and j2 should both be RUNNING: {j1:?} {j2:?}");

    let j3 = h
        .dispatcher
        .submit(t, "j3", serde_json::json!({}), None, None)
        .await
        .unwrap();
    let leased = h.dispatcher.lease(t, "w3", 60).await.unwrap().unwrap();
    assert_eq!(leased.id, j3.id);
    assert_eq!(leased.status, JobStatus::Throttled);
    assert_eq!(leased.attempts, 0);
    assert_eq!(leased.throttle_count, 1);
    assert!(leased.next_run_at.unwrap() > start());

    h.dispatcher
        .complete(t, j1.id, Some(serde_json::json!({"ok": true})))
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::seconds(16));
    h.reconciler.run_once().await.unwrap();

    let j3_after = h.store.get_job(t, j3.id).await.unwrap().unwrap();
    assert_eq!(j3_after.status, JobStatus::Pending);

    let leased_again = h.dispatcher.lease(t, "w3", 60).await.unwrap().unwrap();
    assert_eq!(leased_again.id, j3.id);
    assert_eq!(leased_again.status, JobStatus::Running);

    let done = h
        .dispatcher
        .complete(t, j3.id, Some(serde_json::json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.throttle_count, 0);
}

#[tokio::test]
async fn scenario_2_attempts_budget_exhausted_to_dlq() {
    let h = TestHarness::at(Config::default(), Arc::new(DefaultRowPipeline), start());
    let t = tenant();
    let job = h
        .dispatcher
        .submit(t, "j", serde_json::json!({}), Some(3), None)
        .await
        .unwrap();

    h.dispatcher.lease(t, "w1", 60).await.unwrap();
    let after1 = h.dispatcher.fail(t, job.id, "x", None).await.unwrap();
    assert_eq!(after1.status, JobStatus::Failed);

    // Reconciler brings it back to PENDING, then we lease+fail again.
    h.clock.advance(chrono::Duration::seconds(6));
    h.reconciler.run_once().await.unwrap();
    h.dispatcher.lease(t, "w1", 60).await.unwrap();
    let after2 = h.dispatcher.fail(t, job.id, "y", None).await.unwrap();
    assert_eq!(after2.status, JobStatus::Failed);

    h.clock.advance(chrono::Duration::seconds(6));
    h.reconciler.run_once().await.unwrap();
    h.dispatcher.lease(t, "w1", 60).await.unwrap();
    let after3 = h.dispatcher.fail(t, job.id, "z", None).await.unwrap();
    assert_eq!(after3.status, JobStatus::Dlq);

    let failed_events = after3
        .events
        .iter()
        .filter(|e| e.event_type == jobqueue_core::JobEventType::Failed)
        .count();
    assert_eq!(failed_events, 3);
    let dlq_events = after3
        .events
        .iter()
        .filter(|e| e.event_type == jobqueue_core::JobEventType::MovedToDlq)
        .count();
    assert_eq!(dlq_events, 1);
}

#[tokio::test]
async fn scenario_3_lease_expiry_recovery() {
    let h = TestHarness::at(Config::default(), Arc::new(DefaultRowPipeline), start());
    let t = tenant();
    let job = h
        .dispatcher
        .submit(t, "j", serde_json::json!({}), None, None)
        .await
        .unwrap();
    h.dispatcher.lease(t, "w1", 60).await.unwrap();

    h.clock.advance(chrono::Duration::seconds(61));
    h.reconciler.run_once().await.unwrap();

    let after = h.store.get_job(t, job.id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Failed);
    assert_eq!(after.failure_reason.as_deref(), Some("Worker lease expired"));
    assert_eq!(after.attempts, 1);
}

#[tokio::test]
async fn scenario_4_idempotent_submit() {
    let h = TestHarness::at(Config::default(), Arc::new(DefaultRowPipeline), start());
    let t = tenant();
    let first = h
        .dispatcher
        .submit(t, "A", serde_json::json!({}), None, Some("k1".into()))
        .await
        .unwrap();
    let second = h
        .dispatcher
        .submit(t, "B", serde_json::json!({}), None, Some("k1".into()))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.label, "A");
}

#[tokio::test]
async fn scenario_5_rate_limit() {
    let config = Config {
        jobs_per_min_limit: 4,
        ..Config::default()
    };
    let h = TestHarness::at(config, Arc::new(DefaultRowPipeline), start());
    let t = tenant();
    for i in 0..4 {
        h.dispatcher
            .submit(t, format!("j{i}"), serde_json::json!({}), None, None)
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(2));
    }
    let err = h
        .dispatcher
        .submit(t, "j5", serde_json::json!({}), None, None)
        .await
        .unwrap_err();
    match err {
        jobqueue_core::JobQueueError::RateLimited { retry_after } => {
            assert!(retry_after.num_seconds() >= 50 && retry_after.num_seconds() <= 60);
        }
        other => panic!("expected rate limited, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_6_pending_timeout_escalates_to_dlq() {
    let config = Config {
        job_pending_timeout_seconds: 10,
        ..Config::default()
    };
    let h = TestHarness::at(config, Arc::new(DefaultRowPipeline), start());
    let t = tenant();
    let job = h
        .dispatcher
        .submit(t, "j", serde_json::json!({}), Some(3), None)
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::seconds(11));
    h.reconciler.run_once().await.unwrap();
    let after1 = h.store.get_job(t, job.id).await.unwrap().unwrap();
    assert_eq!(after1.status, JobStatus::Failed);
    assert_eq!(after1.failure_reason.as_deref(), Some("Pending timeout"));
    assert_eq!(after1.attempts, 1);

    // Two more passes without recovery (fail-ready -> PENDING -> timeout again).
    for _ in 0..2 {
        h.clock.advance(chrono::Duration::seconds(6));
        h.reconciler.run_once().await.unwrap();
        h.clock.advance(chrono::Duration::seconds(11));
        h.reconciler.run_once().await.unwrap();
    }

    let final_job = h.store.get_job(t, job.id).await.unwrap().unwrap();
    assert_eq!(final_job.status, JobStatus::Dlq);
}
