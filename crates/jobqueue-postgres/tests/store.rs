use chrono::{DateTime, Utc};
use jobqueue_core::{Job, JobId, JobTrigger, Store, TenantId};
use jobqueue_postgres::PgStore;
use sqlx::PgPool;
use uuid::Uuid;

fn now() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn new_job(tenant_id: TenantId) -> Job {
    Job::new(tenant_id, "demo", serde_json::json!({"rows": []}), 3, None, now())
}

#[sqlx::test(migrations = "./migrations")]
async fn insert_and_lock_roundtrip(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId(Uuid::new_v4());
    let job = new_job(tenant_id);

    assert!(store.insert_job(&job).await.unwrap());

    let locked = store.lock_job(job.id).await.unwrap().unwrap();
    assert_eq!(locked.id, job.id);
    assert_eq!(locked.tenant_id, tenant_id);
    assert_eq!(locked.label, "demo");
    assert_eq!(locked.input_payload, serde_json::json!({"rows": []}));
}

#[sqlx::test(migrations = "./migrations")]
async fn idempotency_key_collision_returns_false(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId(Uuid::new_v4());

    let mut first = new_job(tenant_id);
    first.idempotency_key = Some("k1".to_string());
    assert!(store.insert_job(&first).await.unwrap());

    let mut second = new_job(tenant_id);
    second.idempotency_key = Some("k1".to_string());
    assert!(!store.insert_job(&second).await.unwrap());

    let found = store
        .find_by_idempotency_key(tenant_id, "k1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);
}

#[sqlx::test(migrations = "./migrations")]
async fn save_job_persists_status_and_events(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId(Uuid::new_v4());
    let mut job = new_job(tenant_id);
    store.insert_job(&job).await.unwrap();

    job.status = jobqueue_core::JobStatus::Running;
    job.locked_by = Some("worker-1".to_string());
    job.lease_until = Some(now() + chrono::Duration::seconds(60));
    job.add_event(jobqueue_core::JobEventType::Leased, now());
    store.save_job(&job).await.unwrap();

    let reloaded = store.get_job(tenant_id, job.id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, jobqueue_core::JobStatus::Running);
    assert_eq!(reloaded.locked_by.as_deref(), Some("worker-1"));
    assert_eq!(reloaded.events.len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn lock_next_leasable_prefers_oldest_pending(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId(Uuid::new_v4());

    let mut older = new_job(tenant_id);
    older.created_at = now() - chrono::Duration::seconds(10);
    let newer = new_job(tenant_id);

    store.insert_job(&older).await.unwrap();
    store.insert_job(&newer).await.unwrap();

    let leasable = store.lock_next_leasable(tenant_id, now()).await.unwrap().unwrap();
    assert_eq!(leasable.id, older.id);
}

#[sqlx::test(migrations = "./migrations")]
async fn scan_lease_expired_finds_overdue_running_jobs(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId(Uuid::new_v4());
    let mut job = new_job(tenant_id);
    job.status = jobqueue_core::JobStatus::Running;
    job.locked_by = Some("worker-1".to_string());
    job.lease_until = Some(now() - chrono::Duration::seconds(1));
    store.insert_job(&job).await.unwrap();

    let expired = store.scan_lease_expired(now(), 50).await.unwrap();
    assert_eq!(expired, vec![job.id]);
}

#[sqlx::test(migrations = "./migrations")]
async fn trigger_log_counts_within_window(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId(Uuid::new_v4());
    let job_id = JobId::new();

    for i in 0..3 {
        store
            .insert_trigger(&JobTrigger {
                tenant_id,
                job_id: Some(job_id),
                triggered_at: now() - chrono::Duration::seconds(i * 10),
            })
            .await
            .unwrap();
    }

    let window_start = now() - chrono::Duration::seconds(60);
    let count = store
        .count_recent_triggers(tenant_id, window_start, now())
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[sqlx::test(migrations = "./migrations")]
async fn delete_job_cascades_to_triggers(pool: PgPool) {
    let store = PgStore::new(pool);
    let tenant_id = TenantId(Uuid::new_v4());
    let job = new_job(tenant_id);
    store.insert_job(&job).await.unwrap();
    store
        .insert_trigger(&JobTrigger {
            tenant_id,
            job_id: Some(job.id),
            triggered_at: now(),
        })
        .await
        .unwrap();

    assert!(store.delete_job(tenant_id, job.id).await.unwrap());
    assert!(store.get_job(tenant_id, job.id).await.unwrap().is_none());

    let count = store
        .count_recent_triggers(tenant_id, now() - chrono::Duration::seconds(60), now())
        .await
        .unwrap();
    assert_eq!(count, 0);
}
