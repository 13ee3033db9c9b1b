//! Manual exploration binary: submits one job against the in-memory store,
//! drains it through the Runner, and prints the resulting job record. Shows
//! how `Dispatcher`/`Runner`/`Reconciler` compose without any transport layer
//! in front of them.

use std::sync::Arc;

use anyhow::Result;
use jobqueue_core::{Clock, Config, Dispatcher, JobQueue, Reconciler, Runner, Store, SystemClock, TenantId};
use jobqueue_memory::{MemoryJobQueue, MemoryStore};
use jobqueue_rowpipeline::DefaultRowPipeline;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let clock = Arc::new(SystemClock);
    let config = Config::default();
    let pipeline = Arc::new(DefaultRowPipeline);

    let dispatcher = Dispatcher::new(
        store.clone() as Arc<dyn Store>,
        queue.clone() as Arc<dyn JobQueue>,
        clock.clone() as Arc<dyn Clock>,
        config,
    );
    let reconciler = Reconciler::new(
        store.clone() as Arc<dyn Store>,
        queue.clone() as Arc<dyn JobQueue>,
        clock.clone() as Arc<dyn Clock>,
        config,
    );
    let runner = Runner::new(store.clone() as Arc<dyn Store>, clock.clone() as Arc<dyn Clock>, pipeline, config);

    let tenant_id = TenantId(Uuid::new_v4());
    let payload = serde_json::json!({
        "rows": [
            {"name": "Ada Lovelace", "email": "ada@example.com", "age": 36},
            {"name": "Al", "email": "not-an-email", "age": 200},
            {"name": "Grace Hopper", "email": "grace@example.com", "age": 85},
        ],
        "config": {"numericField": "age"},
    });

    let job = dispatcher
        .submit(tenant_id, "row-import-demo", payload, None, None)
        .await?;
    println!("submitted job {} in status {:?}", job.id, job.status);

    let mut receiver = queue.take_receiver().expect("receiver taken exactly once");
    if let Some(job_id) = receiver.recv().await {
        runner.run_once(job_id).await?;
    }

    // A reconciler sweep is harmless even when nothing needs repair; running
    // it here shows the same pass a production deployment would schedule.
    reconciler.run_once().await?;

    let final_job = store.get_job(tenant_id, job.id).await?.expect("job exists");
    println!("final status: {:?}", final_job.status);
    println!("output: {}", serde_json::to_string_pretty(&final_job.output_result)?);

    Ok(())
}
