//! Testing utilities shared across the workspace: a settable [`FakeClock`]
//! and a small harness that wires `jobqueue-memory`'s `Store`/`JobQueue`
//! into a `Dispatcher`/`Runner`/`Reconciler` trio for deterministic,
//! time-controlled tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobqueue_core::{Clock, Config, Dispatcher, Reconciler, RowPipeline, Runner};
use jobqueue_memory::{MemoryJobQueue, MemoryStore};

/// A clock whose value is set explicitly and advanced by tests, rather than
/// reading wall-clock time. Stores microseconds since the Unix epoch in an
/// atomic so it can be shared across tasks without a lock.
pub struct FakeClock {
    micros: AtomicI64,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        self.micros.store(at.timestamp_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, duration: chrono::Duration) {
        self.micros
            .fetch_add(duration.num_microseconds().unwrap_or(0), Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.micros.load(Ordering::SeqCst))
            .expect("fake clock holds a valid timestamp")
    }
}

/// A fully wired, in-memory engine instance for tests: shared `Store`,
/// `JobQueue`, and `FakeClock` behind a `Dispatcher`, `Runner`, and
/// `Reconciler`.
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub clock: Arc<FakeClock>,
    pub config: Config,
    pub dispatcher: Dispatcher,
    pub reconciler: Reconciler,
    pub runner: Runner,
}

impl TestHarness {
    pub fn new(config: Config, pipeline: Arc<dyn RowPipeline>) -> Self {
        Self::at(config, pipeline, Utc::now())
    }

    pub fn at(config: Config, pipeline: Arc<dyn RowPipeline>, start: DateTime<Utc>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let clock = Arc::new(FakeClock::new(start));

        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn jobqueue_core::Store>,
            queue.clone() as Arc<dyn jobqueue_core::JobQueue>,
            clock.clone() as Arc<dyn Clock>,
            config,
        );
        let reconciler = Reconciler::new(
            store.clone() as Arc<dyn jobqueue_core::Store>,
            queue.clone() as Arc<dyn jobqueue_core::JobQueue>,
            clock.clone() as Arc<dyn Clock>,
            config,
        );
        let runner = Runner::new(
            store.clone() as Arc<dyn jobqueue_core::Store>,
            clock.clone() as Arc<dyn Clock>,
            pipeline,
            config,
        );

        Self {
            store,
            queue,
            clock,
            config,
            dispatcher,
            reconciler,
            runner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_deterministically() {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
