//! # jobqueue-core
//!
//! The core of a multi-tenant, persistent job queue service: the job
//! lifecycle engine. Accepts user-submitted data-processing jobs, persists
//! them with full state, and drives each job through a finite state machine
//! toward completion, retry, or dead-letter, while enforcing per-tenant
//! concurrency caps, per-tenant arrival-rate caps, visibility leases,
//! attempt budgets, idempotency, and periodic reconciliation against worker
//! failure.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher ──► Store (insert PENDING job + append JobTrigger) ──► JobQueue
//!                                                                      │
//!                                                                      ▼
//!                                                                   Runner
//!                                                                      │
//!                                                          StateMachine │ Store
//!                                                                      ▼
//! Reconciler ──(timer)──► Store ──► StateMachine ──► Store / JobQueue
//! ```
//!
//! `StateMachine` is a pure function with no I/O: `(current Job, event,
//! context) -> next Job`. All other state lives in the [`Store`]; there is
//! no in-process queue of jobs.
//!
//! ## What this is not
//!
//! This crate does not parse HTTP, authenticate callers, decode CSV, or
//! validate/aggregate row data beyond the default row-pipeline adapter in
//! `jobqueue-rowpipeline`. It does not coordinate multiple engine replicas
//! beyond what the `Store`'s row-level transactions provide, and it does not
//! promise exactly-once processing or cross-tenant FIFO ordering.

mod clock;
mod config;
mod dispatcher;
mod dto;
mod error;
mod model;
mod reconciler;
mod runner;
mod state_machine;
mod store;
mod triggerlog;

pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use dispatcher::{Dispatcher, Stats};
pub use dto::{
    CompleteRequest, Envelope, ErrorBody, FailRequest, InputMode, JobView, LeaseRequest,
    ProgressRequest, StatsView, SubmitRequest,
};
pub use error::{ErrorCode, JobQueueError};
pub use model::{Job, JobEvent, JobEventType, JobId, JobStage, JobStatus, JobTrigger, TenantId};
pub use reconciler::{Reconciler, MAX_PER_CATEGORY};
pub use runner::Runner;
pub use store::{JobQueue, NoOpJobQueue, ProgressReporter, RowPipeline, Store};

pub mod state_machine_fns {
    //! Direct access to the pure state-machine functions, for callers
    //! building their own orchestration (e.g. tests) instead of going
    //! through [`crate::Dispatcher`]/[`crate::Runner`]/[`crate::Reconciler`].
    pub use crate::state_machine::*;
}

pub use async_trait::async_trait;
