//! Persistent job queue for deferred AI generation tasks.
//!
//! Producers enqueue typed jobs with opaque payloads; a processor claims them
//! under a lease, runs them through an executor and reports the outcome.
//! All state lives in the [`JobStore`], so every transition survives a crash
//! and is guarded by the [`state_machine`].

mod clock;
pub mod codec;
mod error;
mod events;
mod lock;
mod models;
mod processor;
mod queue;
mod recovery;
mod retry;
mod schema;
pub mod state_machine;
mod stats;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use events::{QueueEvent, QueueEventSink, TracingEventSink};
pub use lock::LockManager;
pub use models::{
    Job, JobFilter, JobStatus, Lease, NewJob, PriorityStats, QueueStats, RepairReport,
    RetryFilter, StatusCounts, StuckRecovery, TypeStats, DEFAULT_PRIORITY,
};
pub use processor::{JobExecutor, JobOutcome, QueueProcessor, RunReport};
pub use queue::{JobQueue, MAX_JOB_TYPE_LEN};
pub use recovery::SweepReport;
pub use retry::RetryPolicy;
pub use schema::JOB_QUEUE_VERSIONED_SCHEMAS;
pub use store::{JobStore, SqliteJobStore};
