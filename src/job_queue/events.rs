//! Structured queue events.
//!
//! The queue reports every state change and maintenance action to a list of
//! [`QueueEventSink`]s. Sinks must not fail: an event that cannot be
//! recorded is dropped.

use super::models::{JobStatus, RepairReport, StuckRecovery};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        job_id: i64,
        job_type: String,
        status: JobStatus,
        priority: i64,
    },
    EnqueueRejected {
        job_type: String,
        reason: String,
    },
    Claimed {
        job_id: i64,
        job_type: String,
        attempts: i32,
    },
    Completed {
        job_id: i64,
    },
    /// An attempt failed; `status` is `pending` if the job will run again.
    AttemptFailed {
        job_id: i64,
        status: JobStatus,
        error: String,
    },
    Failed {
        job_id: i64,
        error: String,
    },
    Delayed {
        job_id: i64,
        retry_at: i64,
        reason: String,
    },
    Cancelled {
        job_id: i64,
        reason: String,
    },
    Retried {
        job_id: i64,
    },
    StuckRecovered {
        recovery: StuckRecovery,
    },
    Repaired {
        report: RepairReport,
    },
    CleanedUp {
        deleted: usize,
        cutoff: i64,
    },
    Cleared {
        status: Option<JobStatus>,
        deleted: usize,
    },
    LockAcquired {
        name: String,
        holder: String,
    },
    LockContended {
        name: String,
    },
    LockReleased {
        name: String,
        holder: String,
    },
    LockForced {
        name: String,
    },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::EnqueueRejected { .. } => "enqueue_rejected",
            QueueEvent::Claimed { .. } => "claimed",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::AttemptFailed { .. } => "attempt_failed",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::Delayed { .. } => "delayed",
            QueueEvent::Cancelled { .. } => "cancelled",
            QueueEvent::Retried { .. } => "retried",
            QueueEvent::StuckRecovered { .. } => "stuck_recovered",
            QueueEvent::Repaired { .. } => "repaired",
            QueueEvent::CleanedUp { .. } => "cleaned_up",
            QueueEvent::Cleared { .. } => "cleared",
            QueueEvent::LockAcquired { .. } => "lock_acquired",
            QueueEvent::LockContended { .. } => "lock_contended",
            QueueEvent::LockReleased { .. } => "lock_released",
            QueueEvent::LockForced { .. } => "lock_forced",
        }
    }

    fn level(&self) -> EventLevel {
        match self {
            QueueEvent::EnqueueRejected { .. }
            | QueueEvent::Failed { .. }
            | QueueEvent::LockForced { .. } => EventLevel::Warn,
            QueueEvent::AttemptFailed { status, .. } if *status == JobStatus::Failed => {
                EventLevel::Warn
            }
            QueueEvent::StuckRecovered { recovery } if recovery.total() > 0 => EventLevel::Warn,
            QueueEvent::Repaired { report } if report.total() > 0 => EventLevel::Warn,
            QueueEvent::Claimed { .. }
            | QueueEvent::LockAcquired { .. }
            | QueueEvent::LockContended { .. }
            | QueueEvent::LockReleased { .. } => EventLevel::Debug,
            _ => EventLevel::Info,
        }
    }
}

enum EventLevel {
    Debug,
    Info,
    Warn,
}

pub trait QueueEventSink: Send + Sync {
    fn emit(&self, event: &QueueEvent);
}

/// Writes events as JSON through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl QueueEventSink for TracingEventSink {
    fn emit(&self, event: &QueueEvent) {
        let details = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize queue event {}: {}", event.name(), e);
                return;
            }
        };

        match event.level() {
            EventLevel::Debug => debug!(event = event.name(), "{}", details),
            EventLevel::Info => info!(event = event.name(), "{}", details),
            EventLevel::Warn => warn!(event = event.name(), "{}", details),
        }
    }
}
