//! Data models for the job queue.
//!
//! Defines jobs, statuses, query filters, and the read-only statistics types.

use serde::{Deserialize, Serialize};

/// Default priority assigned to jobs that do not ask for one.
pub const DEFAULT_PRIORITY: i64 = 10;

/// Status of a job in the queue state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Delayed,
    Processing,
    Done,      // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Scheduled,
        JobStatus::Delayed,
        JobStatus::Processing,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Delayed => "delayed",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "scheduled" => Some(JobStatus::Scheduled),
            "delayed" => Some(JobStatus::Delayed),
            "processing" => Some(JobStatus::Processing),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns true for `done`, `failed` and `cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses waiting on a `scheduled_at` timestamp.
    pub fn is_time_gated(&self) -> bool {
        matches!(self, JobStatus::Scheduled | JobStatus::Delayed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    /// Monotonically assigned identifier
    pub id: i64,
    /// Producer-defined task kind
    pub job_type: String,
    pub status: JobStatus,
    /// Opaque bytes, never inspected by the queue
    pub payload: Vec<u8>,
    /// Opaque bytes, only set on `done`
    pub result: Option<Vec<u8>>,
    /// Higher value is dequeued first
    pub priority: i64,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Last failure, cancellation or delay reason
    pub error_message: Option<String>,
    pub scheduled_at: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attempts left before the job fails for good.
    pub fn remaining_attempts(&self) -> i32 {
        (self.max_attempts - self.attempts).max(0)
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Vec<u8>,
    pub priority: i64,
    pub status: JobStatus,
    pub scheduled_at: Option<i64>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: payload.into(),
            priority: DEFAULT_PRIORITY,
            status: JobStatus::Pending,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn scheduled_at(mut self, timestamp: i64) -> Self {
        self.scheduled_at = Some(timestamp);
        self
    }
}

/// Filter for listing and counting jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    /// Only jobs created at or after this timestamp
    pub created_after: Option<i64>,
    /// Only jobs created before this timestamp
    pub created_before: Option<i64>,
    /// Ignored by `count_jobs`
    pub limit: usize,
    /// Ignored by `count_jobs`
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            created_after: None,
            created_before: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// Selects failed jobs for a bulk retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFilter {
    pub job_type: Option<String>,
    /// Only jobs that failed before this timestamp
    pub failed_before: Option<i64>,
    pub limit: usize,
}

impl Default for RetryFilter {
    fn default() -> Self {
        Self {
            job_type: None,
            failed_before: None,
            limit: 50,
        }
    }
}

/// Outcome of a stuck-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StuckRecovery {
    /// Jobs sent back to `pending`
    pub requeued: usize,
    /// Jobs that ran out of attempts
    pub failed: usize,
}

impl StuckRecovery {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Rows fixed by a consistency repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// `processing` rows without `started_at`, moved to `pending`
    pub orphaned_processing: usize,
    /// `scheduled`/`delayed` rows without `scheduled_at`, moved to `pending`
    pub unscheduled: usize,
    /// Rows with more attempts than allowed (or exhausted but still pending), failed
    pub attempts_overflow: usize,
    /// Terminal rows without `completed_at`, stamped
    pub missing_completed_at: usize,
}

impl RepairReport {
    pub fn total(&self) -> usize {
        self.orphaned_processing
            + self.unscheduled
            + self.attempts_overflow
            + self.missing_completed_at
    }
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub scheduled: i64,
    pub delayed: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Scheduled => self.scheduled,
            JobStatus::Delayed => self.delayed,
            JobStatus::Processing => self.processing,
            JobStatus::Done => self.done,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn set(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending = count,
            JobStatus::Scheduled => self.scheduled = count,
            JobStatus::Delayed => self.delayed = count,
            JobStatus::Processing => self.processing = count,
            JobStatus::Done => self.done = count,
            JobStatus::Failed => self.failed = count,
            JobStatus::Cancelled => self.cancelled = count,
        }
    }

    /// Jobs that have not reached a terminal state.
    pub fn active(&self) -> i64 {
        self.pending + self.scheduled + self.delayed + self.processing
    }
}

/// Per-type breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub job_type: String,
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
}

/// Active jobs at a given priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriorityStats {
    pub priority: i64,
    pub count: i64,
}

/// Aggregated, read-only view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub by_status: StatusCounts,
    pub by_type: Vec<TypeStats>,
    /// Non-terminal jobs only, highest priority first
    pub by_priority: Vec<PriorityStats>,
    /// Mean `completed_at - started_at` over done jobs
    pub avg_processing_secs: Option<f64>,
    /// Mean `started_at - created_at` over jobs that have started
    pub avg_wait_secs: Option<f64>,
    pub oldest_pending_at: Option<i64>,
    pub next_scheduled_at: Option<i64>,
}

/// A processing-run lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl Lease {
    pub fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}
