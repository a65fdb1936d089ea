//! Legal job status transitions.
//!
//! Every status-changing write in the store is conditioned on the row's
//! current status being one of [`JobEvent::sources`], so the table below is
//! the single place where legality is decided.
//!
//! ```text
//! pending/scheduled/delayed --dequeue--> processing
//! processing --succeed--> done
//! processing --fail--> pending | failed      (failed once attempts run out)
//! processing --fail_fatal--> failed
//! processing --delay--> delayed
//! pending/scheduled/delayed --cancel--> cancelled
//! failed --retry--> pending
//! ```

use super::models::JobStatus;

/// Events that move a job between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Dequeue,
    Succeed,
    Fail,
    FailFatal,
    Delay,
    Cancel,
    Retry,
}

const WAITING: &[JobStatus] = &[
    JobStatus::Pending,
    JobStatus::Scheduled,
    JobStatus::Delayed,
];
const PROCESSING: &[JobStatus] = &[JobStatus::Processing];
const FAILED: &[JobStatus] = &[JobStatus::Failed];

impl JobEvent {
    pub const ALL: [JobEvent; 7] = [
        JobEvent::Dequeue,
        JobEvent::Succeed,
        JobEvent::Fail,
        JobEvent::FailFatal,
        JobEvent::Delay,
        JobEvent::Cancel,
        JobEvent::Retry,
    ];

    /// Statuses the event may be applied to.
    pub fn sources(&self) -> &'static [JobStatus] {
        match self {
            JobEvent::Dequeue | JobEvent::Cancel => WAITING,
            JobEvent::Succeed | JobEvent::Fail | JobEvent::FailFatal | JobEvent::Delay => {
                PROCESSING
            }
            JobEvent::Retry => FAILED,
        }
    }

    /// Statuses the event may produce.
    #[cfg(test)]
    pub fn targets(&self) -> &'static [JobStatus] {
        match self {
            JobEvent::Dequeue => &[JobStatus::Processing],
            JobEvent::Succeed => &[JobStatus::Done],
            JobEvent::Fail => &[JobStatus::Pending, JobStatus::Failed],
            JobEvent::FailFatal => &[JobStatus::Failed],
            JobEvent::Delay => &[JobStatus::Delayed],
            JobEvent::Cancel => &[JobStatus::Cancelled],
            JobEvent::Retry => &[JobStatus::Pending],
        }
    }

    pub fn applies_to(&self, status: JobStatus) -> bool {
        self.sources().contains(&status)
    }

    /// SQL fragment matching the source statuses, e.g. `status IN ('processing')`.
    pub(crate) fn source_condition(&self) -> String {
        status_in(self.sources())
    }
}

/// Target status of a failed attempt, given the attempt count once the
/// failure is counted.
#[cfg(test)]
pub fn status_after_failure(attempts_after: i32, max_attempts: i32) -> JobStatus {
    if attempts_after >= max_attempts {
        JobStatus::Failed
    } else {
        JobStatus::Pending
    }
}

/// SQL `CASE` choosing the outcome of [`JobEvent::Fail`], where
/// `attempts_after` is the SQL expression for the attempt count once the
/// failure is counted.
pub(crate) fn failure_status_sql(attempts_after: &str) -> String {
    format!(
        "CASE WHEN {} >= max_attempts THEN '{}' ELSE '{}' END",
        attempts_after,
        JobStatus::Failed.as_str(),
        JobStatus::Pending.as_str()
    )
}

/// Returns true if some event moves a job from `from` to `to`.
#[cfg(test)]
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    JobEvent::ALL
        .iter()
        .any(|event| event.applies_to(from) && event.targets().contains(&to))
}

pub(crate) fn status_in(statuses: &[JobStatus]) -> String {
    let list: Vec<String> = statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("status IN ({})", list.join(", "))
}
