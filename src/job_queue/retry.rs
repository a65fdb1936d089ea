//! Attempt accounting, deferral and manual retry.
//!
//! Implements exponential backoff with configurable parameters for jobs
//! whose executor asks to be run again later.

use super::clock::duration_secs;
use super::error::QueueResult;
use super::events::QueueEvent;
use super::models::{JobStatus, RetryFilter};
use super::queue::JobQueue;
use crate::config::QueueSettings;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Initial backoff duration in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each attempt.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            initial_backoff_secs: settings.initial_backoff_secs,
            max_backoff_secs: settings.max_backoff_secs,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// Backoff in seconds after `attempts` attempts:
    /// `initial_backoff * multiplier^attempts`, capped at `max_backoff_secs`.
    pub fn backoff_secs(&self, attempts: i32) -> u64 {
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(attempts);
        backoff.min(self.max_backoff_secs as f64) as u64
    }

    /// Timestamp of the next run, `now` plus the backoff.
    pub fn next_retry_at(&self, now: i64, attempts: i32) -> i64 {
        let backoff = i64::try_from(self.backoff_secs(attempts)).unwrap_or(i64::MAX);
        now.saturating_add(backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&QueueSettings::default())
    }
}

impl JobQueue {
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Record a failed attempt of a processing job.
    ///
    /// The job goes back to `pending`, or to `failed` once it has used all
    /// of its attempts. Returns the new status, or `None` if the job was not
    /// processing.
    pub fn increment_attempts(&self, id: i64, error: &str) -> QueueResult<Option<JobStatus>> {
        let status = self.store.record_failure(id, error)?;
        if let Some(status) = status {
            self.emit(QueueEvent::AttemptFailed {
                job_id: id,
                status,
                error: error.to_string(),
            });
        }
        Ok(status)
    }

    /// Park a processing job until `retry_at` without using an attempt.
    /// A time in the past is treated as now.
    pub fn mark_delayed(&self, id: i64, retry_at: i64, reason: &str) -> QueueResult<bool> {
        let retry_at = retry_at.max(self.store.now());
        let delayed = self.store.delay_job(id, retry_at, reason)?;
        if delayed {
            self.emit(QueueEvent::Delayed {
                job_id: id,
                retry_at,
                reason: reason.to_string(),
            });
        }
        Ok(delayed)
    }

    /// Delay a processing job by the backoff for its attempt count, or by
    /// `after` when given. Returns the chosen time if the job was delayed.
    pub fn delay_with_backoff(
        &self,
        id: i64,
        attempts: i32,
        after: Option<Duration>,
        reason: &str,
    ) -> QueueResult<Option<i64>> {
        let now = self.store.now();
        let retry_at = match after {
            Some(after) => now.saturating_add(duration_secs(after)),
            None => self.retry_policy.next_retry_at(now, attempts),
        };
        Ok(self
            .mark_delayed(id, retry_at, reason)?
            .then_some(retry_at))
    }

    /// Give a failed job a fresh set of attempts. Returns false, changing
    /// nothing, if the job is not failed.
    pub fn retry_job(&self, id: i64) -> QueueResult<bool> {
        let retried = self.store.reset_failed_job(id)?;
        if retried {
            self.emit(QueueEvent::Retried { job_id: id });
        }
        Ok(retried)
    }

    /// Retry failed jobs in bulk. Returns the ids that were reset.
    pub fn retry_failed_jobs(&self, filter: &RetryFilter) -> QueueResult<Vec<i64>> {
        let ids = self.store.reset_failed_jobs(filter)?;
        for id in &ids {
            self.emit(QueueEvent::Retried { job_id: *id });
        }
        Ok(ids)
    }
}
