//! The job queue facade.
//!
//! [`JobQueue`] validates input, delegates every mutation to the injected
//! [`JobStore`] and reports what happened to its event sinks. Enqueue,
//! dequeue and the outcome transitions live here; retry, locking, recovery
//! and statistics are in their own modules.

use super::error::{QueueError, QueueResult};
use super::events::{QueueEvent, QueueEventSink, TracingEventSink};
use super::lock::LockManager;
use super::models::{Job, JobStatus, NewJob};
use super::retry::RetryPolicy;
use super::store::JobStore;
use crate::config::QueueSettings;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_JOB_TYPE_LEN: usize = 50;

const DEFAULT_CANCEL_REASON: &str = "Cancelled by user";

lazy_static! {
    static ref JOB_TYPE_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9_.:-]+$").expect("job type pattern is valid");
}

/// Persistent job queue with priority ordering, scheduling, bounded retries
/// and a processing lease.
pub struct JobQueue {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) settings: QueueSettings,
    pub(super) retry_policy: RetryPolicy,
    pub(super) lock: LockManager,
    sinks: Vec<Arc<dyn QueueEventSink>>,
}

impl JobQueue {
    /// Create a queue over `store`. Events go to a [`TracingEventSink`] until
    /// more sinks are added with [`JobQueue::with_sink`].
    ///
    /// Fails with [`QueueError::InvalidSettings`] if `settings` does not pass
    /// [`QueueSettings::validate`].
    pub fn new(store: Arc<dyn JobStore>, settings: QueueSettings) -> QueueResult<Self> {
        settings
            .validate()
            .map_err(|e| QueueError::InvalidSettings(format!("{:#}", e)))?;
        let lock = LockManager::new(
            store.clone(),
            settings.lock_name.clone(),
            settings.lock_ttl_secs,
        );
        Ok(Self {
            retry_policy: RetryPolicy::new(&settings),
            lock,
            store,
            settings,
            sinks: vec![Arc::new(TracingEventSink)],
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn QueueEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock
    }

    pub(super) fn emit(&self, event: QueueEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }

    /// A new job at the configured default priority.
    pub fn new_job(&self, job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> NewJob {
        NewJob::new(job_type, payload).with_priority(self.settings.default_priority)
    }

    /// Check and normalize a job before it is written.
    ///
    /// The type is trimmed and priority clamped to zero. A `pending` job with
    /// a future `scheduled_at` becomes `scheduled`, and a `scheduled` job whose
    /// time has already come becomes `pending`.
    pub fn validate(&self, job: NewJob) -> QueueResult<NewJob> {
        let job_type = job.job_type.trim();
        if job_type.is_empty()
            || job_type.len() > MAX_JOB_TYPE_LEN
            || !JOB_TYPE_PATTERN.is_match(job_type)
        {
            return Err(QueueError::InvalidJobType(job.job_type));
        }

        if job.status == JobStatus::Processing {
            return Err(QueueError::InvalidStatus(job.status));
        }

        let now = self.store.now();
        let mut status = job.status;
        match job.scheduled_at {
            Some(at) if at < 0 => {
                return Err(QueueError::InvalidSchedule(format!(
                    "scheduled_at must not be negative, got {}",
                    at
                )));
            }
            Some(at) if at > now && status == JobStatus::Pending => {
                status = JobStatus::Scheduled;
            }
            Some(at) if at <= now && status == JobStatus::Scheduled => {
                status = JobStatus::Pending;
            }
            None if status.is_time_gated() => {
                return Err(QueueError::InvalidSchedule(format!(
                    "status {} requires scheduled_at",
                    status
                )));
            }
            _ => {}
        }

        Ok(NewJob {
            job_type: job_type.to_string(),
            payload: job.payload,
            priority: job.priority.max(0),
            status,
            scheduled_at: job.scheduled_at,
        })
    }

    /// Validate and persist one job. Returns its id.
    pub fn enqueue(&self, job: NewJob) -> QueueResult<i64> {
        let job_type = job.job_type.clone();
        let job = match self.validate(job) {
            Ok(job) => job,
            Err(e) => {
                self.emit(QueueEvent::EnqueueRejected {
                    job_type,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let id = self.store.insert_job(&job, self.settings.max_attempts)?;
        self.emit(QueueEvent::Enqueued {
            job_id: id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
        });
        Ok(id)
    }

    /// Enqueue each job in turn. Jobs that fail validation are skipped; a
    /// storage error stops the batch.
    pub fn enqueue_batch(&self, jobs: Vec<NewJob>) -> QueueResult<Vec<i64>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.enqueue(job) {
                Ok(id) => ids.push(id),
                Err(e) if e.is_validation() => {
                    warn!("Skipping job in batch: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ids)
    }

    /// Claim the next eligible job, if any.
    pub fn dequeue_one(&self) -> QueueResult<Option<Job>> {
        Ok(self.dequeue_batch(1)?.into_iter().next())
    }

    /// Claim up to `limit` eligible jobs. Due scheduled and delayed jobs come
    /// before pending ones; each pool is ordered by priority then age.
    pub fn dequeue_batch(&self, limit: usize) -> QueueResult<Vec<Job>> {
        let jobs = self.store.claim_next(limit)?;
        for job in &jobs {
            self.emit(QueueEvent::Claimed {
                job_id: job.id,
                job_type: job.job_type.clone(),
                attempts: job.attempts,
            });
        }
        if !jobs.is_empty() {
            debug!("Claimed {} of {} requested jobs", jobs.len(), limit);
        }
        Ok(jobs)
    }

    /// Claim a batch of the configured size.
    pub fn dequeue_next_batch(&self) -> QueueResult<Vec<Job>> {
        self.dequeue_batch(self.settings.batch_size)
    }

    pub fn get_job(&self, id: i64) -> QueueResult<Option<Job>> {
        Ok(self.store.get_job(id)?)
    }

    /// Claim one specific job if it is eligible right now.
    pub fn mark_processing(&self, id: i64) -> QueueResult<bool> {
        let claimed = self.store.claim_job(id)?;
        if claimed {
            if let Some(job) = self.store.get_job(id)? {
                self.emit(QueueEvent::Claimed {
                    job_id: id,
                    job_type: job.job_type,
                    attempts: job.attempts,
                });
            }
        }
        Ok(claimed)
    }

    /// processing → done.
    pub fn mark_done(&self, id: i64, result: Option<&[u8]>) -> QueueResult<bool> {
        let done = self.store.complete_job(id, result)?;
        if done {
            self.emit(QueueEvent::Completed { job_id: id });
        }
        Ok(done)
    }

    /// processing → failed, whatever attempts remain.
    pub fn mark_failed(&self, id: i64, error: &str) -> QueueResult<bool> {
        let failed = self.store.fail_job(id, error)?;
        if failed {
            self.emit(QueueEvent::Failed {
                job_id: id,
                error: error.to_string(),
            });
        }
        Ok(failed)
    }

    /// pending/scheduled/delayed → cancelled. Jobs already processing are
    /// left to finish or to the stuck-job sweep.
    pub fn mark_cancelled(&self, id: i64, reason: &str) -> QueueResult<bool> {
        let cancelled = self.store.cancel_job(id, reason)?;
        if cancelled {
            self.emit(QueueEvent::Cancelled {
                job_id: id,
                reason: reason.to_string(),
            });
        }
        Ok(cancelled)
    }

    pub fn cancel_job(&self, id: i64) -> QueueResult<bool> {
        self.mark_cancelled(id, DEFAULT_CANCEL_REASON)
    }

    /// Delete every job, or every job in `status`. Returns the count deleted.
    pub fn clear_queue(&self, status: Option<JobStatus>) -> QueueResult<usize> {
        let deleted = self.store.delete_jobs(status)?;
        self.emit(QueueEvent::Cleared { status, deleted });
        Ok(deleted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::job_queue::clock::ManualClock;
    use crate::job_queue::store::SqliteJobStore;
    use std::sync::Mutex;

    pub(crate) const T0: i64 = 1_700_000_000;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<QueueEvent>>,
    }

    impl RecordingSink {
        pub fn names(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(|e| e.name()).collect()
        }
    }

    impl QueueEventSink for RecordingSink {
        fn emit(&self, event: &QueueEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    pub(crate) fn test_queue() -> (JobQueue, Arc<ManualClock>, Arc<RecordingSink>) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = SqliteJobStore::in_memory()
            .unwrap()
            .with_clock(clock.clone());
        let sink = Arc::new(RecordingSink::default());
        let queue = JobQueue::new(Arc::new(store), QueueSettings::default())
            .unwrap()
            .with_sink(sink.clone());
        (queue, clock, sink)
    }

    #[test]
    fn test_enqueue_defaults() {
        let (queue, _clock, sink) = test_queue();
        let id = queue
            .enqueue(queue.new_job("generate_title", b"{}".to_vec()))
            .unwrap();

        let job = queue.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 10);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(sink.names(), vec!["enqueued"]);
    }

    #[test]
    fn test_enqueue_rejects_bad_types() {
        let (queue, _clock, sink) = test_queue();
        let too_long = "x".repeat(MAX_JOB_TYPE_LEN + 1);
        for bad in ["", "   ", "has space", "semi;colon", too_long.as_str()] {
            let err = queue.enqueue(NewJob::new(bad, Vec::new())).unwrap_err();
            assert!(matches!(err, QueueError::InvalidJobType(_)), "{:?}", bad);
        }
        assert_eq!(queue.count_jobs(&Default::default()).unwrap(), 0);
        assert!(sink.names().iter().all(|n| *n == "enqueue_rejected"));
    }

    #[test]
    fn test_enqueue_trims_type_and_clamps_priority() {
        let (queue, _clock, _sink) = test_queue();
        let id = queue
            .enqueue(NewJob::new("  seo:meta.v2-x  ", Vec::new()).with_priority(-4))
            .unwrap();
        let job = queue.get_job(id).unwrap().unwrap();
        assert_eq!(job.job_type, "seo:meta.v2-x");
        assert_eq!(job.priority, 0);
    }

    #[test]
    fn test_future_schedule_forces_scheduled() {
        let (queue, _clock, _sink) = test_queue();
        let id = queue
            .enqueue(NewJob::new("a", Vec::new()).scheduled_at(T0 + 600))
            .unwrap();
        let job = queue.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.scheduled_at, Some(T0 + 600));

        // A past time leaves the job pending
        let id = queue
            .enqueue(NewJob::new("a", Vec::new()).scheduled_at(T0 - 600))
            .unwrap();
        assert_eq!(queue.get_job(id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_scheduled_in_the_past_becomes_pending() {
        let (queue, _clock, _sink) = test_queue();
        for at in [T0 - 600, T0] {
            let id = queue
                .enqueue(
                    NewJob::new("a", Vec::new())
                        .with_status(JobStatus::Scheduled)
                        .scheduled_at(at),
                )
                .unwrap();
            let job = queue.get_job(id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.scheduled_at, Some(at));
        }
        assert_eq!(queue.get_stats().unwrap().next_scheduled_at, None);
        assert_eq!(queue.dequeue_batch(5).unwrap().len(), 2);
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let broken = [
            QueueSettings {
                max_attempts: 0,
                ..Default::default()
            },
            QueueSettings {
                worker_count: 0,
                ..Default::default()
            },
            QueueSettings {
                poll_interval_secs: 0,
                ..Default::default()
            },
            QueueSettings {
                lock_name: String::new(),
                ..Default::default()
            },
        ];
        for settings in broken {
            let err = JobQueue::new(store.clone(), settings).err().unwrap();
            assert!(matches!(err, QueueError::InvalidSettings(_)), "{}", err);
            assert!(err.is_validation());
        }
        assert!(JobQueue::new(store, QueueSettings::default()).is_ok());
    }

    #[test]
    fn test_enqueue_rejects_invalid_status_and_schedule() {
        let (queue, _clock, _sink) = test_queue();
        let err = queue
            .enqueue(NewJob::new("a", Vec::new()).with_status(JobStatus::Processing))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidStatus(JobStatus::Processing)));

        let err = queue
            .enqueue(NewJob::new("a", Vec::new()).with_status(JobStatus::Delayed))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidSchedule(_)));

        let err = queue
            .enqueue(NewJob::new("a", Vec::new()).scheduled_at(-1))
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidSchedule(_)));
    }

    #[test]
    fn test_enqueue_batch_skips_invalid() {
        let (queue, _clock, _sink) = test_queue();
        let ids = queue
            .enqueue_batch(vec![
                NewJob::new("generate_title", Vec::new()),
                NewJob::new("bad type", Vec::new()),
                NewJob::new("generate_meta", Vec::new()),
            ])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
    }

    #[test]
    fn test_priority_ordering() {
        let (queue, clock, _sink) = test_queue();
        let a = queue
            .enqueue(NewJob::new("a", Vec::new()).with_priority(5))
            .unwrap();
        clock.advance(1);
        let b = queue
            .enqueue(NewJob::new("b", Vec::new()).with_priority(10))
            .unwrap();

        assert_eq!(queue.dequeue_one().unwrap().unwrap().id, b);
        assert_eq!(queue.dequeue_one().unwrap().unwrap().id, a);
        assert!(queue.dequeue_one().unwrap().is_none());
    }

    #[test]
    fn test_dequeue_batch_zero() {
        let (queue, _clock, _sink) = test_queue();
        queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
        assert!(queue.dequeue_batch(0).unwrap().is_empty());
    }

    #[test]
    fn test_dequeue_batch_without_bound() {
        let (queue, _clock, _sink) = test_queue();
        for job_type in ["a", "b", "c"] {
            queue.enqueue(NewJob::new(job_type, Vec::new())).unwrap();
        }
        assert_eq!(queue.dequeue_batch(usize::MAX).unwrap().len(), 3);
        assert!(queue.dequeue_batch(usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_terminal_immutability() {
        let (queue, _clock, _sink) = test_queue();
        let id = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
        assert!(queue.cancel_job(id).unwrap());
        let before = queue.get_job(id).unwrap().unwrap();

        assert!(!queue.mark_done(id, Some(b"late")).unwrap());
        assert!(!queue.mark_failed(id, "late").unwrap());
        assert!(!queue.mark_processing(id).unwrap());
        assert_eq!(queue.get_job(id).unwrap().unwrap(), before);
        assert_eq!(before.error_message.as_deref(), Some(DEFAULT_CANCEL_REASON));
    }

    #[test]
    fn test_mark_done_stores_result() {
        let (queue, _clock, sink) = test_queue();
        let id = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
        let job = queue.dequeue_one().unwrap().unwrap();
        assert_eq!(job.id, id);

        assert!(queue.mark_done(id, Some(b"A better title")).unwrap());
        let job = queue.get_job(id).unwrap().unwrap();
        assert_eq!(job.result, Some(b"A better title".to_vec()));
        assert_eq!(sink.names(), vec!["enqueued", "claimed", "completed"]);
    }

    #[test]
    fn test_processing_job_cannot_be_cancelled() {
        let (queue, _clock, _sink) = test_queue();
        let id = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
        assert!(queue.mark_processing(id).unwrap());
        assert!(!queue.cancel_job(id).unwrap());
        assert_eq!(queue.get_job(id).unwrap().unwrap().status, JobStatus::Processing);
    }

    #[test]
    fn test_clear_queue_by_status() {
        let (queue, _clock, _sink) = test_queue();
        let a = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
        queue.enqueue(NewJob::new("b", Vec::new())).unwrap();
        queue.cancel_job(a).unwrap();

        assert_eq!(queue.clear_queue(Some(JobStatus::Cancelled)).unwrap(), 1);
        assert_eq!(queue.count_jobs(&Default::default()).unwrap(), 1);
        assert_eq!(queue.clear_queue(None).unwrap(), 1);
        assert_eq!(queue.count_jobs(&Default::default()).unwrap(), 0);
    }
}
