//! Background processor for the job queue.
//!
//! Replaces an external cron trigger: a ticker takes the processing lease,
//! claims a batch and runs it through a [`JobExecutor`] on a bounded number of
//! concurrent workers, then reports each outcome back to the queue. A second,
//! slower ticker runs the maintenance sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::QueueResult;
use super::models::{Job, JobStatus};
use super::queue::JobQueue;
use crate::metrics;

/// What an executor reports for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finished, with an optional opaque result.
    Done(Option<Vec<u8>>),
    /// This attempt failed; the job runs again while attempts remain.
    Failed(String),
    /// The job can never succeed; fail it now.
    Fatal(String),
    /// Not now. Without an explicit delay the retry backoff applies.
    /// Does not use an attempt.
    RetryLater {
        reason: String,
        after: Option<Duration>,
    },
}

/// Runs the task logic for claimed jobs.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> JobOutcome;
}

/// Tally of one processing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Another holder had the lease; nothing was claimed
    pub lock_contended: bool,
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub delayed: usize,
    /// Outcomes that no longer applied because the job left `processing`
    pub lost: usize,
    /// Outcomes that could not be written
    pub errors: usize,
}

/// Background processor that drains the queue on a timer.
pub struct QueueProcessor {
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
}

impl QueueProcessor {
    pub fn new(queue: Arc<JobQueue>, executor: Arc<dyn JobExecutor>) -> Self {
        Self { queue, executor }
    }

    /// Main processing loop - call from a spawned task.
    ///
    /// Returns once `shutdown` is cancelled. A batch already running is
    /// finished first and the lease released.
    pub async fn run(&self, shutdown: CancellationToken) {
        let settings = self.queue.settings();
        info!(
            "Queue processor starting (poll={}s, sweep={}s, workers={})",
            settings.poll_interval_secs, settings.sweep_interval_secs, settings.worker_count
        );

        let mut poll = tokio::time::interval(Duration::from_secs(settings.poll_interval_secs));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(Duration::from_secs(settings.sweep_interval_secs));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Queue processor shutting down");
                    break;
                }
                _ = poll.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.claimed > 0 => {
                            info!(
                                "Processed {} jobs: {} done, {} requeued, {} failed, {} delayed",
                                report.claimed,
                                report.completed,
                                report.requeued,
                                report.failed,
                                report.delayed
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Processing run failed: {}", e),
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep_once() {
                        error!("Queue sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Queue processor stopped");
    }

    /// One maintenance pass, then refresh the queue gauges.
    pub fn sweep_once(&self) -> QueueResult<()> {
        self.queue.sweep()?;
        metrics::record_queue_stats(&self.queue.get_stats()?);
        Ok(())
    }

    /// Take the lease, process one batch and release the lease.
    pub async fn run_once(&self) -> QueueResult<RunReport> {
        if !self.queue.lock_queue()? {
            debug!("Processing lease held elsewhere, skipping run");
            return Ok(RunReport {
                lock_contended: true,
                ..Default::default()
            });
        }

        let result = self.process_batch().await;

        if let Err(e) = self.queue.unlock_queue() {
            warn!("Failed to release processing lease: {}", e);
        }
        result
    }

    async fn process_batch(&self) -> QueueResult<RunReport> {
        let jobs = self.queue.dequeue_next_batch()?;
        let mut report = RunReport {
            claimed: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.queue.settings().worker_count));
        let mut tasks = JoinSet::new();

        for job in jobs {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let executor = self.executor.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                // Inner task so a panicking executor only fails its own job
                let run = tokio::spawn({
                    let job = job.clone();
                    async move { executor.execute(&job).await }
                });
                let outcome = match run.await {
                    Ok(outcome) => outcome,
                    Err(e) => JobOutcome::Failed(format!("Executor panicked: {}", e)),
                };
                (job, outcome, started.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (job, outcome, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Worker task failed: {}", e);
                    report.errors += 1;
                    continue;
                }
            };
            metrics::record_job_duration(&job.job_type, elapsed);

            if let Err(e) = self.apply_outcome(&job, outcome, &mut report) {
                error!("Failed to record outcome of job {}: {}", job.id, e);
                report.errors += 1;
            }
            if let Err(e) = self.queue.renew_lock() {
                warn!("Failed to renew processing lease: {}", e);
            }
        }

        Ok(report)
    }

    fn apply_outcome(
        &self,
        job: &Job,
        outcome: JobOutcome,
        report: &mut RunReport,
    ) -> QueueResult<()> {
        let applied = match outcome {
            JobOutcome::Done(result) => {
                let done = self.queue.mark_done(job.id, result.as_deref())?;
                if done {
                    report.completed += 1;
                }
                done
            }
            JobOutcome::Failed(error) => match self.queue.increment_attempts(job.id, &error)? {
                Some(JobStatus::Failed) => {
                    report.failed += 1;
                    true
                }
                Some(_) => {
                    report.requeued += 1;
                    true
                }
                None => false,
            },
            JobOutcome::Fatal(error) => {
                let failed = self.queue.mark_failed(job.id, &error)?;
                if failed {
                    report.failed += 1;
                }
                failed
            }
            JobOutcome::RetryLater { reason, after } => {
                let delayed = self
                    .queue
                    .delay_with_backoff(job.id, job.attempts, after, &reason)?
                    .is_some();
                if delayed {
                    report.delayed += 1;
                }
                delayed
            }
        };

        if !applied {
            warn!(
                "Job {} ({}) left processing before its outcome was recorded",
                job.id, job.job_type
            );
            report.lost += 1;
        }
        Ok(())
    }
}
