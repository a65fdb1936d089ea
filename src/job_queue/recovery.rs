//! Stuck-job recovery, consistency repair and retention cleanup.

use super::clock::duration_secs;
use super::error::QueueResult;
use super::events::QueueEvent;
use super::models::{JobStatus, RepairReport, StuckRecovery};
use super::queue::JobQueue;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Everything one maintenance sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub stuck: StuckRecovery,
    pub repaired: RepairReport,
    pub cleaned: usize,
}

impl JobQueue {
    /// Return jobs that have sat in `processing` for longer than `older_than`
    /// to the queue, or fail them if they are out of attempts.
    ///
    /// Whether the lost run counts as an attempt follows
    /// `count_stuck_as_attempt`.
    pub fn reset_stuck_jobs(&self, older_than: Duration) -> QueueResult<StuckRecovery> {
        let secs = duration_secs(older_than);
        let stale_before = self.store.now().saturating_sub(secs);
        let error = format!("Job stuck in processing for more than {}s", secs);

        let mut recovery = StuckRecovery::default();
        for job in self.store.find_stale_processing(stale_before)? {
            let status = self.store.recover_stale_job(
                job.id,
                stale_before,
                &error,
                self.settings.count_stuck_as_attempt,
            )?;
            match status {
                Some(JobStatus::Failed) => {
                    warn!("Stuck job {} ({}) out of attempts", job.id, job.job_type);
                    recovery.failed += 1;
                }
                Some(_) => recovery.requeued += 1,
                // Finished or got touched while we were looking
                None => {}
            }
        }

        self.emit(QueueEvent::StuckRecovered { recovery });
        Ok(recovery)
    }

    /// Fix rows that break the job invariants. Running it twice in a row
    /// fixes nothing the second time.
    pub fn check_and_repair(&self) -> QueueResult<RepairReport> {
        let report = self.store.repair()?;
        self.emit(QueueEvent::Repaired { report });
        Ok(report)
    }

    /// Delete terminal jobs that finished more than `age` ago.
    pub fn cleanup_old_jobs(&self, age: Duration) -> QueueResult<usize> {
        let cutoff = self.store.now().saturating_sub(duration_secs(age));
        let deleted = self.store.delete_finished_before(cutoff)?;
        self.emit(QueueEvent::CleanedUp { deleted, cutoff });
        Ok(deleted)
    }

    /// One maintenance pass using the configured thresholds.
    pub fn sweep(&self) -> QueueResult<SweepReport> {
        let stuck = self.reset_stuck_jobs(Duration::from_secs(
            self.settings.stale_processing_secs.unsigned_abs(),
        ))?;
        let repaired = self.check_and_repair()?;
        let cleaned = self.cleanup_old_jobs(Duration::from_secs(
            self.settings.retention_secs().unsigned_abs(),
        ))?;

        let report = SweepReport {
            stuck,
            repaired,
            cleaned,
        };
        if stuck.total() + repaired.total() + cleaned > 0 {
            info!(
                "Sweep: {} stuck requeued, {} stuck failed, {} repaired, {} cleaned",
                stuck.requeued,
                stuck.failed,
                repaired.total(),
                cleaned
            );
        }
        Ok(report)
    }
}
