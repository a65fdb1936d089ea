//! Common test infrastructure
//!
//! Builds queues over file-backed stores with a manual clock, so tests can
//! open several stores on one database and move time forward at will.

#![allow(dead_code)]

use seo_job_queue::config::QueueSettings;
use seo_job_queue::job_queue::{JobQueue, ManualClock, SqliteJobStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const T0: i64 = 1_700_000_000;

/// A database file in a temp dir that lives as long as this value.
pub struct TestDb {
    _dir: TempDir,
    pub path: PathBuf,
    pub clock: Arc<ManualClock>,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");
        Self {
            _dir: dir,
            path,
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    /// A queue on its own connection to the shared database file.
    pub fn queue(&self) -> JobQueue {
        self.queue_with(QueueSettings::default())
    }

    pub fn queue_with(&self, settings: QueueSettings) -> JobQueue {
        JobQueue::new(Arc::new(open_store(&self.path, &self.clock)), settings).unwrap()
    }
}

pub fn open_store(path: &Path, clock: &Arc<ManualClock>) -> SqliteJobStore {
    SqliteJobStore::new(path).unwrap().with_clock(clock.clone())
}
