pub mod config;
pub mod job_queue;
pub mod metrics;
pub mod sqlite_persistence;
