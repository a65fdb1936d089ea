use super::models::JobStatus;
use thiserror::Error;

/// Errors returned by [`JobQueue`](super::JobQueue) operations.
///
/// Precondition mismatches (a job in the wrong status, an unknown id) are not
/// errors: they come back as `false` or `None`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid job type {0:?}: must be 1-50 characters of [A-Za-z0-9_.:-]")]
    InvalidJobType(String),

    #[error("jobs cannot be enqueued with status {0}")]
    InvalidStatus(JobStatus),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid queue settings: {0}")]
    InvalidSettings(String),

    #[error("job store error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl QueueError {
    /// True for errors raised while validating input, before anything was written.
    pub fn is_validation(&self) -> bool {
        !matches!(self, QueueError::Storage(_))
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors() {
        assert!(QueueError::InvalidJobType(String::new()).is_validation());
        assert!(QueueError::InvalidStatus(JobStatus::Processing).is_validation());
        assert!(QueueError::InvalidSettings("worker_count must be at least 1".into()).is_validation());
        assert!(!QueueError::Storage(anyhow::anyhow!("disk full")).is_validation());
    }

    #[test]
    fn test_storage_error_keeps_context_chain() {
        let err: QueueError = anyhow::anyhow!("database is locked")
            .context("Failed to claim job 4")
            .into();
        let message = err.to_string();
        assert!(message.contains("Failed to claim job 4"));
        assert!(message.contains("database is locked"));
    }
}
