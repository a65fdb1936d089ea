//! End-to-end scenarios over the public queue API, against a database file.

mod common;

use common::{TestDb, T0};
use seo_job_queue::config::QueueSettings;
use seo_job_queue::job_queue::codec::{decode_json, encode_json};
use seo_job_queue::job_queue::{JobFilter, JobStatus, NewJob, RetryFilter};
use serde_json::json;
use std::time::Duration;

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_generate_title_exhausts_attempts() {
    let db = TestDb::new();
    let queue = db.queue();
    let payload = encode_json(&json!({ "post_id": 42 })).unwrap();
    let id = queue
        .enqueue(NewJob::new("generate_title", payload))
        .unwrap();

    for attempt in 1..=3 {
        let job = queue.dequeue_one().unwrap().expect("job should be claimable");
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, attempt - 1);
        let payload: serde_json::Value = decode_json(&job.payload).unwrap();
        assert_eq!(payload["post_id"], 42);
        queue.increment_attempts(id, "API timeout").unwrap();
    }

    let job = queue.get_job(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.error_message.as_deref(), Some("API timeout"));
    assert!(queue.dequeue_one().unwrap().is_none());

    // A manual retry gives it a fresh set of attempts
    assert!(queue.retry_job(id).unwrap());
    assert!(!queue.retry_job(id).unwrap());
    let job = queue.dequeue_one().unwrap().unwrap();
    assert_eq!(job.attempts, 0);
    assert!(queue.mark_done(id, Some(b"Ten Ways To Rank")).unwrap());
}

#[test]
fn test_scheduled_job_waits_for_its_time() {
    let db = TestDb::new();
    let queue = db.queue();
    let id = queue
        .enqueue(NewJob::new("generate_meta", Vec::new()).scheduled_at(T0 + 600))
        .unwrap();
    assert_eq!(
        queue.get_job(id).unwrap().unwrap().status,
        JobStatus::Scheduled
    );

    assert!(queue.dequeue_one().unwrap().is_none());
    db.clock.advance(599);
    assert!(queue.dequeue_one().unwrap().is_none());
    db.clock.advance(1);
    assert_eq!(queue.dequeue_one().unwrap().unwrap().id, id);
}

#[test]
fn test_higher_priority_first() {
    let db = TestDb::new();
    let queue = db.queue();
    let a = queue
        .enqueue(NewJob::new("a", Vec::new()).with_priority(5))
        .unwrap();
    db.clock.advance(1);
    let b = queue
        .enqueue(NewJob::new("b", Vec::new()).with_priority(10))
        .unwrap();

    let batch = queue.dequeue_batch(5).unwrap();
    let ids: Vec<i64> = batch.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![b, a]);
}

#[test]
fn test_cancelled_job_is_immutable() {
    let db = TestDb::new();
    let queue = db.queue();
    let id = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
    assert!(queue.mark_cancelled(id, "post deleted").unwrap());
    let before = queue.get_job(id).unwrap().unwrap();

    assert!(!queue.mark_done(id, None).unwrap());
    assert!(!queue.retry_job(id).unwrap());
    assert!(queue.dequeue_one().unwrap().is_none());
    assert_eq!(queue.get_job(id).unwrap().unwrap(), before);
}

#[test]
fn test_delayed_job_keeps_attempts() {
    let db = TestDb::new();
    let queue = db.queue();
    let id = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
    let job = queue.dequeue_one().unwrap().unwrap();

    let retry_at = queue
        .delay_with_backoff(job.id, job.attempts, None, "rate limited")
        .unwrap()
        .unwrap();
    assert_eq!(retry_at, T0 + 60);
    assert!(queue.dequeue_one().unwrap().is_none());

    db.clock.advance(60);
    let job = queue.dequeue_one().unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 0);
}

// ============================================================================
// Maintenance
// ============================================================================

#[test]
fn test_stuck_jobs_recovered_per_attempt_budget() {
    let db = TestDb::new();
    let queue = db.queue();
    let fresh = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
    let worn = queue.enqueue(NewJob::new("b", Vec::new())).unwrap();

    // Use up two of worn's three attempts
    for _ in 0..2 {
        assert!(queue.mark_processing(worn).unwrap());
        queue.increment_attempts(worn, "timeout").unwrap();
    }
    assert_eq!(queue.dequeue_batch(2).unwrap().len(), 2);

    db.clock.advance(2 * 3600);
    let recovery = queue.reset_stuck_jobs(Duration::from_secs(3600)).unwrap();
    assert_eq!(recovery.requeued, 1);
    assert_eq!(recovery.failed, 1);

    let fresh = queue.get_job(fresh).unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Pending);
    assert_eq!(fresh.attempts, 1);
    let worn = queue.get_job(worn).unwrap().unwrap();
    assert_eq!(worn.status, JobStatus::Failed);
    assert_eq!(worn.attempts, 3);
}

#[test]
fn test_stuck_recovery_without_counting_attempts() {
    let db = TestDb::new();
    let queue = db.queue_with(QueueSettings {
        count_stuck_as_attempt: false,
        ..Default::default()
    });
    let id = queue.enqueue(NewJob::new("a", Vec::new())).unwrap();
    queue.dequeue_one().unwrap();

    db.clock.advance(2 * 3600);
    let recovery = queue.reset_stuck_jobs(Duration::from_secs(3600)).unwrap();
    assert_eq!(recovery.requeued, 1);

    let job = queue.get_job(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}

#[test]
fn test_bulk_retry_and_cleanup() {
    let db = TestDb::new();
    let queue = db.queue();
    let mut failed = Vec::new();
    for job_type in ["generate_title", "generate_meta", "generate_title"] {
        let id = queue.enqueue(NewJob::new(job_type, Vec::new())).unwrap();
        queue.mark_processing(id).unwrap();
        queue.mark_failed(id, "bad payload").unwrap();
        failed.push(id);
    }

    let retried = queue
        .retry_failed_jobs(&RetryFilter {
            job_type: Some("generate_meta".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(retried, vec![failed[1]]);

    db.clock.advance(31 * 86400);
    assert_eq!(
        queue.cleanup_old_jobs(Duration::from_secs(30 * 86400)).unwrap(),
        2
    );
    assert_eq!(queue.count_jobs(&JobFilter::default()).unwrap(), 1);
}

#[test]
fn test_jobs_survive_reopen() {
    let db = TestDb::new();
    let id = {
        let queue = db.queue();
        queue.enqueue(NewJob::new("a", b"opaque".to_vec())).unwrap()
    };

    let queue = db.queue();
    let job = queue.get_job(id).unwrap().unwrap();
    assert_eq!(job.payload, b"opaque".to_vec());
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.created_at, T0);
}
