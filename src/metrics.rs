use crate::job_queue::{JobStatus, QueueEvent, QueueEventSink, QueueStats};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all job queue metrics
const PREFIX: &str = "seo_job_queue";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Job Metrics
    pub static ref JOBS_ENQUEUED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_enqueued_total"), "Total jobs accepted by enqueue"),
        &["job_type"]
    ).expect("Failed to create jobs_enqueued_total metric");

    pub static ref JOBS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_rejected_total"), "Total jobs rejected at enqueue"),
        &["job_type"]
    ).expect("Failed to create jobs_rejected_total metric");

    pub static ref JOB_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_transitions_total"), "Job status transitions by target status"),
        &["status"]
    ).expect("Failed to create job_transitions_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Executor run time per job in seconds"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["job_type"]
    ).expect("Failed to create job_duration_seconds metric");

    // Queue Metrics
    pub static ref QUEUE_JOBS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_jobs"), "Jobs currently in the queue by status"),
        &["status"]
    ).expect("Failed to create jobs metric");

    pub static ref QUEUE_LOCK_HELD: Gauge = Gauge::new(
        format!("{PREFIX}_lock_held"),
        "1 while this process holds the processing lease"
    ).expect("Failed to create lock_held metric");

    pub static ref LOCK_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_lock_events_total"), "Processing lease events"),
        &["outcome"]
    ).expect("Failed to create lock_events_total metric");

    // Maintenance Metrics
    pub static ref MAINTENANCE_ROWS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_maintenance_rows_total"), "Rows touched by maintenance actions"),
        &["action"]
    ).expect("Failed to create maintenance_rows_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_ENQUEUED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_REJECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_TRANSITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_JOBS.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_LOCK_HELD.clone()));
    let _ = REGISTRY.register(Box::new(LOCK_EVENTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MAINTENANCE_ROWS_TOTAL.clone()));

    tracing::debug!("Job queue metrics initialized");
}

/// Record a status transition
pub fn record_transition(status: JobStatus) {
    JOB_TRANSITIONS_TOTAL
        .with_label_values(&[status.as_str()])
        .inc();
}

/// Record how long an executor ran for a job
pub fn record_job_duration(job_type: &str, duration: Duration) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration.as_secs_f64());
}

fn record_maintenance(action: &str, rows: usize) {
    MAINTENANCE_ROWS_TOTAL
        .with_label_values(&[action])
        .inc_by(rows as f64);
}

fn record_lock_event(outcome: &str) {
    LOCK_EVENTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Update the per-status gauges from a stats snapshot
pub fn record_queue_stats(stats: &QueueStats) {
    for status in JobStatus::ALL {
        QUEUE_JOBS
            .with_label_values(&[status.as_str()])
            .set(stats.by_status.get(status) as f64);
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Feeds queue events into the Prometheus counters.
#[derive(Debug, Clone, Copy)]
pub struct MetricsEventSink;

impl MetricsEventSink {
    pub fn new() -> Self {
        init_metrics();
        Self
    }
}

impl Default for MetricsEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueEventSink for MetricsEventSink {
    fn emit(&self, event: &QueueEvent) {
        match event {
            QueueEvent::Enqueued {
                job_type, status, ..
            } => {
                JOBS_ENQUEUED_TOTAL.with_label_values(&[job_type.as_str()]).inc();
                record_transition(*status);
            }
            QueueEvent::EnqueueRejected { job_type, .. } => {
                JOBS_REJECTED_TOTAL.with_label_values(&[job_type.as_str()]).inc();
            }
            QueueEvent::Claimed { .. } => record_transition(JobStatus::Processing),
            QueueEvent::Completed { .. } => record_transition(JobStatus::Done),
            QueueEvent::AttemptFailed { status, .. } => record_transition(*status),
            QueueEvent::Failed { .. } => record_transition(JobStatus::Failed),
            QueueEvent::Delayed { .. } => record_transition(JobStatus::Delayed),
            QueueEvent::Cancelled { .. } => record_transition(JobStatus::Cancelled),
            QueueEvent::Retried { .. } => {
                record_transition(JobStatus::Pending);
                record_maintenance("retried", 1);
            }
            QueueEvent::StuckRecovered { recovery } => {
                record_maintenance("stuck_requeued", recovery.requeued);
                record_maintenance("stuck_failed", recovery.failed);
            }
            QueueEvent::Repaired { report } => record_maintenance("repaired", report.total()),
            QueueEvent::CleanedUp { deleted, .. } => record_maintenance("cleaned_up", *deleted),
            QueueEvent::Cleared { deleted, .. } => record_maintenance("cleared", *deleted),
            QueueEvent::LockAcquired { .. } => {
                QUEUE_LOCK_HELD.set(1.0);
                record_lock_event("acquired");
            }
            QueueEvent::LockContended { .. } => record_lock_event("contended"),
            QueueEvent::LockReleased { .. } => {
                QUEUE_LOCK_HELD.set(0.0);
                record_lock_event("released");
            }
            QueueEvent::LockForced { .. } => {
                QUEUE_LOCK_HELD.set(0.0);
                record_lock_event("forced");
            }
        }
    }
}
