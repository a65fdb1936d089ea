use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seo_job_queue::config::{AppConfig, CliConfig, FileConfig};
use seo_job_queue::job_queue::codec::{decode_json, encode_json};
use seo_job_queue::job_queue::{
    Job, JobFilter, JobQueue, JobStatus, NewJob, RetryFilter, SqliteJobStore,
};
use seo_job_queue::metrics::{self, MetricsEventSink};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::parse(s).ok_or_else(|| format!("unknown status: {}", s))
}

#[derive(Parser, Debug)]
#[command(name = "queue-cli", about = "Inspect and maintain the job queue")]
struct CliArgs {
    /// Path to the SQLite job queue database file.
    #[clap(long, value_parser = parse_path)]
    pub db: Option<PathBuf>,

    /// Path to a TOML config file. Values there override CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Attempts given to newly enqueued jobs.
    #[clap(long)]
    pub max_attempts: Option<i32>,

    /// Processing lease TTL in seconds.
    #[clap(long)]
    pub lock_ttl_secs: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueues a job. The payload is JSON and is stored in the payload envelope.
    Enqueue {
        job_type: String,
        #[clap(long, default_value = "{}")]
        payload: String,
        #[clap(long)]
        priority: Option<i64>,
        /// Run no earlier than this many seconds from now.
        #[clap(long)]
        delay_secs: Option<i64>,
    },

    /// Shows a single job.
    Show { id: i64 },

    /// Lists jobs, newest first.
    List {
        #[clap(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[clap(long = "type")]
        job_type: Option<String>,
        #[clap(long, default_value_t = 100)]
        limit: usize,
        #[clap(long, default_value_t = 0)]
        offset: usize,
    },

    /// Shows queue statistics.
    Stats,

    /// Gives a failed job a fresh set of attempts.
    Retry { id: i64 },

    /// Retries failed jobs in bulk.
    RetryFailed {
        #[clap(long = "type")]
        job_type: Option<String>,
        /// Only jobs that failed at least this many seconds ago.
        #[clap(long)]
        older_than_secs: Option<i64>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },

    /// Cancels a job that is not processing or finished.
    Cancel {
        id: i64,
        #[clap(long)]
        reason: Option<String>,
    },

    /// Deletes finished jobs older than the retention period.
    Cleanup {
        #[clap(long)]
        days: Option<u64>,
    },

    /// Requeues or fails jobs stuck in processing.
    ResetStuck {
        #[clap(long)]
        older_than_secs: Option<u64>,
    },

    /// Fixes rows that break the job invariants.
    Repair,

    /// Deletes all jobs, or all jobs in one status.
    Clear {
        #[clap(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        /// Required, this cannot be undone.
        #[clap(long)]
        yes: bool,
    },

    /// Shows the processing lease.
    LockStatus,

    /// Force-releases the processing lease, whoever holds it.
    Unlock,

    /// Prints queue metrics in the Prometheus text format.
    Metrics,
}

fn payload_view(bytes: &[u8]) -> Value {
    match decode_json::<Value>(bytes) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn job_view(job: &Job) -> Value {
    json!({
        "id": job.id,
        "type": job.job_type,
        "status": job.status,
        "priority": job.priority,
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "payload": payload_view(&job.payload),
        "result": job.result.as_deref().map(payload_view),
        "error_message": job.error_message,
        "scheduled_at": job.scheduled_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_queue(cli_args: &CliArgs) -> Result<JobQueue> {
    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_path: cli_args.db.clone(),
        max_attempts: cli_args.max_attempts,
        lock_ttl_secs: cli_args.lock_ttl_secs,
        ..Default::default()
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening job queue database at {:?}...", config.db_path);
    let store = SqliteJobStore::new(&config.db_path)?;
    let queue = JobQueue::new(Arc::new(store), config.queue)?;
    Ok(queue.with_sink(Arc::new(MetricsEventSink::new())))
}

fn execute_command(queue: &JobQueue, command: Command) -> Result<()> {
    match command {
        Command::Enqueue {
            job_type,
            payload,
            priority,
            delay_secs,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            let mut job = queue.new_job(job_type, encode_json(&payload)?);
            if let Some(priority) = priority {
                job = job.with_priority(priority);
            }
            if let Some(delay) = delay_secs {
                job = job.scheduled_at(queue.store().now() + delay);
            }
            let id = queue.enqueue(job)?;
            print_json(&json!({ "id": id }))
        }
        Command::Show { id } => match queue.get_job(id)? {
            Some(job) => print_json(&job_view(&job)),
            None => bail!("Job {} not found", id),
        },
        Command::List {
            status,
            job_type,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                status,
                job_type,
                ..Default::default()
            }
            .page(limit, offset);
            let jobs = queue.get_jobs(&filter)?;
            let total = queue.count_jobs(&filter)?;
            print_json(&json!({
                "total": total,
                "jobs": jobs.iter().map(job_view).collect::<Vec<_>>(),
            }))
        }
        Command::Stats => print_json(&serde_json::to_value(queue.get_stats()?)?),
        Command::Retry { id } => {
            let retried = queue.retry_job(id)?;
            print_json(&json!({ "id": id, "retried": retried }))
        }
        Command::RetryFailed {
            job_type,
            older_than_secs,
            limit,
        } => {
            let filter = RetryFilter {
                job_type,
                failed_before: older_than_secs.map(|secs| queue.store().now() - secs),
                limit,
            };
            let ids = queue.retry_failed_jobs(&filter)?;
            print_json(&json!({ "retried": ids }))
        }
        Command::Cancel { id, reason } => {
            let cancelled = match reason {
                Some(reason) => queue.mark_cancelled(id, &reason)?,
                None => queue.cancel_job(id)?,
            };
            print_json(&json!({ "id": id, "cancelled": cancelled }))
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(queue.settings().retention_days);
            let deleted = queue.cleanup_old_jobs(Duration::from_secs(days.saturating_mul(24 * 60 * 60)))?;
            print_json(&json!({ "deleted": deleted }))
        }
        Command::ResetStuck { older_than_secs } => {
            let secs =
                older_than_secs.unwrap_or(queue.settings().stale_processing_secs.unsigned_abs());
            let recovery = queue.reset_stuck_jobs(Duration::from_secs(secs))?;
            print_json(&serde_json::to_value(recovery)?)
        }
        Command::Repair => print_json(&serde_json::to_value(queue.check_and_repair()?)?),
        Command::Clear { status, yes } => {
            if !yes {
                bail!("Refusing to delete jobs without --yes");
            }
            let deleted = queue.clear_queue(status)?;
            print_json(&json!({ "deleted": deleted }))
        }
        Command::LockStatus => {
            let now = queue.store().now();
            let lease = queue.queue_lease()?;
            print_json(&json!({
                "locked": lease.as_ref().is_some_and(|l| l.is_live(now)),
                "lease": lease,
            }))
        }
        Command::Unlock => {
            let released = queue.force_unlock_queue()?;
            print_json(&json!({ "released": released }))
        }
        Command::Metrics => {
            metrics::record_queue_stats(&queue.get_stats()?);
            print!("{}", metrics::gather_metrics()?);
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let queue = open_queue(&cli_args)?;
    execute_command(&queue, cli_args.command)
}
