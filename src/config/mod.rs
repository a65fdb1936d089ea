mod file_config;

pub use file_config::{FileConfig, QueueConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub max_attempts: Option<i32>,
    pub lock_ttl_secs: Option<i64>,
    pub worker_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub queue: QueueSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db or in config file")
            })?;

        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }

        // Queue settings - TOML, then CLI, then defaults
        let defaults = QueueSettings::default();
        let q = file.queue.unwrap_or_default();
        let queue = QueueSettings {
            batch_size: q.batch_size.or(cli.batch_size).unwrap_or(defaults.batch_size),
            max_attempts: q
                .max_attempts
                .or(cli.max_attempts)
                .unwrap_or(defaults.max_attempts),
            default_priority: q.default_priority.unwrap_or(defaults.default_priority),
            lock_name: q.lock_name.unwrap_or(defaults.lock_name),
            lock_ttl_secs: q
                .lock_ttl_secs
                .or(cli.lock_ttl_secs)
                .unwrap_or(defaults.lock_ttl_secs),
            stale_processing_secs: q
                .stale_processing_secs
                .unwrap_or(defaults.stale_processing_secs),
            count_stuck_as_attempt: q
                .count_stuck_as_attempt
                .unwrap_or(defaults.count_stuck_as_attempt),
            poll_interval_secs: q.poll_interval_secs.unwrap_or(defaults.poll_interval_secs),
            sweep_interval_secs: q
                .sweep_interval_secs
                .unwrap_or(defaults.sweep_interval_secs),
            worker_count: q
                .worker_count
                .or(cli.worker_count)
                .unwrap_or(defaults.worker_count),
            retention_days: q.retention_days.unwrap_or(defaults.retention_days),
            initial_backoff_secs: q
                .initial_backoff_secs
                .unwrap_or(defaults.initial_backoff_secs),
            max_backoff_secs: q.max_backoff_secs.unwrap_or(defaults.max_backoff_secs),
            backoff_multiplier: q.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
        };
        queue.validate()?;

        Ok(Self { db_path, queue })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Jobs claimed per processing run
    pub batch_size: usize,
    /// Attempts given to every new job
    pub max_attempts: i32,
    pub default_priority: i64,
    /// Name of the lease guarding processing runs
    pub lock_name: String,
    pub lock_ttl_secs: i64,
    /// A processing job untouched for this long is considered stuck
    pub stale_processing_secs: i64,
    /// Whether recovering a stuck job consumes one of its attempts
    pub count_stuck_as_attempt: bool,
    pub poll_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub worker_count: usize,
    /// Terminal jobs older than this are deleted by the sweeper
    pub retention_days: u64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_attempts: 3,
            default_priority: 10,
            lock_name: "job_queue".to_string(),
            lock_ttl_secs: 300,
            stale_processing_secs: 3600,
            count_stuck_as_attempt: true,
            poll_interval_secs: 60,
            sweep_interval_secs: 900,
            worker_count: 2,
            retention_days: 30,
            initial_backoff_secs: 60,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

impl QueueSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            bail!("max_attempts must be at least 1, got {}", self.max_attempts);
        }
        if self.default_priority < 0 {
            bail!(
                "default_priority must not be negative, got {}",
                self.default_priority
            );
        }
        if self.lock_name.trim().is_empty() {
            bail!("lock_name must not be empty");
        }
        if self.lock_ttl_secs < 1 {
            bail!("lock_ttl_secs must be at least 1, got {}", self.lock_ttl_secs);
        }
        if self.stale_processing_secs < 1 {
            bail!(
                "stale_processing_secs must be at least 1, got {}",
                self.stale_processing_secs
            );
        }
        if self.worker_count == 0 {
            bail!("worker_count must be at least 1");
        }
        if self.poll_interval_secs == 0 || self.sweep_interval_secs == 0 {
            bail!("poll_interval_secs and sweep_interval_secs must be at least 1");
        }
        if self.backoff_multiplier < 1.0 {
            bail!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            );
        }
        if self.max_backoff_secs < self.initial_backoff_secs {
            bail!(
                "max_backoff_secs ({}) must not be below initial_backoff_secs ({})",
                self.max_backoff_secs,
                self.initial_backoff_secs
            );
        }
        Ok(())
    }

    pub fn retention_secs(&self) -> i64 {
        i64::try_from(self.retention_days.saturating_mul(24 * 60 * 60)).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = QueueSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.batch_size, 5);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.lock_ttl_secs, 300);
        assert_eq!(settings.retention_secs(), 30 * 86400);
    }

    #[test]
    fn test_retention_secs_saturates() {
        let settings = QueueSettings {
            retention_days: u64::MAX,
            ..Default::default()
        };
        assert_eq!(settings.retention_secs(), i64::MAX);
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            batch_size: Some(8),
            worker_count: Some(4),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.db_path, temp_dir.path().join("jobs.db"));
        assert_eq!(config.queue.batch_size, 8);
        assert_eq!(config.queue.worker_count, 4);
        assert_eq!(config.queue.max_attempts, 3);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/should/be/overridden.db")),
            batch_size: Some(8),
            max_attempts: Some(7),
            ..Default::default()
        };
        let file_config = FileConfig {
            db_path: Some(temp_dir.path().join("toml.db").to_string_lossy().to_string()),
            queue: Some(QueueConfig {
                batch_size: Some(20),
                lock_name: Some("seo_queue".to_string()),
                ..Default::default()
            }),
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_path, temp_dir.path().join("toml.db"));
        assert_eq!(config.queue.batch_size, 20);
        assert_eq!(config.queue.lock_name, "seo_queue");
        // CLI value used when TOML doesn't specify
        assert_eq!(config.queue.max_attempts, 7);
    }

    #[test]
    fn test_resolve_missing_db_path_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_path must be specified"));
    }

    #[test]
    fn test_resolve_missing_parent_dir_error() {
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/nonexistent/path/jobs.db")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_rejects_invalid_settings() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            max_attempts: Some(0),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("max_attempts"));
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let settings = QueueSettings {
            initial_backoff_secs: 600,
            max_backoff_secs: 60,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = QueueSettings {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
