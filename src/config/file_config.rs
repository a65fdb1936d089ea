use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,

    pub queue: Option<QueueConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: Option<usize>,
    pub max_attempts: Option<i32>,
    pub default_priority: Option<i64>,
    pub lock_name: Option<String>,
    pub lock_ttl_secs: Option<i64>,
    pub stale_processing_secs: Option<i64>,
    pub count_stuck_as_attempt: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub worker_count: Option<usize>,
    pub retention_days: Option<u64>,
    // Backoff for executor "retry later" outcomes
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
