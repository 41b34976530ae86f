//! Aggregator configuration

use crate::error::{Result, StorageError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default values used when nothing is configured.
pub struct ConfigDefaults;

impl ConfigDefaults {
    pub const MAX_QUERIES_PER_TYPE: usize = 500;
    pub const MAX_SERVICE_CALLS_PER_TYPE: usize = 500;
    pub const FLUSH_INTERVAL_MILLIS: u64 = 60_000;
    pub const ROLLUP_GRACE_MILLIS: u64 = 60_000;
    pub const REAPER_INTERVAL_MILLIS: u64 = 3_600_000;
    pub const MAX_LIVE_INTERVALS: usize = 60;
    pub const ROLLUP_CAPPED_STORE_SIZE_MB: u64 = 500;
    pub const TRACE_CAPPED_STORE_SIZE_MB: u64 = 500;
    pub const TRACE_RETENTION_HOURS: u64 = 24 * 14;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Admin HTTP listen address (health checks + metrics)
    pub admin_addr: String,

    /// Storage and rollup configuration
    pub storage: StorageConfig,

    /// How often completed live intervals are flushed (and rollups attempted)
    pub flush_interval_millis: u64,

    /// How far behind the wall clock flush-driven rollups stay, so intervals
    /// delivered late still land in their window
    pub rollup_grace_millis: u64,

    /// Delay between the end of one retention sweep and the start of the next
    pub reaper_interval_millis: u64,

    /// Max not-yet-flushed intervals held in memory
    pub max_live_intervals: usize,
}

/// One rollup level: the bucket width and the widest query range it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    pub interval_millis: i64,
    pub view_threshold_millis: i64,
}

impl RollupConfig {
    pub const fn new(interval_millis: i64, view_threshold_millis: i64) -> Self {
        Self {
            interval_millis,
            view_threshold_millis,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the database and capped store files
    pub data_dir: PathBuf,

    /// Index 0 is raw data (interval = flush interval), index i > 0 is rollup level i
    pub aggregate_rollups: Vec<RollupConfig>,

    /// Index 0 is raw gauge data, index i > 0 is gauge rollup level i
    pub gauge_rollups: Vec<RollupConfig>,

    /// Retention per aggregate level, in hours
    pub aggregate_retention_hours: Vec<u64>,

    /// Retention per gauge level, in hours
    pub gauge_retention_hours: Vec<u64>,

    pub trace_retention_hours: u64,

    /// Capped store size per aggregate level, in MB
    pub rollup_capped_store_sizes_mb: Vec<u64>,

    pub trace_capped_store_size_mb: u64,

    /// Distinct queries kept per query type in each aggregate
    pub max_queries_per_type: usize,

    /// Distinct service calls kept per service call type in each aggregate
    pub max_service_calls_per_type: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            aggregate_rollups: vec![
                RollupConfig::new(60_000, 3_600_000),
                RollupConfig::new(300_000, 8 * 3_600_000),
                RollupConfig::new(1_800_000, 48 * 3_600_000),
                RollupConfig::new(14_400_000, 14 * 24 * 3_600_000),
            ],
            gauge_rollups: vec![
                RollupConfig::new(5_000, 900_000),
                RollupConfig::new(60_000, 3_600_000),
                RollupConfig::new(300_000, 8 * 3_600_000),
                RollupConfig::new(1_800_000, 48 * 3_600_000),
            ],
            aggregate_retention_hours: vec![24 * 3, 24 * 7, 24 * 30, 24 * 365],
            gauge_retention_hours: vec![4, 24 * 7, 24 * 30, 24 * 365],
            trace_retention_hours: ConfigDefaults::TRACE_RETENTION_HOURS,
            rollup_capped_store_sizes_mb: vec![ConfigDefaults::ROLLUP_CAPPED_STORE_SIZE_MB; 4],
            trace_capped_store_size_mb: ConfigDefaults::TRACE_CAPPED_STORE_SIZE_MB,
            max_queries_per_type: ConfigDefaults::MAX_QUERIES_PER_TYPE,
            max_service_calls_per_type: ConfigDefaults::MAX_SERVICE_CALLS_PER_TYPE,
        }
    }
}

impl StorageConfig {
    pub fn aggregate_level_count(&self) -> usize {
        self.aggregate_rollups.len()
    }

    pub fn gauge_level_count(&self) -> usize {
        self.gauge_rollups.len()
    }

    pub fn rollup_capped_store_size_bytes(&self, level: usize) -> u64 {
        self.rollup_capped_store_sizes_mb
            .get(level)
            .copied()
            .unwrap_or(ConfigDefaults::ROLLUP_CAPPED_STORE_SIZE_MB)
            * 1024
            * 1024
    }

    pub fn trace_capped_store_size_bytes(&self) -> u64 {
        self.trace_capped_store_size_mb * 1024 * 1024
    }

    /// Validate level definitions
    pub fn validate(&self) -> Result<()> {
        validate_rollups("aggregate", &self.aggregate_rollups)?;
        validate_rollups("gauge", &self.gauge_rollups)?;
        if self.aggregate_retention_hours.len() != self.aggregate_rollups.len() {
            return Err(StorageError::Config(format!(
                "aggregate_retention_hours has {} entries, expected {}",
                self.aggregate_retention_hours.len(),
                self.aggregate_rollups.len()
            )));
        }
        if self.gauge_retention_hours.len() != self.gauge_rollups.len() {
            return Err(StorageError::Config(format!(
                "gauge_retention_hours has {} entries, expected {}",
                self.gauge_retention_hours.len(),
                self.gauge_rollups.len()
            )));
        }
        if self.rollup_capped_store_sizes_mb.len() != self.aggregate_rollups.len() {
            return Err(StorageError::Config(format!(
                "rollup_capped_store_sizes_mb has {} entries, expected {}",
                self.rollup_capped_store_sizes_mb.len(),
                self.aggregate_rollups.len()
            )));
        }
        if self.max_queries_per_type == 0 || self.max_service_calls_per_type == 0 {
            return Err(StorageError::Config(
                "query and service call limits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_rollups(kind: &str, rollups: &[RollupConfig]) -> Result<()> {
    if rollups.is_empty() {
        return Err(StorageError::Config(format!("{} rollups must not be empty", kind)));
    }
    for (level, rollup) in rollups.iter().enumerate() {
        if rollup.interval_millis <= 0 {
            return Err(StorageError::Config(format!(
                "{} level {} interval must be greater than 0",
                kind, level
            )));
        }
        if level == 0 {
            continue;
        }
        let prev = rollups[level - 1].interval_millis;
        if rollup.interval_millis <= prev || rollup.interval_millis % prev != 0 {
            return Err(StorageError::Config(format!(
                "{} level {} interval {}ms must be a larger multiple of level {} interval {}ms",
                kind,
                level,
                rollup.interval_millis,
                level - 1,
                prev
            )));
        }
    }
    Ok(())
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            admin_addr: "0.0.0.0:9090".to_string(),
            storage: StorageConfig::default(),
            flush_interval_millis: ConfigDefaults::FLUSH_INTERVAL_MILLIS,
            rollup_grace_millis: ConfigDefaults::ROLLUP_GRACE_MILLIS,
            reaper_interval_millis: ConfigDefaults::REAPER_INTERVAL_MILLIS,
            max_live_intervals: ConfigDefaults::MAX_LIVE_INTERVALS,
        }
    }
}

impl AggregatorConfig {
    /// Layer defaults, an optional TOML file, then `TRELLIS__*` environment
    /// variables (e.g. `TRELLIS__STORAGE__DATA_DIR`).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let defaults = config::Config::try_from(&AggregatorConfig::default())
            .context("Serialize default config")?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: AggregatorConfig = builder
            .add_source(
                config::Environment::with_prefix("TRELLIS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Load configuration")?
            .try_deserialize()
            .context("Deserialize configuration")?;
        config
            .storage
            .validate()
            .context("Validate storage configuration")?;
        Ok(config)
    }
}
