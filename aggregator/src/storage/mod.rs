//! Persistent storage: SQLite tables plus capped ring stores

pub mod aggregate_dao;
pub mod capped;
pub mod data_source;
pub mod gauge_name_dao;
pub mod gauge_value_dao;
pub mod trace_attribute_name_dao;
pub mod trace_dao;
pub mod transaction_type_dao;
pub mod watermark;

pub use aggregate_dao::AggregateDao;
pub use capped::{Capped, CappedId, CappedStore};
pub use data_source::DataSource;
pub use gauge_name_dao::GaugeNameDao;
pub use gauge_value_dao::GaugeValueDao;
pub use trace_attribute_name_dao::TraceAttributeNameDao;
pub use trace_dao::TraceDao;
pub use transaction_type_dao::TransactionTypeDao;

use crate::config::StorageConfig;
use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

const DATABASE_FILE: &str = "data.db";
const TRACE_CAPPED_FILE: &str = "trace.capped";

/// Every DAO over one data source.
pub struct Storage {
    pub data_source: Arc<DataSource>,
    pub transaction_types: Arc<TransactionTypeDao>,
    pub aggregates: Arc<AggregateDao>,
    pub gauge_names: Arc<GaugeNameDao>,
    pub gauge_values: Arc<GaugeValueDao>,
    pub trace_attribute_names: Arc<TraceAttributeNameDao>,
    pub traces: Arc<TraceDao>,
}

impl Storage {
    /// Open the database and capped stores under `config.data_dir`.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let data_source = DataSource::open(&config.data_dir.join(DATABASE_FILE))?;
        Self::open_with(config, data_source, &config.data_dir)
    }

    /// Use an existing data source; capped stores go under `capped_dir`.
    pub fn open_with(config: &StorageConfig, data_source: DataSource, capped_dir: &Path) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(capped_dir)?;
        let data_source = Arc::new(data_source);

        let rollup_stores = (0..config.aggregate_level_count())
            .map(|level| {
                CappedStore::open(
                    &capped_dir.join(format!("rollup-{}.capped", level)),
                    config.rollup_capped_store_size_bytes(level),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let trace_store = CappedStore::open(
            &capped_dir.join(TRACE_CAPPED_FILE),
            config.trace_capped_store_size_bytes(),
        )?;

        let transaction_types = Arc::new(TransactionTypeDao::new(data_source.clone())?);
        let aggregates = Arc::new(AggregateDao::new(
            data_source.clone(),
            rollup_stores,
            transaction_types.clone(),
            config,
        )?);
        let gauge_names = Arc::new(GaugeNameDao::new(data_source.clone())?);
        let gauge_values = Arc::new(GaugeValueDao::new(
            data_source.clone(),
            gauge_names.clone(),
            config,
        )?);
        let trace_attribute_names = Arc::new(TraceAttributeNameDao::new(data_source.clone())?);
        let traces = Arc::new(TraceDao::new(
            data_source.clone(),
            trace_store,
            trace_attribute_names.clone(),
        )?);

        tracing::info!(data_dir = %capped_dir.display(), "Storage opened");
        Ok(Self {
            data_source,
            transaction_types,
            aggregates,
            gauge_names,
            gauge_values,
            trace_attribute_names,
            traces,
        })
    }

    pub fn is_closing(&self) -> bool {
        self.data_source.is_closing()
    }

    /// Switch every DAO to its closing sentinel.
    pub fn close(&self) {
        crate::audit::storage_closing();
        self.data_source.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollupConfig;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_files() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().join("data"),
            aggregate_rollups: vec![RollupConfig::new(60_000, 3_600_000), RollupConfig::new(300_000, 28_800_000)],
            aggregate_retention_hours: vec![1, 2],
            rollup_capped_store_sizes_mb: vec![1, 1],
            trace_capped_store_size_mb: 1,
            ..Default::default()
        };
        let storage = Storage::open(&config).unwrap();
        assert!(config.data_dir.join(DATABASE_FILE).exists());
        assert!(config.data_dir.join("rollup-1.capped").exists());
        assert!(config.data_dir.join(TRACE_CAPPED_FILE).exists());
        assert!(!storage.is_closing());
        storage.close();
        assert!(storage.is_closing());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            aggregate_retention_hours: vec![1],
            ..Default::default()
        };
        let result = Storage::open_with(&config, DataSource::open_in_memory().unwrap(), dir.path());
        assert!(result.is_err());
    }
}
