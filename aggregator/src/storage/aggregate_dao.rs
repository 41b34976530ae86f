//! Aggregate storage and rollup orchestration
//!
//! Every rollup level has two tables: `aggregate_tt_rollup_{level}` (one row
//! per transaction type and capture time) and `aggregate_tn_rollup_{level}`
//! (one row per transaction type, name and capture time). Scalars live in the
//! rows; timers, histograms, detail tables and profiles live in the level's
//! capped store and are referenced by id.
//!
//! Storing level-0 rows takes no orchestrator lock. The multi-level rollup
//! that follows is serialized by `last_rollup_times`, so rollups for the same
//! level never interleave.

use super::capped::{Capped, CappedId, CappedStore};
use super::data_source::{Column, DataSource};
use super::transaction_type_dao::TransactionTypeDao;
use super::watermark;
use crate::config::{RollupConfig, StorageConfig};
use crate::error::{Result, StorageError};
use crate::merge::{merge_profile, MergeLimits, MutableAggregate, QueryCollector, ServiceCallCollector};
use crate::metrics;
use crate::query::{
    AggregateQuery, ErrorSummarySortOrder, OverallErrorSummary, OverallSummary,
    OverviewAggregate, Page, PercentileAggregate, SummaryQuery, SummarySortOrder,
    ThroughputAggregate, TransactionErrorSummary, TransactionSummary,
};
use crate::rollup::{rollup_capture_time, safe_rollup_time};
use rusqlite::types::ToSql;
use rusqlite::Row;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use trellis_shared::{
    Aggregate, DurationHistogram, Profile, Query, RootTimers, ServiceCall, ThreadStats,
    TransactionTypeAggregates,
};

const KIND: &str = "aggregate";

/// Columns shared by both tables, after the key columns. Row decoding and
/// insert binding follow this order.
const DATA_COLUMNS: &[Column] = &[
    Column::new("capture_time", "INTEGER NOT NULL"),
    Column::new("total_duration_nanos", "REAL NOT NULL"),
    Column::new("transaction_count", "INTEGER NOT NULL"),
    Column::new("error_count", "INTEGER NOT NULL"),
    Column::new("async_transactions", "INTEGER NOT NULL"),
    Column::new("queries_capped_id", "INTEGER"),
    Column::new("service_calls_capped_id", "INTEGER"),
    Column::new("main_thread_profile_capped_id", "INTEGER"),
    Column::new("aux_thread_profile_capped_id", "INTEGER"),
    Column::new("histogram_capped_id", "INTEGER"),
    Column::new("root_timers_capped_id", "INTEGER"),
    Column::new("main_thread_cpu_nanos", "REAL"),
    Column::new("main_thread_blocked_nanos", "REAL"),
    Column::new("main_thread_waited_nanos", "REAL"),
    Column::new("main_thread_allocated_bytes", "REAL"),
    Column::new("aux_thread_cpu_nanos", "REAL"),
    Column::new("aux_thread_blocked_nanos", "REAL"),
    Column::new("aux_thread_waited_nanos", "REAL"),
    Column::new("aux_thread_allocated_bytes", "REAL"),
];

const TRANSACTION_TYPE: Column = Column::new("transaction_type", "TEXT NOT NULL");
const TRANSACTION_NAME: Column = Column::new("transaction_name", "TEXT NOT NULL");

#[derive(Debug, Clone, Copy, Default)]
struct CappedRefs {
    queries: Option<CappedId>,
    service_calls: Option<CappedId>,
    main_thread_profile: Option<CappedId>,
    aux_thread_profile: Option<CappedId>,
    duration_histogram: Option<CappedId>,
    root_timers: Option<CappedId>,
}

#[derive(Debug, Clone)]
struct AggregateRow {
    transaction_type: String,
    transaction_name: Option<String>,
    capture_time: i64,
    total_duration_nanos: f64,
    transaction_count: u64,
    error_count: u64,
    async_transactions: bool,
    capped: CappedRefs,
    main_thread_stats: Option<ThreadStats>,
    aux_thread_stats: Option<ThreadStats>,
}

struct LevelTables {
    by_type: String,
    by_name: String,
    insert_by_type: String,
    insert_by_name: String,
    select_by_type: String,
    select_by_name: String,
}

impl LevelTables {
    fn new(level: usize) -> Self {
        let by_type = format!("aggregate_tt_rollup_{}", level);
        let by_name = format!("aggregate_tn_rollup_{}", level);
        let data: Vec<&str> = DATA_COLUMNS.iter().map(|c| c.name).collect();
        let data = data.join(", ");
        let placeholders = |n: usize| {
            (1..=n)
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        };
        Self {
            insert_by_type: format!(
                "INSERT OR REPLACE INTO {} (transaction_type, {}) VALUES ({})",
                by_type,
                data,
                placeholders(DATA_COLUMNS.len() + 1)
            ),
            insert_by_name: format!(
                "INSERT OR REPLACE INTO {} (transaction_type, transaction_name, {}) VALUES ({})",
                by_name,
                data,
                placeholders(DATA_COLUMNS.len() + 2)
            ),
            select_by_type: format!("SELECT transaction_type, {} FROM {}", data, by_type),
            select_by_name: format!(
                "SELECT transaction_type, transaction_name, {} FROM {}",
                data, by_name
            ),
            by_type,
            by_name,
        }
    }

    fn table(&self, named: bool) -> &str {
        if named {
            &self.by_name
        } else {
            &self.by_type
        }
    }

    fn select(&self, named: bool) -> &str {
        if named {
            &self.select_by_name
        } else {
            &self.select_by_type
        }
    }
}

pub struct AggregateDao {
    data_source: Arc<DataSource>,
    capped_stores: Vec<CappedStore>,
    transaction_types: Arc<TransactionTypeDao>,
    rollups: Vec<RollupConfig>,
    tables: Vec<LevelTables>,
    limits: MergeLimits,
    /// Index 0 is always 0; guards the whole multi-level rollup sequence
    last_rollup_times: Mutex<Vec<i64>>,
}

impl AggregateDao {
    /// `capped_stores[level]` holds the payloads of rollup level `level`.
    pub fn new(
        data_source: Arc<DataSource>,
        capped_stores: Vec<CappedStore>,
        transaction_types: Arc<TransactionTypeDao>,
        config: &StorageConfig,
    ) -> Result<Self> {
        let level_count = config.aggregate_level_count();
        if capped_stores.len() != level_count {
            return Err(StorageError::Config(format!(
                "{} capped stores for {} aggregate levels",
                capped_stores.len(),
                level_count
            )));
        }

        let tables: Vec<LevelTables> = (0..level_count).map(LevelTables::new).collect();
        for t in &tables {
            let mut by_type = vec![TRANSACTION_TYPE];
            by_type.extend_from_slice(DATA_COLUMNS);
            data_source.sync_table(&t.by_type, &by_type)?;
            data_source.sync_index(
                &t.by_type,
                &format!("{}_idx", t.by_type),
                &["transaction_type", "capture_time"],
                true,
            )?;

            let mut by_name = vec![TRANSACTION_TYPE, TRANSACTION_NAME];
            by_name.extend_from_slice(DATA_COLUMNS);
            data_source.sync_table(&t.by_name, &by_name)?;
            data_source.sync_index(
                &t.by_name,
                &format!("{}_idx", t.by_name),
                &["transaction_type", "transaction_name", "capture_time"],
                true,
            )?;
        }

        watermark::sync_schema(&data_source)?;
        let by_type_tables: Vec<String> = tables.iter().map(|t| t.by_type.clone()).collect();
        let last_rollup_times =
            watermark::initial_last_rollup_times(&data_source, KIND, &by_type_tables)?;
        tracing::info!(levels = level_count, ?last_rollup_times, "Aggregate storage ready");

        Ok(Self {
            data_source,
            capped_stores,
            transaction_types,
            rollups: config.aggregate_rollups.clone(),
            tables,
            limits: MergeLimits::new(config.max_queries_per_type, config.max_service_calls_per_type),
            last_rollup_times: Mutex::new(last_rollup_times),
        })
    }

    pub fn level_count(&self) -> usize {
        self.tables.len()
    }

    pub fn last_rollup_times(&self) -> Result<Vec<i64>> {
        Ok(self.last_rollup_times.lock()?.clone())
    }

    /// Newest rollup time written at `level`. Rows of finer levels captured
    /// after it are not part of `level` yet.
    pub fn last_rollup_time(&self, level: usize) -> Result<i64> {
        self.last_rollup_times
            .lock()?
            .get(level)
            .copied()
            .ok_or_else(|| level_out_of_range(level))
    }

    pub fn capped_store(&self, level: usize) -> Result<&CappedStore> {
        self.capped_stores.get(level).ok_or_else(|| level_out_of_range(level))
    }

    /// Persist one flush of raw aggregates at level 0, then roll up every
    /// level whose window has closed. An empty batch only rolls up.
    pub fn store(&self, capture_time: i64, aggregates: &[TransactionTypeAggregates]) -> Result<()> {
        if self.data_source.is_closing() {
            return Ok(());
        }
        for group in aggregates {
            self.insert_row(0, &group.transaction_type, None, capture_time, &group.overall)?;
            for tx in &group.transactions {
                self.insert_row(
                    0,
                    &group.transaction_type,
                    Some(tx.transaction_name.as_str()),
                    capture_time,
                    &tx.aggregate,
                )?;
            }
            self.transaction_types
                .update_last_capture_time(&group.transaction_type, capture_time)?;
        }
        metrics::AGGREGATE_GROUPS_STORED.inc_by(aggregates.len() as f64);
        self.rollup(capture_time)
    }

    /// Roll up levels 1..N, lowest first, up to the safe rollup time of
    /// `capture_time` at each level.
    pub fn rollup(&self, capture_time: i64) -> Result<()> {
        if self.data_source.is_closing() {
            return Ok(());
        }
        let start = Instant::now();
        let mut last_rollup_times = self.last_rollup_times.lock()?;
        for level in 1..self.tables.len() {
            let interval = self.rollups[level].interval_millis;
            let safe_time = safe_rollup_time(capture_time, interval);
            let last = last_rollup_times[level];
            if safe_time <= last {
                continue;
            }
            let source_times: Vec<i64> = self.data_source.query(
                &format!(
                    "SELECT DISTINCT capture_time FROM {} WHERE capture_time > ?1 AND capture_time <= ?2",
                    self.tables[level - 1].by_type
                ),
                [last, safe_time],
                |row| row.get(0),
            )?;
            let rollup_times: BTreeSet<i64> = source_times
                .into_iter()
                .map(|t| rollup_capture_time(t, interval))
                .collect();
            for rollup_time in rollup_times {
                self.rollup_one(level, rollup_time, interval)?;
            }
            last_rollup_times[level] = safe_time;
            watermark::write(&self.data_source, KIND, level, safe_time)?;
        }
        metrics::ROLLUP_DURATION
            .with_label_values(&[KIND])
            .observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn rollup_one(&self, level: usize, rollup_time: i64, interval: i64) -> Result<()> {
        let source = level - 1;
        let from = rollup_time - interval;

        let rows = self.read_window_rows(source, false, from, rollup_time)?;
        let mut by_type: BTreeMap<String, MutableAggregate> = BTreeMap::new();
        for row in &rows {
            let acc = by_type
                .entry(row.transaction_type.clone())
                .or_insert_with(|| MutableAggregate::new(self.limits));
            self.merge_row(source, row, acc)?;
        }
        let group_count = by_type.len();
        for (transaction_type, acc) in by_type {
            self.insert_row(level, &transaction_type, None, rollup_time, &acc.to_aggregate())?;
            self.transaction_types
                .update_last_capture_time(&transaction_type, rollup_time)?;
        }

        let rows = self.read_window_rows(source, true, from, rollup_time)?;
        let mut by_name: BTreeMap<(String, String), MutableAggregate> = BTreeMap::new();
        for row in &rows {
            let key = (
                row.transaction_type.clone(),
                row.transaction_name.clone().unwrap_or_default(),
            );
            let acc = by_name
                .entry(key)
                .or_insert_with(|| MutableAggregate::new(self.limits));
            self.merge_row(source, row, acc)?;
        }
        for ((transaction_type, transaction_name), acc) in by_name {
            self.insert_row(
                level,
                &transaction_type,
                Some(transaction_name.as_str()),
                rollup_time,
                &acc.to_aggregate(),
            )?;
        }

        metrics::ROLLUPS_TOTAL
            .with_label_values(&[KIND, &level.to_string()])
            .inc();
        tracing::debug!(level, rollup_time, groups = group_count, "Rolled up aggregates");
        Ok(())
    }

    /// Rows captured in `(from, to]`. Returned rows hold capped ids only; the
    /// database lock is released before any payload is read.
    fn read_window_rows(&self, level: usize, named: bool, from: i64, to: i64) -> Result<Vec<AggregateRow>> {
        let tables = self.tables(level)?;
        self.data_source.query(
            &format!(
                "{} WHERE capture_time > ?1 AND capture_time <= ?2",
                tables.select(named)
            ),
            [from, to],
            |row| read_row(row, named),
        )
    }

    fn merge_row(&self, level: usize, row: &AggregateRow, target: &mut MutableAggregate) -> Result<()> {
        target.add_counts(
            row.total_duration_nanos,
            row.transaction_count,
            row.error_count,
            row.async_transactions,
        );
        target.merge_main_thread_stats(row.main_thread_stats);
        target.merge_aux_thread_stats(row.aux_thread_stats);

        let store = self.capped_store(level)?;
        if let Capped::Valid(timers) = store.read_optional::<RootTimers>(row.capped.root_timers)? {
            target.merge_root_timers(&timers);
        }
        if let Capped::Valid(histogram) =
            store.read_optional::<DurationHistogram>(row.capped.duration_histogram)?
        {
            target.merge_histogram(&histogram)?;
        }
        if let Capped::Valid(queries) = store.read_optional_list::<Query>(row.capped.queries)? {
            target.merge_queries(&queries);
        }
        if let Capped::Valid(calls) =
            store.read_optional_list::<ServiceCall>(row.capped.service_calls)?
        {
            target.merge_service_calls(&calls);
        }
        if let Capped::Valid(profile) =
            store.read_optional::<Profile>(row.capped.main_thread_profile)?
        {
            target.merge_main_thread_profile(Some(&profile));
        }
        if let Capped::Valid(profile) =
            store.read_optional::<Profile>(row.capped.aux_thread_profile)?
        {
            target.merge_aux_thread_profile(Some(&profile));
        }
        Ok(())
    }

    fn insert_row(
        &self,
        level: usize,
        transaction_type: &str,
        transaction_name: Option<&str>,
        capture_time: i64,
        aggregate: &Aggregate,
    ) -> Result<()> {
        let capped = self.write_capped(level, aggregate)?;
        let tables = self.tables(level)?;

        let transaction_count = aggregate.transaction_count as i64;
        let error_count = aggregate.error_count as i64;
        let main = thread_stats_columns(aggregate.main_thread_stats);
        let aux = thread_stats_columns(aggregate.aux_thread_stats);
        let capped_ids = [
            capped.queries.map(|id| id.0),
            capped.service_calls.map(|id| id.0),
            capped.main_thread_profile.map(|id| id.0),
            capped.aux_thread_profile.map(|id| id.0),
            capped.duration_histogram.map(|id| id.0),
            capped.root_timers.map(|id| id.0),
        ];

        let mut values: Vec<&dyn ToSql> = vec![&transaction_type as &dyn ToSql];
        if let Some(name) = &transaction_name {
            values.push(name);
        }
        values.push(&capture_time);
        values.push(&aggregate.total_duration_nanos);
        values.push(&transaction_count);
        values.push(&error_count);
        values.push(&aggregate.async_transactions);
        values.extend(capped_ids.iter().map(|id| id as &dyn ToSql));
        values.extend(main.iter().map(|v| v as &dyn ToSql));
        values.extend(aux.iter().map(|v| v as &dyn ToSql));

        let sql = if transaction_name.is_some() {
            &tables.insert_by_name
        } else {
            &tables.insert_by_type
        };
        self.data_source.execute(sql, values.as_slice())?;
        Ok(())
    }

    fn write_capped(&self, level: usize, aggregate: &Aggregate) -> Result<CappedRefs> {
        let store = self.capped_store(level)?;
        let root_timers = aggregate.root_timers();
        Ok(CappedRefs {
            queries: non_empty(&aggregate.queries)
                .map(|q| store.write_messages(q))
                .transpose()?,
            service_calls: non_empty(&aggregate.service_calls)
                .map(|s| store.write_messages(s))
                .transpose()?,
            main_thread_profile: aggregate
                .main_thread_profile
                .as_ref()
                .filter(|p| !p.is_empty())
                .map(|p| store.write_message(p))
                .transpose()?,
            aux_thread_profile: aggregate
                .aux_thread_profile
                .as_ref()
                .filter(|p| !p.is_empty())
                .map(|p| store.write_message(p))
                .transpose()?,
            duration_histogram: Some(&aggregate.duration_histogram)
                .filter(|h| !h.is_empty())
                .map(|h| store.write_message(h))
                .transpose()?,
            root_timers: Some(&root_timers)
                .filter(|t| !t.is_empty())
                .map(|t| store.write_message(t))
                .transpose()?,
        })
    }

    fn tables(&self, level: usize) -> Result<&LevelTables> {
        self.tables.get(level).ok_or_else(|| level_out_of_range(level))
    }

    // ── Summary queries: (from, to] ──────────────────────────────────────────

    /// Closing sentinel: an empty summary.
    pub fn read_overall_summary(&self, query: &SummaryQuery) -> Result<OverallSummary> {
        if self.data_source.is_closing() {
            return Ok(OverallSummary::default());
        }
        let tables = self.tables(query.rollup_level)?;
        self.data_source.query_single(
            &format!(
                "SELECT sum(total_duration_nanos), sum(transaction_count), max(capture_time) FROM {} \
                 WHERE transaction_type = ?1 AND capture_time > ?2 AND capture_time <= ?3",
                tables.by_type
            ),
            rusqlite::params![query.transaction_type, query.from, query.to],
            |row| {
                Ok(OverallSummary {
                    total_duration_nanos: row.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
                    transaction_count: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    last_capture_time: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                })
            },
        )
    }

    /// Closing sentinel: an empty page.
    pub fn read_transaction_summaries(
        &self,
        query: &SummaryQuery,
        sort_order: SummarySortOrder,
        limit: usize,
    ) -> Result<Page<TransactionSummary>> {
        if self.data_source.is_closing() {
            return Ok(Page::default());
        }
        let tables = self.tables(query.rollup_level)?;
        let records = self.data_source.query(
            &format!(
                "SELECT transaction_name, sum(total_duration_nanos), sum(transaction_count) FROM {} \
                 WHERE transaction_type = ?1 AND capture_time > ?2 AND capture_time <= ?3 \
                 GROUP BY transaction_name ORDER BY {}, transaction_name LIMIT ?4",
                tables.by_name,
                sort_order.order_by()
            ),
            rusqlite::params![
                query.transaction_type,
                query.from,
                query.to,
                overfetch_limit(limit)
            ],
            |row| {
                Ok(TransactionSummary {
                    transaction_name: row.get(0)?,
                    total_duration_nanos: row.get(1)?,
                    transaction_count: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(Page::from_overfetched(records, limit))
    }

    /// Closing sentinel: an empty summary.
    pub fn read_overall_error_summary(&self, query: &SummaryQuery) -> Result<OverallErrorSummary> {
        if self.data_source.is_closing() {
            return Ok(OverallErrorSummary::default());
        }
        let tables = self.tables(query.rollup_level)?;
        self.data_source.query_single(
            &format!(
                "SELECT sum(error_count), sum(transaction_count), max(capture_time) FROM {} \
                 WHERE transaction_type = ?1 AND capture_time > ?2 AND capture_time <= ?3",
                tables.by_type
            ),
            rusqlite::params![query.transaction_type, query.from, query.to],
            |row| {
                Ok(OverallErrorSummary {
                    error_count: row.get::<_, Option<i64>>(0)?.unwrap_or(0) as u64,
                    transaction_count: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    last_capture_time: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                })
            },
        )
    }

    /// Only transaction names with at least one error. Closing sentinel: an
    /// empty page.
    pub fn read_transaction_error_summaries(
        &self,
        query: &SummaryQuery,
        sort_order: ErrorSummarySortOrder,
        limit: usize,
    ) -> Result<Page<TransactionErrorSummary>> {
        if self.data_source.is_closing() {
            return Ok(Page::default());
        }
        let tables = self.tables(query.rollup_level)?;
        let records = self.data_source.query(
            &format!(
                "SELECT transaction_name, sum(error_count), sum(transaction_count) FROM {} \
                 WHERE transaction_type = ?1 AND capture_time > ?2 AND capture_time <= ?3 \
                 GROUP BY transaction_name HAVING sum(error_count) > 0 \
                 ORDER BY {}, transaction_name LIMIT ?4",
                tables.by_name,
                sort_order.order_by()
            ),
            rusqlite::params![
                query.transaction_type,
                query.from,
                query.to,
                overfetch_limit(limit)
            ],
            |row| {
                Ok(TransactionErrorSummary {
                    transaction_name: row.get(0)?,
                    error_count: row.get::<_, i64>(1)? as u64,
                    transaction_count: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(Page::from_overfetched(records, limit))
    }

    // ── Point-series queries: [from, to] ────────────────────────────────────

    /// Closing sentinel: empty list.
    pub fn read_overview_aggregates(&self, query: &AggregateQuery) -> Result<Vec<OverviewAggregate>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        let rows = self.read_series_rows(query)?;
        let store = self.capped_store(query.rollup_level)?;
        rows.into_iter()
            .map(|row| {
                let root_timers = store
                    .read_optional::<RootTimers>(row.capped.root_timers)?
                    .into_option()
                    .unwrap_or_default();
                Ok(OverviewAggregate {
                    capture_time: row.capture_time,
                    total_duration_nanos: row.total_duration_nanos,
                    transaction_count: row.transaction_count,
                    async_transactions: row.async_transactions,
                    root_timers,
                    main_thread_stats: row.main_thread_stats,
                    aux_thread_stats: row.aux_thread_stats,
                })
            })
            .collect()
    }

    /// Closing sentinel: empty list.
    pub fn read_percentile_aggregates(
        &self,
        query: &AggregateQuery,
    ) -> Result<Vec<PercentileAggregate>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        let rows = self.read_series_rows(query)?;
        let store = self.capped_store(query.rollup_level)?;
        rows.into_iter()
            .map(|row| {
                let duration_histogram = store
                    .read_optional::<DurationHistogram>(row.capped.duration_histogram)?
                    .into_option()
                    .unwrap_or_default();
                Ok(PercentileAggregate {
                    capture_time: row.capture_time,
                    total_duration_nanos: row.total_duration_nanos,
                    transaction_count: row.transaction_count,
                    duration_histogram,
                })
            })
            .collect()
    }

    /// Closing sentinel: empty list.
    pub fn read_throughput_aggregates(
        &self,
        query: &AggregateQuery,
    ) -> Result<Vec<ThroughputAggregate>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        Ok(self
            .read_series_rows(query)?
            .into_iter()
            .map(|row| ThroughputAggregate {
                capture_time: row.capture_time,
                transaction_count: row.transaction_count,
            })
            .collect())
    }

    /// Full aggregates in `[from, to]`, one per row, with every payload still
    /// in the capped store merged in.
    ///
    /// Closing sentinel: empty list.
    pub fn read_aggregates(&self, query: &AggregateQuery) -> Result<Vec<(i64, Aggregate)>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        self.read_series_rows(query)?
            .iter()
            .map(|row| {
                let mut aggregate = MutableAggregate::new(self.limits);
                self.merge_row(query.rollup_level, row, &mut aggregate)?;
                Ok((row.capture_time, aggregate.to_aggregate()))
            })
            .collect()
    }

    fn read_series_rows(&self, query: &AggregateQuery) -> Result<Vec<AggregateRow>> {
        let tables = self.tables(query.rollup_level)?;
        let named = query.transaction_name.is_some();
        let sql = format!(
            "{} WHERE transaction_type = ?1 AND capture_time >= ?2 AND capture_time <= ?3{} \
             ORDER BY capture_time",
            tables.select(named),
            if named { " AND transaction_name = ?4" } else { "" }
        );
        let mut values: Vec<&dyn ToSql> =
            vec![&query.transaction_type as &dyn ToSql, &query.from, &query.to];
        if let Some(name) = &query.transaction_name {
            values.push(name);
        }
        self.data_source
            .query(&sql, values.as_slice(), |row| read_row(row, named))
    }

    // ── Detail merges: (from, to] ────────────────────────────────────────────

    pub fn merge_in_queries(&self, query: &AggregateQuery, collector: &mut QueryCollector) -> Result<()> {
        let store = self.capped_store(query.rollup_level)?;
        for id in self.read_capped_ids(query, "queries_capped_id")? {
            if let Capped::Valid(queries) = store.read_messages::<Query>(id)? {
                collector.merge(&queries);
            }
        }
        Ok(())
    }

    pub fn merge_in_service_calls(
        &self,
        query: &AggregateQuery,
        collector: &mut ServiceCallCollector,
    ) -> Result<()> {
        let store = self.capped_store(query.rollup_level)?;
        for id in self.read_capped_ids(query, "service_calls_capped_id")? {
            if let Capped::Valid(calls) = store.read_messages::<ServiceCall>(id)? {
                collector.merge(&calls);
            }
        }
        Ok(())
    }

    pub fn merge_in_main_thread_profiles(&self, query: &AggregateQuery, profile: &mut Profile) -> Result<()> {
        self.merge_in_profiles(query, "main_thread_profile_capped_id", profile)
    }

    pub fn merge_in_aux_thread_profiles(&self, query: &AggregateQuery, profile: &mut Profile) -> Result<()> {
        self.merge_in_profiles(query, "aux_thread_profile_capped_id", profile)
    }

    fn merge_in_profiles(&self, query: &AggregateQuery, column: &str, profile: &mut Profile) -> Result<()> {
        let store = self.capped_store(query.rollup_level)?;
        for id in self.read_capped_ids(query, column)? {
            if let Capped::Valid(source) = store.read_message::<Profile>(id)? {
                merge_profile(profile, &source);
            }
        }
        Ok(())
    }

    /// Phase one of a detail merge: collect ids under the database lock.
    /// Callers deserialize after the lock is released. Closing sentinel:
    /// no ids, so nothing is merged.
    fn read_capped_ids(&self, query: &AggregateQuery, column: &str) -> Result<Vec<CappedId>> {
        if self.data_source.is_closing() {
            return Ok(Vec::new());
        }
        let tables = self.tables(query.rollup_level)?;
        let named = query.transaction_name.is_some();
        let sql = format!(
            "SELECT {column} FROM {} WHERE transaction_type = ?1 \
             AND capture_time > ?2 AND capture_time <= ?3{} AND {column} IS NOT NULL \
             ORDER BY capture_time",
            tables.table(named),
            if named { " AND transaction_name = ?4" } else { "" },
            column = column
        );
        let mut values: Vec<&dyn ToSql> =
            vec![&query.transaction_type as &dyn ToSql, &query.from, &query.to];
        if let Some(name) = &query.transaction_name {
            values.push(name);
        }
        self.data_source
            .query(&sql, values.as_slice(), |row| Ok(CappedId(row.get(0)?)))
    }

    /// Delete both tables' rows at `level` captured before `capture_time`.
    /// Capped payloads expire on their own as the ring wraps.
    pub fn delete_before(&self, level: usize, capture_time: i64) -> Result<usize> {
        if self.data_source.is_closing() {
            return Ok(0);
        }
        let tables = self.tables(level)?;
        let by_type = self.data_source.delete_before(&tables.by_type, capture_time)?;
        let by_name = self.data_source.delete_before(&tables.by_name, capture_time)?;
        Ok(by_type + by_name)
    }
}

fn level_out_of_range(level: usize) -> StorageError {
    StorageError::Invariant(format!("rollup level {} out of range", level))
}

fn overfetch_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX - 1).saturating_add(1)
}

fn non_empty<T>(items: &[T]) -> Option<&[T]> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn thread_stats_columns(stats: Option<ThreadStats>) -> [Option<f64>; 4] {
    match stats {
        Some(s) => [
            Some(s.cpu_nanos),
            Some(s.blocked_nanos),
            Some(s.waited_nanos),
            Some(s.allocated_bytes),
        ],
        None => [None; 4],
    }
}

fn read_capped(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<CappedId>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(CappedId))
}

fn read_thread_stats(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<ThreadStats>> {
    let cpu_nanos: Option<f64> = row.get(idx)?;
    Ok(match cpu_nanos {
        Some(cpu_nanos) => Some(ThreadStats {
            cpu_nanos,
            blocked_nanos: row.get(idx + 1)?,
            waited_nanos: row.get(idx + 2)?,
            allocated_bytes: row.get(idx + 3)?,
        }),
        None => None,
    })
}

fn read_row(row: &Row<'_>, named: bool) -> rusqlite::Result<AggregateRow> {
    let transaction_type: String = row.get(0)?;
    let (transaction_name, i) = if named {
        (Some(row.get::<_, String>(1)?), 2)
    } else {
        (None, 1)
    };
    Ok(AggregateRow {
        transaction_type,
        transaction_name,
        capture_time: row.get(i)?,
        total_duration_nanos: row.get(i + 1)?,
        transaction_count: row.get::<_, i64>(i + 2)? as u64,
        error_count: row.get::<_, i64>(i + 3)? as u64,
        async_transactions: row.get(i + 4)?,
        capped: CappedRefs {
            queries: read_capped(row, i + 5)?,
            service_calls: read_capped(row, i + 6)?,
            main_thread_profile: read_capped(row, i + 7)?,
            aux_thread_profile: read_capped(row, i + 8)?,
            duration_histogram: read_capped(row, i + 9)?,
            root_timers: read_capped(row, i + 10)?,
        },
        main_thread_stats: read_thread_stats(row, i + 11)?,
        aux_thread_stats: read_thread_stats(row, i + 15)?,
    })
}
