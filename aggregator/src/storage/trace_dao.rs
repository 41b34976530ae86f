//! Trace storage
//!
//! Header fields live in the `trace` table, attributes in `trace_attribute`,
//! and entries and profiles in the trace capped store.

use super::capped::{Capped, CappedId, CappedStore};
use super::data_source::{Column, DataSource};
use super::trace_attribute_name_dao::TraceAttributeNameDao;
use crate::error::Result;
use crate::metrics;
use crate::query::{Page, TracePoint, TracePointQuery};
use rusqlite::params;
use rusqlite::types::ToSql;
use std::sync::Arc;
use trellis_shared::{Profile, Trace, TraceAttribute, TraceEntry, TraceHeader};

const TRACE_COLUMNS: &[Column] = &[
    Column::new("id", "TEXT NOT NULL"),
    Column::new("transaction_type", "TEXT NOT NULL"),
    Column::new("transaction_name", "TEXT NOT NULL"),
    Column::new("capture_time", "INTEGER NOT NULL"),
    Column::new("start_time", "INTEGER NOT NULL"),
    Column::new("duration_nanos", "INTEGER NOT NULL"),
    Column::new("partial", "INTEGER NOT NULL"),
    Column::new("slow", "INTEGER NOT NULL"),
    Column::new("error", "INTEGER NOT NULL"),
    Column::new("error_message", "TEXT"),
    Column::new("headline", "TEXT NOT NULL"),
    Column::new("user_name", "TEXT"),
    Column::new("entry_count", "INTEGER NOT NULL"),
    Column::new("entries_capped_id", "INTEGER"),
    Column::new("main_thread_profile_capped_id", "INTEGER"),
    Column::new("aux_thread_profile_capped_id", "INTEGER"),
];

const ATTRIBUTE_COLUMNS: &[Column] = &[
    Column::new("trace_id", "TEXT NOT NULL"),
    Column::new("name", "TEXT NOT NULL"),
    Column::new("value", "TEXT NOT NULL"),
    Column::new("capture_time", "INTEGER NOT NULL"),
];

pub struct TraceDao {
    data_source: Arc<DataSource>,
    capped: CappedStore,
    attribute_names: Arc<TraceAttributeNameDao>,
}

impl TraceDao {
    pub fn new(
        data_source: Arc<DataSource>,
        capped: CappedStore,
        attribute_names: Arc<TraceAttributeNameDao>,
    ) -> Result<Self> {
        data_source.sync_table("trace", TRACE_COLUMNS)?;
        data_source.sync_index("trace", "trace_id_idx", &["id"], true)?;
        data_source.sync_index(
            "trace",
            "trace_type_time_idx",
            &["transaction_type", "capture_time"],
            false,
        )?;
        data_source.sync_table("trace_attribute", ATTRIBUTE_COLUMNS)?;
        data_source.sync_index("trace_attribute", "trace_attribute_idx", &["trace_id"], false)?;
        Ok(Self {
            data_source,
            capped,
            attribute_names,
        })
    }

    /// Store a trace. A later version of the same trace id replaces the
    /// earlier one, except that a partial trace never replaces a complete one.
    pub fn store(&self, trace: &Trace) -> Result<()> {
        if self.data_source.is_closing() {
            return Ok(());
        }
        let existing_partial: Option<bool> = self.data_source.query_optional(
            "SELECT partial FROM trace WHERE id = ?1",
            [&trace.id],
            |row| row.get(0),
        )?;
        if existing_partial == Some(false) && trace.header.partial {
            tracing::debug!(trace_id = %trace.id, "Ignoring partial trace, complete trace already stored");
            return Ok(());
        }

        let entries = if trace.entries.is_empty() {
            None
        } else {
            Some(self.capped.write_messages(&trace.entries)?)
        };
        let main_profile = self.write_profile(trace.main_thread_profile.as_ref())?;
        let aux_profile = self.write_profile(trace.aux_thread_profile.as_ref())?;

        let header = &trace.header;
        self.data_source.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO trace (id, transaction_type, transaction_name, capture_time, \
                 start_time, duration_nanos, partial, slow, error, error_message, headline, user_name, \
                 entry_count, entries_capped_id, main_thread_profile_capped_id, \
                 aux_thread_profile_capped_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    trace.id,
                    header.transaction_type,
                    header.transaction_name,
                    header.capture_time,
                    header.start_time,
                    header.duration_nanos,
                    header.partial,
                    header.slow,
                    header.is_error(),
                    header.error_message,
                    header.headline,
                    header.user,
                    header.entry_count as i64,
                    entries.map(|id| id.0),
                    main_profile.map(|id| id.0),
                    aux_profile.map(|id| id.0),
                ],
            )?;
            tx.execute("DELETE FROM trace_attribute WHERE trace_id = ?1", [&trace.id])?;
            for attribute in &header.attributes {
                for value in &attribute.values {
                    tx.execute(
                        "INSERT INTO trace_attribute (trace_id, name, value, capture_time) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![trace.id, attribute.name, value, header.capture_time],
                    )?;
                }
            }
            Ok(())
        })?;

        for attribute in &header.attributes {
            self.attribute_names.update_last_capture_time(
                &header.transaction_type,
                &attribute.name,
                header.capture_time,
            )?;
        }
        metrics::TRACES_STORED.inc();
        Ok(())
    }

    fn write_profile(&self, profile: Option<&Profile>) -> Result<Option<CappedId>> {
        profile
            .filter(|p| !p.is_empty())
            .map(|p| self.capped.write_message(p))
            .transpose()
    }

    /// `None` for an unknown trace or while closing.
    pub fn read_header(&self, trace_id: &str) -> Result<Option<TraceHeader>> {
        if self.data_source.is_closing() {
            return Ok(None);
        }
        let header = self.data_source.query_optional(
            "SELECT partial, slow, start_time, capture_time, duration_nanos, transaction_type, \
             transaction_name, headline, user_name, error_message, entry_count FROM trace WHERE id = ?1",
            [trace_id],
            |row| {
                Ok(TraceHeader {
                    partial: row.get(0)?,
                    slow: row.get(1)?,
                    start_time: row.get(2)?,
                    capture_time: row.get(3)?,
                    duration_nanos: row.get(4)?,
                    transaction_type: row.get(5)?,
                    transaction_name: row.get(6)?,
                    headline: row.get(7)?,
                    user: row.get(8)?,
                    error_message: row.get(9)?,
                    attributes: Vec::new(),
                    entry_count: row.get::<_, i64>(10)? as u64,
                })
            },
        )?;
        let Some(mut header) = header else {
            return Ok(None);
        };

        let values: Vec<(String, String)> = self.data_source.query(
            "SELECT name, value FROM trace_attribute WHERE trace_id = ?1 ORDER BY rowid",
            [trace_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        for (name, value) in values {
            match header.attributes.iter_mut().find(|a| a.name == name) {
                Some(attribute) => attribute.values.push(value),
                None => header.attributes.push(TraceAttribute {
                    name,
                    values: vec![value],
                }),
            }
        }
        Ok(Some(header))
    }

    pub fn read_entries(&self, trace_id: &str) -> Result<Capped<Vec<TraceEntry>>> {
        match self.read_capped_id(trace_id, "entries_capped_id")? {
            Some(id) => self.capped.read_messages(id),
            None => Ok(Capped::Absent),
        }
    }

    pub fn read_main_thread_profile(&self, trace_id: &str) -> Result<Capped<Profile>> {
        let id = self.read_capped_id(trace_id, "main_thread_profile_capped_id")?;
        self.capped.read_optional(id)
    }

    pub fn read_aux_thread_profile(&self, trace_id: &str) -> Result<Capped<Profile>> {
        let id = self.read_capped_id(trace_id, "aux_thread_profile_capped_id")?;
        self.capped.read_optional(id)
    }

    fn read_capped_id(&self, trace_id: &str, column: &str) -> Result<Option<CappedId>> {
        if self.data_source.is_closing() {
            return Ok(None);
        }
        let id: Option<Option<i64>> = self.data_source.query_optional(
            &format!("SELECT {} FROM trace WHERE id = ?1", column),
            [trace_id],
            |row| row.get(0),
        )?;
        Ok(id.flatten().map(CappedId))
    }

    /// Slow traces in `[from, to]`, slowest first.
    pub fn read_slow_points(&self, query: &TracePointQuery) -> Result<Page<TracePoint>> {
        self.read_points(query, "slow = 1")
    }

    /// Failed traces in `[from, to]`, slowest first.
    pub fn read_error_points(&self, query: &TracePointQuery) -> Result<Page<TracePoint>> {
        self.read_points(query, "error = 1")
    }

    fn read_points(&self, query: &TracePointQuery, filter: &str) -> Result<Page<TracePoint>> {
        if self.data_source.is_closing() {
            return Ok(Page::default());
        }
        let sql = format!(
            "SELECT id, capture_time, duration_nanos, partial, error FROM trace \
             WHERE transaction_type = ?1 AND capture_time >= ?2 AND capture_time <= ?3 AND {}{} \
             ORDER BY duration_nanos DESC, id LIMIT ?4",
            filter,
            if query.transaction_name.is_some() {
                " AND transaction_name = ?5"
            } else {
                ""
            }
        );
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX - 1).saturating_add(1);
        let mut values: Vec<&dyn ToSql> =
            vec![&query.transaction_type as &dyn ToSql, &query.from, &query.to, &limit];
        if let Some(name) = &query.transaction_name {
            values.push(name);
        }
        let records = self.data_source.query(&sql, values.as_slice(), |row| {
            Ok(TracePoint {
                trace_id: row.get(0)?,
                capture_time: row.get(1)?,
                duration_nanos: row.get(2)?,
                partial: row.get(3)?,
                error: row.get(4)?,
            })
        })?;
        Ok(Page::from_overfetched(records, query.limit))
    }

    pub fn read_trace_attribute_names(&self, transaction_type: &str) -> Result<Vec<String>> {
        self.attribute_names.read_trace_attribute_names(transaction_type)
    }

    pub fn delete_before(&self, capture_time: i64) -> Result<usize> {
        if self.data_source.is_closing() {
            return Ok(0);
        }
        let traces = self.data_source.delete_before("trace", capture_time)?;
        let attributes = self.data_source.delete_before("trace_attribute", capture_time)?;
        Ok(traces + attributes)
    }
}
