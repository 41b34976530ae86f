//! Capped per-type detail tables (queries and service calls)
//!
//! Entries are keyed by (type, text). Each type keeps at most `limit` distinct
//! entries; the lowest-total-duration entries are folded into a per-type
//! limit-exceeded bucket so total counts never shrink.

use std::collections::{BTreeMap, HashMap};
use trellis_shared::{Query, ServiceCall};

/// Text of the synthetic entry holding everything evicted from a type.
pub const LIMIT_EXCEEDED_BUCKET: &str = "LIMIT EXCEEDED BUCKET";

/// Multiple of `limit` a type may grow to before it is truncated mid-merge.
const HARD_LIMIT_MULTIPLIER: usize = 10;

/// An entry of a capped detail table.
pub trait DetailEntry: Clone {
    fn entry_type(&self) -> &str;
    fn text(&self) -> &str;
    fn total_duration_nanos(&self) -> f64;
    fn merge_from(&mut self, other: &Self);
    fn empty_bucket(entry_type: &str) -> Self;
}

impl DetailEntry for Query {
    fn entry_type(&self) -> &str {
        &self.query_type
    }

    fn text(&self) -> &str {
        &self.truncated_text
    }

    fn total_duration_nanos(&self) -> f64 {
        self.total_duration_nanos
    }

    fn merge_from(&mut self, other: &Self) {
        self.total_duration_nanos += other.total_duration_nanos;
        self.execution_count += other.execution_count;
        self.total_rows = match (self.total_rows, other.total_rows) {
            (Some(a), Some(b)) => Some(a + b),
            _ => None,
        };
        self.active |= other.active;
    }

    fn empty_bucket(entry_type: &str) -> Self {
        let mut bucket = Query::new(entry_type, LIMIT_EXCEEDED_BUCKET, 0.0, 0);
        bucket.total_rows = Some(0);
        bucket
    }
}

impl DetailEntry for ServiceCall {
    fn entry_type(&self) -> &str {
        &self.service_call_type
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn total_duration_nanos(&self) -> f64 {
        self.total_duration_nanos
    }

    fn merge_from(&mut self, other: &Self) {
        self.total_duration_nanos += other.total_duration_nanos;
        self.execution_count += other.execution_count;
    }

    fn empty_bucket(entry_type: &str) -> Self {
        ServiceCall::new(entry_type, LIMIT_EXCEEDED_BUCKET, 0.0, 0)
    }
}

#[derive(Debug, Clone)]
struct TypeEntries<T> {
    entries: HashMap<String, T>,
    bucket: Option<T>,
}

impl<T> Default for TypeEntries<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetailCollector<T> {
    limit: usize,
    by_type: BTreeMap<String, TypeEntries<T>>,
}

pub type QueryCollector = DetailCollector<Query>;
pub type ServiceCallCollector = DetailCollector<ServiceCall>;

impl<T: DetailEntry> DetailCollector<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            by_type: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn merge(&mut self, entries: &[T]) {
        for entry in entries {
            self.merge_entry(entry);
        }
    }

    pub fn merge_entry(&mut self, entry: &T) {
        let hard_limit = self.limit * HARD_LIMIT_MULTIPLIER;
        let type_entries = self.by_type.entry(entry.entry_type().to_string()).or_default();
        if entry.text() == LIMIT_EXCEEDED_BUCKET {
            type_entries
                .bucket
                .get_or_insert_with(|| T::empty_bucket(entry.entry_type()))
                .merge_from(entry);
            return;
        }
        match type_entries.entries.get_mut(entry.text()) {
            Some(existing) => existing.merge_from(entry),
            None => {
                type_entries
                    .entries
                    .insert(entry.text().to_string(), entry.clone());
            }
        }
        if type_entries.entries.len() > hard_limit {
            truncate(type_entries, self.limit, entry.entry_type());
        }
    }

    /// Finish: at most `limit` entries per type (plus the bucket when
    /// anything was evicted), types in name order, entries by descending
    /// total duration.
    pub fn into_entries(self) -> Vec<T> {
        let limit = self.limit;
        let mut out = Vec::new();
        for (entry_type, mut type_entries) in self.by_type {
            truncate(&mut type_entries, limit, &entry_type);
            let mut entries: Vec<T> = type_entries.entries.into_values().collect();
            sort_by_duration(&mut entries);
            out.extend(entries);
            out.extend(type_entries.bucket);
        }
        out
    }
}

fn sort_by_duration<T: DetailEntry>(entries: &mut [T]) {
    entries.sort_by(|a, b| {
        b.total_duration_nanos()
            .total_cmp(&a.total_duration_nanos())
            .then_with(|| a.text().cmp(b.text()))
    });
}

fn truncate<T: DetailEntry>(type_entries: &mut TypeEntries<T>, limit: usize, entry_type: &str) {
    if type_entries.entries.len() <= limit {
        return;
    }
    let mut entries: Vec<T> = type_entries.entries.drain().map(|(_, v)| v).collect();
    sort_by_duration(&mut entries);
    let evicted = entries.split_off(limit);
    let bucket = type_entries
        .bucket
        .get_or_insert_with(|| T::empty_bucket(entry_type));
    for entry in &evicted {
        bucket.merge_from(entry);
    }
    type_entries.entries = entries
        .into_iter()
        .map(|e| (e.text().to_string(), e))
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(text: &str, duration: f64, count: u64) -> Query {
        let mut q = Query::new("SQL", text, duration, count);
        q.total_rows = Some(count);
        q
    }

    #[test]
    fn test_same_key_merges() {
        let mut collector = QueryCollector::new(10);
        collector.merge(&[query("select 1", 10.0, 1), query("select 1", 5.0, 2)]);
        let entries = collector.into_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].total_duration_nanos, 15.0);
        assert_eq!(entries[0].execution_count, 3);
        assert_eq!(entries[0].total_rows, Some(3));
    }

    #[test]
    fn test_missing_rows_makes_total_unknown() {
        let mut collector = QueryCollector::new(10);
        collector.merge(&[
            query("select 1", 10.0, 1),
            Query::new("SQL", "select 1", 5.0, 1),
        ]);
        assert_eq!(collector.into_entries()[0].total_rows, None);
    }

    #[test]
    fn test_types_limited_independently() {
        let mut collector = QueryCollector::new(1);
        collector.merge(&[
            query("select 1", 10.0, 1),
            Query::new("Redis", "GET", 1.0, 1),
        ]);
        let entries = collector.into_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.truncated_text != LIMIT_EXCEEDED_BUCKET));
    }

    #[test]
    fn test_eviction_preserves_counts() {
        let mut collector = QueryCollector::new(2);
        collector.merge(&[
            query("a", 30.0, 1),
            query("b", 10.0, 2),
            query("c", 20.0, 3),
            query("d", 5.0, 4),
        ]);
        let entries = collector.into_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].truncated_text, "a");
        assert_eq!(entries[1].truncated_text, "c");
        let bucket = &entries[2];
        assert_eq!(bucket.truncated_text, LIMIT_EXCEEDED_BUCKET);
        assert_eq!(bucket.execution_count, 6);
        assert_eq!(bucket.total_duration_nanos, 15.0);
        let total: u64 = entries.iter().map(|e| e.execution_count).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_existing_bucket_is_merged_not_evicted() {
        let mut collector = QueryCollector::new(1);
        collector.merge(&[query("a", 30.0, 1), query(LIMIT_EXCEEDED_BUCKET, 1.0, 7)]);
        collector.merge(&[query(LIMIT_EXCEEDED_BUCKET, 1.0, 3)]);
        let entries = collector.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].execution_count, 10);
    }

    #[test]
    fn test_hard_limit_truncates_during_merge() {
        let mut collector = QueryCollector::new(2);
        for i in 0..100u64 {
            collector.merge_entry(&query(&format!("q{}", i), i as f64, 1));
        }
        let entries = collector.into_entries();
        assert_eq!(entries.len(), 3);
        let total: u64 = entries.iter().map(|e| e.execution_count).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_service_calls() {
        let mut collector = ServiceCallCollector::new(500);
        collector.merge(&[
            ServiceCall::new("HTTP", "GET /orders", 10.0, 1),
            ServiceCall::new("HTTP", "GET /orders", 20.0, 1),
        ]);
        let entries = collector.into_entries();
        assert_eq!(entries, vec![ServiceCall::new("HTTP", "GET /orders", 30.0, 2)]);
    }
}
