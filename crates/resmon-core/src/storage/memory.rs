//! In-process metric store.

use std::collections::BTreeMap;

use super::{MetricStore, StoreError, check_batch, in_range};
use crate::storage::model::{Metric, MetricKind};

/// Keeps every partition as a timestamp-ordered vector.
///
/// Rewrites build the new partition off to the side and swap it in, so a
/// failed rewrite never leaves a partially replaced range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStore {
    partitions: BTreeMap<MetricKind, Vec<Metric>>,
    watermarks: BTreeMap<MetricKind, i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held for `kind`.
    pub fn len(&self, kind: MetricKind) -> usize {
        self.partitions.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Vec::is_empty)
    }
}

impl MetricStore for MemoryStore {
    fn append(&mut self, metric: &Metric) -> Result<(), StoreError> {
        let rows = self.partitions.entry(metric.kind()).or_default();
        let ts = metric.timestamp();
        let at = rows.partition_point(|r| r.timestamp() <= ts);
        rows.insert(at, metric.clone());
        Ok(())
    }

    fn range(
        &self,
        kind: MetricKind,
        earliest: i64,
        latest: i64,
    ) -> Result<Vec<Metric>, StoreError> {
        Ok(self
            .partitions
            .get(&kind)
            .map(|rows| {
                rows.iter()
                    .filter(|r| in_range(r.timestamp(), earliest, latest))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn rewrite_range(
        &mut self,
        kind: MetricKind,
        earliest: i64,
        latest: i64,
        rows: Vec<Metric>,
    ) -> Result<(), StoreError> {
        check_batch(kind, &rows)?;

        let current = self.partitions.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
        let mut replaced: Vec<Metric> = current
            .iter()
            .filter(|r| !in_range(r.timestamp(), earliest, latest))
            .cloned()
            .collect();
        replaced.extend(rows);
        replaced.sort_by_key(Metric::timestamp);

        self.partitions.insert(kind, replaced);
        Ok(())
    }

    fn watermark(&self, kind: MetricKind) -> Result<Option<i64>, StoreError> {
        Ok(self.watermarks.get(&kind).copied())
    }

    fn set_watermark(&mut self, kind: MetricKind, bound: i64) -> Result<(), StoreError> {
        self.watermarks.insert(kind, bound);
        Ok(())
    }

    fn kinds(&self) -> Result<Vec<MetricKind>, StoreError> {
        Ok(self
            .partitions
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(kind, _)| *kind)
            .collect())
    }
}
