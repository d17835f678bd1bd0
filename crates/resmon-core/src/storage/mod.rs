//! Range-queryable metric storage.
//!
//! Every metric kind owns one partition indexed by timestamp, plus a single
//! per-kind watermark used by the retention engine. Two implementations share
//! the [`MetricStore`] contract:
//!
//! - [`MemoryStore`]: in-process vectors, for tests and `--stdout` pipelines;
//! - [`DiskStore`]: per-kind WAL plus a compressed segment committed by
//!   atomic rename.

pub mod codec;
pub mod disk;
pub mod memory;
pub mod model;
pub mod segment;

use std::io;

pub use codec::CodecError;
pub use disk::{DiskStore, DiskStoreConfig};
pub use memory::MemoryStore;
pub use model::{Metric, MetricKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("row codec: {0}")]
    Decode(#[from] CodecError),

    #[error("transaction on {kind} aborted: {reason}")]
    Transaction { kind: MetricKind, reason: String },
}

/// Storage contract consumed by the retention engine.
///
/// Ranges are half-open: `[earliest, latest)` on the record timestamp.
pub trait MetricStore {
    /// Appends one record to the partition of its kind.
    fn append(&mut self, metric: &Metric) -> Result<(), StoreError>;

    /// Returns all records of `kind` with `earliest <= timestamp < latest`,
    /// in chronological order.
    fn range(&self, kind: MetricKind, earliest: i64, latest: i64)
    -> Result<Vec<Metric>, StoreError>;

    /// Replaces every record of `kind` in `[earliest, latest)` with `rows`.
    ///
    /// Either the whole replacement becomes visible or nothing changes.
    fn rewrite_range(
        &mut self,
        kind: MetricKind,
        earliest: i64,
        latest: i64,
        rows: Vec<Metric>,
    ) -> Result<(), StoreError>;

    /// Exclusive upper bound already compacted into the hourly tier.
    fn watermark(&self, kind: MetricKind) -> Result<Option<i64>, StoreError>;

    fn set_watermark(&mut self, kind: MetricKind, bound: i64) -> Result<(), StoreError>;

    /// Kinds that currently hold at least one record.
    fn kinds(&self) -> Result<Vec<MetricKind>, StoreError>;
}

/// Rejects a replacement batch containing rows of another kind.
///
/// This is the insert half of a rewrite; stores call it before touching the
/// partition so a bad batch leaves the range as it was.
pub(crate) fn check_batch(kind: MetricKind, rows: &[Metric]) -> Result<(), StoreError> {
    match rows.iter().find(|r| r.kind() != kind) {
        Some(foreign) => Err(StoreError::Transaction {
            kind,
            reason: format!("cannot insert {} row", foreign.kind()),
        }),
        None => Ok(()),
    }
}

/// Whether a timestamp falls inside the half-open range.
pub(crate) fn in_range(ts: i64, earliest: i64, latest: i64) -> bool {
    ts >= earliest && ts < latest
}
