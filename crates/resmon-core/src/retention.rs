//! Self-compacting retention for stored metrics.
//!
//! Raw snapshots are kept for 12 hours. Snapshots between 12 and 24 hours old
//! are compacted into one-minute records on every prune; anything older is
//! compacted into one-hour records exactly once, tracked by a per-kind
//! watermark:
//!
//! ```text
//!   watermark        hour_bound          minute_bound          now
//!  ─────┼────────────────┼────────────────────┼─────────────────────┼──▶
//!       │  1h buckets    │   1min buckets     │   raw, untouched    │
//!       │  (once)        │   (every prune)    │                     │
//! ```
//!
//! Each window is read, bucketed by `floor((ts - min_ts) / bucket)`, combined
//! and written back with a single [`MetricStore::rewrite_range`], so a failed
//! window leaves its raw rows in place and is retried on the next prune.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, error, info, warn};

use crate::combine::{CombineError, combine_metrics};
use crate::storage::model::{Metric, MetricKind, PidState};
use crate::storage::{MetricStore, StoreError};
use crate::util::{format_millis, now_millis};

const ONE_MINUTE_MS: i64 = 60 * 1000;
const ONE_HOUR_MS: i64 = 60 * ONE_MINUTE_MS;

/// Retention boundaries and bucket sizes, all in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    /// Age below which snapshots stay raw.
    pub raw_retention_ms: i64,
    /// Width of the minute tier that follows the raw tier.
    pub minute_retention_ms: i64,
    pub hour_bucket_ms: i64,
    pub minute_bucket_ms: i64,
    /// Minimum spacing between prunes triggered by `persist`.
    pub prune_interval_ms: i64,
    /// Prune once when the engine is constructed.
    pub auto_prune: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_retention_ms: 12 * ONE_HOUR_MS,
            minute_retention_ms: 12 * ONE_HOUR_MS,
            hour_bucket_ms: ONE_HOUR_MS,
            minute_bucket_ms: ONE_MINUTE_MS,
            prune_interval_ms: ONE_HOUR_MS,
            auto_prune: true,
        }
    }
}

impl RetentionConfig {
    /// Creates a config with the given tier widths in hours.
    pub fn new(raw_hours: u32, minute_hours: u32, auto_prune: bool) -> Self {
        Self {
            raw_retention_ms: i64::from(raw_hours) * ONE_HOUR_MS,
            minute_retention_ms: i64::from(minute_hours) * ONE_HOUR_MS,
            auto_prune,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hour,
    Minute,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Hour => f.write_str("1 hour"),
            Tier::Minute => f.write_str("1 minute"),
        }
    }
}

/// Outcome of compacting one window of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    pub kind: MetricKind,
    pub tier: Tier,
    pub earliest: i64,
    pub latest: i64,
    pub rows_read: usize,
    pub rows_written: usize,
    /// Set when the window was rolled back.
    pub error: Option<String>,
}

impl WindowReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Result of one [`RetentionEngine::prune_at`] run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    pub now: i64,
    pub windows: Vec<WindowReport>,
}

impl PruneReport {
    pub fn failures(&self) -> usize {
        self.windows.iter().filter(|w| w.failed()).count()
    }

    pub fn rows_read(&self) -> usize {
        self.windows.iter().map(|w| w.rows_read).sum()
    }

    pub fn rows_written(&self) -> usize {
        self.windows.iter().map(|w| w.rows_written).sum()
    }
}

#[derive(Debug, thiserror::Error)]
enum WindowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Combine(#[from] CombineError),
}

/// Persists metrics into a [`MetricStore`] and keeps it compacted.
pub struct RetentionEngine<S: MetricStore> {
    store: S,
    config: RetentionConfig,
    next_prune_time: i64,
}

impl<S: MetricStore> RetentionEngine<S> {
    pub fn new(store: S, config: RetentionConfig) -> Self {
        let auto_prune = config.auto_prune;
        let mut engine = Self {
            store,
            config,
            next_prune_time: 0,
        };
        if auto_prune {
            engine.prune();
        }
        engine
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Epoch milliseconds after which the next `persist` prunes.
    pub fn next_prune_time(&self) -> i64 {
        self.next_prune_time
    }

    /// Stores a metric, pruning first if a prune is due. Returns whether the
    /// metric was written.
    pub fn persist(&mut self, metric: &Metric) -> bool {
        self.persist_at(metric, now_millis())
    }

    pub fn persist_at(&mut self, metric: &Metric, now: i64) -> bool {
        if let Some(delta) = metric.delta_millis()
            && delta <= 0
            && !is_ended(metric)
        {
            warn!(
                kind = %metric.kind(),
                timestamp = metric.timestamp(),
                delta_millis = delta,
                "rejecting metric with non-positive interval"
            );
            return false;
        }

        if let Err(e) = self.store.append(metric) {
            error!(kind = %metric.kind(), error = %e, "failed to persist metric");
            return false;
        }

        if now > self.next_prune_time {
            self.prune_at(now);
        }
        true
    }

    pub fn prune(&mut self) -> PruneReport {
        self.prune_at(now_millis())
    }

    /// Compacts every prunable kind relative to `now`.
    pub fn prune_at(&mut self, now: i64) -> PruneReport {
        let minute_bound = now - self.config.raw_retention_ms;
        let hour_bound = minute_bound - self.config.minute_retention_ms;
        let mut report = PruneReport {
            now,
            windows: Vec::new(),
        };

        for kind in MetricKind::ALL.into_iter().filter(|k| k.is_prunable()) {
            match self.store.watermark(kind) {
                Ok(watermark) => {
                    let lower_bound = watermark.unwrap_or(0);
                    if lower_bound < hour_bound {
                        let window =
                            self.run_window(kind, Tier::Hour, lower_bound, hour_bound);
                        if !window.failed()
                            && let Err(e) = self.store.set_watermark(kind, hour_bound)
                        {
                            error!(kind = %kind, error = %e, "failed to store prune boundary");
                        }
                        report.windows.push(window);
                    }
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "failed to read prune boundary");
                    report.windows.push(WindowReport {
                        kind,
                        tier: Tier::Hour,
                        earliest: 0,
                        latest: hour_bound,
                        rows_read: 0,
                        rows_written: 0,
                        error: Some(e.to_string()),
                    });
                }
            }

            report
                .windows
                .push(self.run_window(kind, Tier::Minute, hour_bound, minute_bound));
        }

        self.next_prune_time = now + self.config.prune_interval_ms;

        info!(
            rows_read = report.rows_read(),
            rows_written = report.rows_written(),
            failures = report.failures(),
            next_prune = %format_millis(self.next_prune_time),
            "prune finished"
        );
        report
    }

    fn run_window(
        &mut self,
        kind: MetricKind,
        tier: Tier,
        earliest: i64,
        latest: i64,
    ) -> WindowReport {
        let bucket = match tier {
            Tier::Hour => self.config.hour_bucket_ms,
            Tier::Minute => self.config.minute_bucket_ms,
        };
        let mut window = WindowReport {
            kind,
            tier,
            earliest,
            latest,
            rows_read: 0,
            rows_written: 0,
            error: None,
        };

        match self.compact_window(kind, earliest, latest, bucket) {
            Ok((read, written)) => {
                window.rows_read = read;
                window.rows_written = written;
                if read > 0 {
                    info!(
                        kind = %kind,
                        from = %format_millis(earliest),
                        to = %format_millis(latest),
                        read,
                        written,
                        "pruned metrics in {} windows",
                        tier
                    );
                } else {
                    debug!(kind = %kind, tier = %tier, "nothing to prune");
                }
            }
            Err(e) => {
                error!(
                    kind = %kind,
                    from = %format_millis(earliest),
                    to = %format_millis(latest),
                    error = %e,
                    "failed prune in {} windows, raw rows kept",
                    tier
                );
                window.error = Some(e.to_string());
            }
        }
        window
    }

    /// Replaces `[earliest, latest)` of `kind` with its bucketed combination.
    ///
    /// Returns `(rows_read, rows_written)`. An empty range touches nothing.
    fn compact_window(
        &mut self,
        kind: MetricKind,
        earliest: i64,
        latest: i64,
        bucket_ms: i64,
    ) -> Result<(usize, usize), WindowError> {
        let rows = self.store.range(kind, earliest, latest)?;
        let rows_read = rows.len();
        let Some(min_ts) = rows.iter().map(Metric::timestamp).min() else {
            return Ok((0, 0));
        };

        let bucket_ms = bucket_ms.max(1);
        let mut buckets: BTreeMap<i64, Vec<Metric>> = BTreeMap::new();
        for row in rows {
            let key = (row.timestamp() - min_ts) / bucket_ms;
            buckets.entry(key).or_default().push(row);
        }

        let mut compacted = Vec::with_capacity(buckets.len());
        for group in buckets.into_values() {
            compacted.extend(combine_metrics(kind, group)?);
        }

        let rows_written = compacted.len();
        self.store.rewrite_range(kind, earliest, latest, compacted)?;
        Ok((rows_read, rows_written))
    }

    /// Stored snapshots of `kind` in `[earliest, latest)`, oldest first.
    pub fn metrics_in_range(
        &self,
        kind: MetricKind,
        earliest: i64,
        latest: i64,
    ) -> Result<Vec<Metric>, StoreError> {
        self.store.range(kind, earliest, latest)
    }

    /// Kinds that currently hold data.
    pub fn metric_kinds(&self) -> Result<Vec<MetricKind>, StoreError> {
        self.store.kinds()
    }
}

fn is_ended(metric: &Metric) -> bool {
    matches!(metric, Metric::Processes(p) if p.state == PidState::Ended)
}
