//! Process identity tracking across polls.
//!
//! The tracker keeps the previous sample of every live pid and classifies
//! each new sample:
//!
//! ```text
//!   no prior sample                          -> NEW       (full counters)
//!   start_time > prior.start_time + 5ms      -> RECYCLED  (full counters)
//!   otherwise                                -> RUNNING   (current - prior)
//!   tracked pid missing from the live list   -> ENDED     (sentinel, once)
//! ```
//!
//! Start times derived from clock ticks jitter by a few milliseconds between
//! reads, hence the tolerance. RUNNING records keep the prior start time so a
//! lineage reports one stable value.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::collector::procfs::CollectError;
use crate::storage::model::{PidState, ProcessCounters, ProcessData};
use crate::util::now_millis;

/// Cumulative counters of one live process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    /// Process start, epoch milliseconds.
    pub start_time: i64,
    /// Milliseconds since start.
    pub up_time: i64,
    /// User plus kernel time, milliseconds.
    pub cpu_time: i64,
    pub resident_bytes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Result of reading details for a set of pids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inspection {
    pub samples: Vec<ProcessSample>,
    /// Pids that exist but could not be read this time.
    pub gaps: Vec<u32>,
}

impl Inspection {
    /// Pids that were returned, readable or not.
    pub fn returned(&self) -> Vec<u32> {
        self.samples
            .iter()
            .map(|s| s.pid)
            .chain(self.gaps.iter().copied())
            .collect()
    }
}

/// Source of live process data.
pub trait ProcessSource {
    fn list_pids(&self) -> Result<Vec<u32>, CollectError>;

    /// Reads details of `pids`. Pids that vanished are left out entirely.
    fn inspect(&self, pids: &[u32]) -> Inspection;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Start-time drift above which a pid counts as reused.
    pub recycle_tolerance_ms: i64,
    pub logical_cores: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            recycle_tolerance_ms: 5,
            logical_cores: 1,
        }
    }
}

impl TrackerConfig {
    pub fn new(logical_cores: u32) -> Self {
        Self {
            logical_cores: logical_cores.max(1),
            ..Self::default()
        }
    }
}

pub struct ProcessTracker<S: ProcessSource> {
    source: S,
    config: TrackerConfig,
    prior: HashMap<u32, ProcessSample>,
}

impl<S: ProcessSource> ProcessTracker<S> {
    pub fn new(source: S, config: TrackerConfig) -> Self {
        Self {
            source,
            config,
            prior: HashMap::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Number of pids with a prior sample.
    pub fn tracked(&self) -> usize {
        self.prior.len()
    }

    /// Records the current process set as baseline without emitting records.
    ///
    /// Processes already running at startup then report RUNNING deltas on
    /// the first poll instead of their lifetime totals.
    pub fn prime(&mut self) -> Result<(), CollectError> {
        let inspection = self.live_set()?;
        self.prior = inspection
            .samples
            .into_iter()
            .filter(|s| s.up_time > 0)
            .map(|s| (s.pid, s))
            .collect();
        debug!(tracked = self.prior.len(), "process tracker primed");
        Ok(())
    }

    pub fn poll(&mut self) -> Result<Vec<ProcessData>, CollectError> {
        self.poll_at(now_millis())
    }

    /// Samples all live processes; `now` stamps ENDED sentinels.
    pub fn poll_at(&mut self, now: i64) -> Result<Vec<ProcessData>, CollectError> {
        let inspection = self.live_set()?;

        let mut previous = std::mem::take(&mut self.prior);
        let mut next = HashMap::with_capacity(inspection.samples.len());
        let mut records = Vec::with_capacity(inspection.samples.len());

        for sample in inspection.samples {
            let prior = previous.remove(&sample.pid);
            match self.classify(&sample, prior.as_ref()) {
                Classified::Emit(record) => {
                    records.push(record);
                    let mut baseline = sample;
                    if let Some(p) = prior.filter(|p| !self.is_recycled(p, &baseline)) {
                        baseline.start_time = p.start_time;
                    }
                    next.insert(baseline.pid, baseline);
                }
                Classified::KeepPrior => {
                    if let Some(p) = prior {
                        next.insert(p.pid, p);
                    }
                }
                Classified::Skip => {}
            }
        }

        for pid in inspection.gaps {
            if let Some(p) = previous.remove(&pid) {
                warn!(pid, "process unreadable this poll, keeping previous sample");
                next.insert(pid, p);
            }
        }

        let mut ended: Vec<ProcessSample> = previous.into_values().collect();
        ended.sort_by_key(|p| p.pid);
        for p in ended {
            records.push(ProcessData::ended(p.pid, p.name, now));
        }

        self.prior = next;
        Ok(records)
    }

    /// Lists pids and re-reads the ones actually returned until the returned
    /// set stops shrinking.
    fn live_set(&self) -> Result<Inspection, CollectError> {
        let mut pids = self.source.list_pids()?;
        let mut inspection = self.source.inspect(&pids);

        loop {
            let returned = inspection.returned();
            if returned.len() >= pids.len() {
                return Ok(inspection);
            }
            pids = returned;
            inspection = self.source.inspect(&pids);
        }
    }

    fn is_recycled(&self, prior: &ProcessSample, sample: &ProcessSample) -> bool {
        sample.start_time > prior.start_time + self.config.recycle_tolerance_ms
    }

    fn classify(&self, sample: &ProcessSample, prior: Option<&ProcessSample>) -> Classified {
        let cores = f64::from(self.config.logical_cores.max(1));

        let (state, counters) = match prior {
            Some(p) if !self.is_recycled(p, sample) => {
                let delta_millis = sample.up_time - p.up_time;
                if delta_millis <= 0 {
                    return Classified::KeepPrior;
                }
                let cpu_delta = (sample.cpu_time - p.cpu_time).max(0);
                (
                    PidState::Running,
                    ProcessCounters {
                        start_time: p.start_time,
                        up_time: sample.up_time,
                        cpu_usage: cpu_delta as f64 / delta_millis as f64 / cores,
                        resident_bytes: sample.resident_bytes,
                        bytes_read: sample.bytes_read.saturating_sub(p.bytes_read),
                        bytes_written: sample.bytes_written.saturating_sub(p.bytes_written),
                        delta_millis,
                    },
                )
            }
            _ => {
                // A process younger than one tick is picked up next poll. A
                // replaced pid keeps its dead predecessor so that poll still
                // reports RECYCLED.
                if sample.up_time <= 0 {
                    return if prior.is_some() {
                        Classified::KeepPrior
                    } else {
                        Classified::Skip
                    };
                }
                let state = if prior.is_some() {
                    PidState::Recycled
                } else {
                    PidState::New
                };
                (
                    state,
                    ProcessCounters {
                        start_time: sample.start_time,
                        up_time: sample.up_time,
                        cpu_usage: sample.cpu_time as f64 / sample.up_time as f64 / cores,
                        resident_bytes: sample.resident_bytes,
                        bytes_read: sample.bytes_read,
                        bytes_written: sample.bytes_written,
                        delta_millis: sample.up_time,
                    },
                )
            }
        };

        Classified::Emit(ProcessData::from_counters(
            sample.pid,
            sample.name.clone(),
            state,
            &counters,
        ))
    }
}

enum Classified {
    Emit(ProcessData),
    /// Zero-length interval: nothing to report, prior stays the baseline.
    KeepPrior,
    Skip,
}
