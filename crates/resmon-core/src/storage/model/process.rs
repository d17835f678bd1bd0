//! Per-process activity records produced by the process tracker.
//!
//! Source: `/proc/[pid]/stat`, `/proc/[pid]/io`, `/proc/[pid]/comm`.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{MetricKind, Sample};

/// Lifecycle state of a pid as seen by the tracker.
///
/// ```text
/// NEW -> RUNNING* -> ENDED
/// NEW -> RECYCLED -> RUNNING* -> ENDED     (RECYCLED may recur)
/// ```
///
/// NEW and RECYCLED open a new lineage for the pid.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PidState {
    /// First observation of the pid.
    #[default]
    New,
    /// Same process as the previous poll.
    Running,
    /// The pid now belongs to a different process than last poll.
    Recycled,
    /// The pid disappeared from the live list.
    Ended,
}

impl PidState {
    /// Whether this record starts a new lineage for its pid.
    pub fn starts_lineage(self) -> bool {
        matches!(self, PidState::New | PidState::Recycled)
    }
}

impl fmt::Display for PidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PidState::New => "NEW",
            PidState::Running => "RUNNING",
            PidState::Recycled => "RECYCLED",
            PidState::Ended => "ENDED",
        };
        f.write_str(s)
    }
}

/// Activity of one process over one interval.
///
/// An ENDED record is a sentinel: `delta_millis` and every numeric field are
/// `-1` and `timestamp` is the instant the disappearance was noticed.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ProcessData {
    pub pid: u32,

    /// Short command name (`comm`).
    pub name: String,

    /// Process start, epoch milliseconds.
    pub start_time: i64,

    /// Milliseconds since process start at the end of the interval.
    #[serde(rename = "uptime")]
    pub up_time: f64,

    /// Share of total machine CPU used during the interval (0.0-1.0).
    pub cpu_usage: f64,

    /// Resident set size in KB.
    pub memory: f64,

    /// Disk read rate in KB/s.
    pub kb_read: f64,

    /// Disk write rate in KB/s.
    pub kb_written: f64,

    pub state: PidState,

    pub delta_millis: i64,

    #[serde(rename = "datetime")]
    pub timestamp: i64,
}

/// Raw per-interval counters the tracker hands to [`ProcessData::from_counters`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessCounters {
    pub start_time: i64,
    pub up_time: i64,
    pub cpu_usage: f64,
    pub resident_bytes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub delta_millis: i64,
}

impl ProcessData {
    /// Normalizes raw interval counters into rates.
    pub fn from_counters(
        pid: u32,
        name: impl Into<String>,
        state: PidState,
        c: &ProcessCounters,
    ) -> Self {
        Self {
            pid,
            name: name.into(),
            start_time: c.start_time,
            up_time: c.up_time as f64,
            cpu_usage: c.cpu_usage,
            memory: (c.resident_bytes / 1024) as f64,
            kb_read: c.bytes_read as f64 / c.delta_millis as f64,
            kb_written: c.bytes_written as f64 / c.delta_millis as f64,
            state,
            delta_millis: c.delta_millis,
            timestamp: c.start_time + c.up_time,
        }
    }

    /// Sentinel emitted once when a tracked pid vanishes.
    pub fn ended(pid: u32, name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            pid,
            name: name.into(),
            start_time: -1,
            up_time: -1.0,
            cpu_usage: -1.0,
            memory: -1.0,
            kb_read: -1.0,
            kb_written: -1.0,
            state: PidState::Ended,
            delta_millis: -1,
            timestamp,
        }
    }
}

impl Sample for ProcessData {
    const KIND: MetricKind = MetricKind::Processes;

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn delta_millis(&self) -> i64 {
        self.delta_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_counters_normalizes_rates() {
        let p = ProcessData::from_counters(
            7,
            "nginx",
            PidState::Running,
            &ProcessCounters {
                start_time: 1_000,
                up_time: 20_000,
                cpu_usage: 0.25,
                resident_bytes: 4096 * 1024,
                bytes_read: 10_240,
                bytes_written: 0,
                delta_millis: 10_000,
            },
        );
        assert_eq!(p.memory, 4096.0);
        assert!((p.kb_read - 1.024).abs() < 1e-9);
        assert_eq!(p.kb_written, 0.0);
        assert_eq!(p.timestamp, 21_000);
    }

    #[test]
    fn test_ended_sentinel() {
        let p = ProcessData::ended(9, "sleep", 500);
        assert_eq!(p.state, PidState::Ended);
        assert_eq!(p.delta_millis, -1);
        assert_eq!(p.cpu_usage, -1.0);
        assert_eq!(p.timestamp, 500);
    }

    #[test]
    fn test_state_wire_names() {
        let json = serde_json::to_string(&PidState::Recycled).unwrap();
        assert_eq!(json, "\"RECYCLED\"");
        assert!(PidState::New.starts_lineage());
        assert!(PidState::Recycled.starts_lineage());
        assert!(!PidState::Running.starts_lineage());
    }
}
