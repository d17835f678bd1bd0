//! CPU utilization records.
//!
//! Source: `/proc/stat` (`cpu` and `cpuN` lines), temperature from
//! `/sys/class/thermal`.

use serde::{Deserialize, Serialize};

use super::{MetricKind, Sample};

/// Whole-machine CPU utilization over one interval.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CpuData {
    /// Mean busy fraction across reported cores (0.0-1.0).
    pub utilization: f64,

    /// Package temperature in degrees Celsius, 0.0 when no sensor is readable.
    pub temperature: f64,

    pub delta_millis: i64,

    #[serde(rename = "datetime")]
    pub timestamp: i64,
}

impl Sample for CpuData {
    const KIND: MetricKind = MetricKind::Cpu;

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn delta_millis(&self) -> i64 {
        self.delta_millis
    }
}

/// Utilization of a single (logical or physical) core over one interval.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct CpuCoreData {
    /// Zero-based core index. Compaction groups by this value.
    pub core_id: u32,

    /// Busy fraction of this core (0.0-1.0).
    pub core_utilization: f64,

    pub delta_millis: i64,

    #[serde(rename = "datetime")]
    pub timestamp: i64,
}

impl Sample for CpuCoreData {
    const KIND: MetricKind = MetricKind::CpuCore;

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn delta_millis(&self) -> i64 {
        self.delta_millis
    }
}
