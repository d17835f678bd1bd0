//! Host-wide records: uptime per interval and static constants.
//!
//! Source: `/proc/uptime`, `/proc/meminfo`, `/proc/cpuinfo`.

use serde::{Deserialize, Serialize};

use super::{MetricKind, Sample};

/// Host uptime observed at the end of an interval.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct SystemData {
    /// Seconds since boot.
    #[serde(rename = "uptime")]
    pub up_time: f64,

    pub delta_millis: i64,

    #[serde(rename = "datetime")]
    pub timestamp: i64,
}

impl Sample for SystemData {
    const KIND: MetricKind = MetricKind::SystemMetrics;

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn delta_millis(&self) -> i64 {
        self.delta_millis
    }
}

/// Hardware facts sampled once at collector start. Never compacted.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct SystemConstants {
    /// Physical memory in GB, one decimal.
    pub total_memory: f64,

    pub physical_cores: u32,

    pub logical_cores: u32,

    /// Nominal clock in GHz, two decimals.
    pub cpu_speed: f64,

    /// Sampling instant, epoch milliseconds.
    #[serde(rename = "datetime", default)]
    pub timestamp: i64,
}
