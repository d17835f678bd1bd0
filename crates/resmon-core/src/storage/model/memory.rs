//! Memory utilization records.
//!
//! Source: `/proc/meminfo` (MemTotal, MemAvailable), `/proc/vmstat` (pswpin).

use serde::{Deserialize, Serialize};

use super::{MetricKind, Sample};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct MemoryData {
    /// Fraction of physical memory not available to new allocations (0.0-1.0).
    pub utilization: f64,

    /// Pages swapped in per second during the interval.
    pub page_faults: f64,

    pub delta_millis: i64,

    #[serde(rename = "datetime")]
    pub timestamp: i64,
}

impl MemoryData {
    /// Builds a record from a raw swap-in page count observed over `delta_millis`.
    pub fn from_counters(
        utilization: f64,
        swap_pages_in: u64,
        delta_millis: i64,
        timestamp: i64,
    ) -> Self {
        Self {
            utilization,
            page_faults: swap_pages_in as f64 / delta_millis as f64 * 1000.0,
            delta_millis,
            timestamp,
        }
    }
}

impl Sample for MemoryData {
    const KIND: MetricKind = MetricKind::Memory;

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
    fn test_page_faults_are_per_second() {
        let m = MemoryData::from_counters(0.5, 30, 10_000, 1);
        assert!((m.page_faults - 3.0).abs() < 1e-9);
    }
}
