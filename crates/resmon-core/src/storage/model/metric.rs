//! The tagged union of all metric records and the kind discriminator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{
    CpuCoreData, CpuData, MemoryData, NetworkData, ProcessData, Sample, SystemConstants,
    SystemData,
};

/// A single metric record of any kind.
///
/// On the bus the variant is selected by the `metric_type` field:
///
/// ```json
/// {"metric_type":"memory","utilization":0.42,"page_faults":0.0,"delta_millis":10000,"datetime":1700000000000}
/// ```
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "metric_type", rename_all = "snake_case")]
pub enum Metric {
    Cpu(CpuData),
    CpuCore(CpuCoreData),
    Memory(MemoryData),
    Network(NetworkData),
    Processes(ProcessData),
    SystemMetrics(SystemData),
    SystemConstants(SystemConstants),
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Cpu(_) => MetricKind::Cpu,
            Metric::CpuCore(_) => MetricKind::CpuCore,
            Metric::Memory(_) => MetricKind::Memory,
            Metric::Network(_) => MetricKind::Network,
            Metric::Processes(_) => MetricKind::Processes,
            Metric::SystemMetrics(_) => MetricKind::SystemMetrics,
            Metric::SystemConstants(_) => MetricKind::SystemConstants,
        }
    }

    /// Index timestamp of the record in its partition.
    pub fn timestamp(&self) -> i64 {
        match self {
            Metric::Cpu(m) => m.timestamp(),
            Metric::CpuCore(m) => m.timestamp(),
            Metric::Memory(m) => m.timestamp(),
            Metric::Network(m) => m.timestamp(),
            Metric::Processes(m) => m.timestamp(),
            Metric::SystemMetrics(m) => m.timestamp(),
            Metric::SystemConstants(m) => m.timestamp,
        }
    }

    /// Interval length, `None` for the constants kind.
    pub fn delta_millis(&self) -> Option<i64> {
        match self {
            Metric::Cpu(m) => Some(m.delta_millis()),
            Metric::CpuCore(m) => Some(m.delta_millis()),
            Metric::Memory(m) => Some(m.delta_millis()),
            Metric::Network(m) => Some(m.delta_millis()),
            Metric::Processes(m) => Some(m.delta_millis()),
            Metric::SystemMetrics(m) => Some(m.delta_millis()),
            Metric::SystemConstants(_) => None,
        }
    }
}

/// Discriminator of a metric kind. Each kind owns one store partition.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    CpuCore,
    Memory,
    Network,
    Processes,
    SystemMetrics,
    SystemConstants,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::Cpu,
        MetricKind::CpuCore,
        MetricKind::Memory,
        MetricKind::Network,
        MetricKind::Processes,
        MetricKind::SystemMetrics,
        MetricKind::SystemConstants,
    ];

    /// Wire and directory name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Cpu => "cpu",
            MetricKind::CpuCore => "cpu_core",
            MetricKind::Memory => "memory",
            MetricKind::Network => "network",
            MetricKind::Processes => "processes",
            MetricKind::SystemMetrics => "system_metrics",
            MetricKind::SystemConstants => "system_constants",
        }
    }

    /// Constants never age; every other kind is subject to compaction.
    pub fn is_prunable(self) -> bool {
        self != MetricKind::SystemConstants
    }

    /// Stable one-byte tag used in segment headers.
    pub fn tag(self) -> u8 {
        match self {
            MetricKind::Cpu => 1,
            MetricKind::CpuCore => 2,
            MetricKind::Memory => 3,
            MetricKind::Network => 4,
            MetricKind::Processes => 5,
            MetricKind::SystemMetrics => 6,
            MetricKind::SystemConstants => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        MetricKind::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown kind name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for MetricKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_name_round_trip() {
        for kind in MetricKind::ALL {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
            assert_eq!(MetricKind::from_tag(kind.tag()), Some(kind));
        }
        assert!("gpu".parse::<MetricKind>().is_err());
        assert_eq!(MetricKind::from_tag(0), None);
    }

    #[test]
    fn test_only_constants_are_exempt_from_pruning() {
        let exempt: Vec<_> = MetricKind::ALL
            .into_iter()
            .filter(|k| !k.is_prunable())
            .collect();
        assert_eq!(exempt, vec![MetricKind::SystemConstants]);
    }

    #[test]
    fn test_metric_json_uses_discriminator() {
        let metric = Metric::SystemMetrics(SystemData {
            up_time: 3600.0,
            delta_millis: 1000,
            timestamp: 42,
        });
        let json = serde_json::to_string(&metric).unwrap();
        assert!(json.contains("\"metric_type\":\"system_metrics\""));
        assert!(json.contains("\"datetime\":42"));

        let back: Metric = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metric);
        assert_eq!(back.kind(), MetricKind::SystemMetrics);
        assert_eq!(back.delta_millis(), Some(1000));
    }
}
