//! Network throughput records.
//!
//! Source: `/proc/net/dev` byte counters, link speed from
//! `/sys/class/net/<iface>/speed`. All active interfaces are summed into one
//! record per interval.

use serde::{Deserialize, Serialize};

use super::{MetricKind, Sample};

const BITS_PER_BYTE: f64 = 8.0;
const BITS_PER_KILOBIT: u64 = 1000;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct NetworkData {
    /// Transmit rate in kbit/s.
    pub send: f64,

    /// Receive rate in kbit/s.
    pub receive: f64,

    /// Combined link speed of active interfaces in kbit/s.
    pub throughput: f64,

    pub delta_millis: i64,

    #[serde(rename = "datetime")]
    pub timestamp: i64,
}

impl NetworkData {
    /// Builds a record from byte deltas and a link speed in bit/s.
    pub fn from_counters(
        bytes_sent: u64,
        bytes_recv: u64,
        speed_bps: u64,
        delta_millis: i64,
        timestamp: i64,
    ) -> Self {
        Self {
            send: bytes_sent as f64 / delta_millis as f64 * BITS_PER_BYTE,
            receive: bytes_recv as f64 / delta_millis as f64 * BITS_PER_BYTE,
            throughput: (speed_bps / BITS_PER_KILOBIT) as f64,
            delta_millis,
            timestamp,
        }
    }
}

impl Sample for NetworkData {
    const KIND: MetricKind = MetricKind::Network;

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
    fn test_rates_from_counters() {
        // 1000 bytes over 1000 ms = 8 kbit/s
        let n = NetworkData::from_counters(1000, 2000, 1_000_000_000, 1000, 5);
        assert!((n.send - 8.0).abs() < 1e-9);
        assert!((n.receive - 16.0).abs() < 1e-9);
        assert_eq!(n.throughput, 1_000_000.0);
    }
}
