//! Data models for the storage system.
//!
//! Every metric kind is a flat record whose rate fields are already normalized
//! per unit of time, so records covering intervals of different length can be
//! merged by duration-weighted averaging.
//!
//! - [`cpu`]: total and per-core CPU utilization
//! - [`memory`]: memory utilization and swap-in rate
//! - [`network`]: aggregate send/receive rates
//! - [`process`]: per-process activity and lifecycle state
//! - [`system`]: uptime and static host constants
//! - [`metric`]: the tagged union carried on the bus and the kind enum
//!
//! # Covered interval
//!
//! ```text
//!        delta_millis
//!   |<---------------->|
//! --+------------------+--> time
//!   timestamp - delta  timestamp
//! ```

mod cpu;
mod memory;
mod metric;
mod network;
mod process;
mod system;

pub use cpu::{CpuCoreData, CpuData};
pub use memory::MemoryData;
pub use metric::{Metric, MetricKind, UnknownKind};
pub use network::NetworkData;
pub use process::{PidState, ProcessCounters, ProcessData};
pub use system::{SystemConstants, SystemData};

/// Common accessors of every timestamped record.
pub trait Sample {
    /// Kind this record belongs to.
    const KIND: MetricKind;

    /// End of the covered interval, epoch milliseconds.
    fn timestamp(&self) -> i64;

    /// Length of the covered interval in milliseconds.
    fn delta_millis(&self) -> i64;
}
