//! Host and process metrics collector for Linux.
//!
//! Reads cumulative counters from `/proc` and `/sys` and turns them into
//! interval records. Every read goes through the [`FileSystem`] trait so the
//! whole pipeline runs against a [`MockFs`] in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Collector                           │
//! │  ┌─────────────────────┐   ┌─────────────────────────────┐  │
//! │  │   ProcessTracker    │   │       SystemSampler         │  │
//! │  │  NEW/RUNNING/...    │   │  - /proc/stat, meminfo      │  │
//! │  └──────────┬──────────┘   │  - /proc/vmstat, net/dev    │  │
//! │  ┌──────────▼──────────┐   │  - /proc/uptime, cpuinfo    │  │
//! │  │   ProcfsInspector   │   │  - /sys/class/{net,thermal} │  │
//! │  │  - /proc/[pid]/*    │   └──────────────┬──────────────┘  │
//! │  └──────────┬──────────┘                  │                 │
//! │             └──────────────┬──────────────┘                 │
//! │                     ┌──────▼──────┐                         │
//! │                     │  FileSystem │ (trait)                 │
//! │                     └──────┬──────┘                         │
//! └────────────────────────────┼────────────────────────────────┘
//!                      ┌───────┴───────┐
//!               ┌──────▼──────┐ ┌──────▼──────┐
//!               │   RealFs    │ │   MockFs    │
//!               │  (Linux)    │ │  (Testing)  │
//!               └─────────────┘ └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use resmon_core::collector::{Collector, CollectorConfig, RealFs};
//!
//! let mut collector = Collector::new(RealFs::new(), CollectorConfig::default()).unwrap();
//! let batch = collector.poll();
//! ```

#[allow(clippy::module_inception)]
mod collector;
pub mod mock;
pub mod procfs;
pub mod tracker;
pub mod traits;

pub use collector::{Collector, CollectorConfig, CollectorTiming};
pub use mock::MockFs;
pub use procfs::{CollectError, ProcfsInspector, SystemSampler};
pub use tracker::{Inspection, ProcessSample, ProcessSource, ProcessTracker, TrackerConfig};
pub use traits::{FileSystem, RealFs};
