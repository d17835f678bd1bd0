//! Samplers for the Linux `/proc` and `/sys` filesystems.
//!
//! Parsers turn pseudo-file content into raw counters; the process inspector
//! and the system sampler turn counters into records.

pub mod parser;
pub mod process;
pub mod system;

pub use process::{CollectError, ProcfsInspector};
pub use system::SystemSampler;
