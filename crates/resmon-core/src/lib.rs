//! resmon-core: shared library for the resmon daemons.
//!
//! Provides:
//! - `collector`: `/proc` and `/sys` sampling, process identity tracking
//! - `bus`: JSON-lines transport of metric records
//! - `combine`: duration-weighted merging of interval records
//! - `retention`: tiered downsampling of aging data
//! - `scheduler`: when the next sample is due
//! - `storage`: metric models, the store trait, memory and disk stores
//! - `util`: time helpers

pub mod bus;
pub mod collector;
pub mod combine;
pub mod retention;
pub mod scheduler;
pub mod storage;
pub mod util;
