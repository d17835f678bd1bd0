//! Utility modules for resmon.

mod time;

pub use time::{TimeParseError, format_millis, now_millis, parse_millis};
