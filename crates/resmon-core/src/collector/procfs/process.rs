//! Per-process sampling from `/proc/[pid]/`.

use std::path::PathBuf;

use tracing::warn;

use crate::collector::procfs::parser::{
    parse_global_stat, parse_proc_io, parse_proc_stat, parse_uptime,
};
use crate::collector::tracker::{Inspection, ProcessSample, ProcessSource};
use crate::collector::traits::FileSystem;

/// Clock ticks per second (USER_HZ). Standard value for Linux.
const CLK_TCK: u64 = 100;

const PAGE_SIZE: u64 = 4096;

/// Error type for collection failures.
#[derive(Debug)]
pub enum CollectError {
    /// Process disappeared during collection.
    ProcessGone(u32),
    /// I/O error reading pseudo files.
    Io(std::io::Error),
    /// Parse error in pseudo files.
    Parse(String),
}

impl std::fmt::Display for CollectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectError::ProcessGone(pid) => write!(f, "process {} disappeared", pid),
            CollectError::Io(e) => write!(f, "I/O error: {}", e),
            CollectError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for CollectError {}

impl From<std::io::Error> for CollectError {
    fn from(e: std::io::Error) -> Self {
        CollectError::Io(e)
    }
}

impl From<super::parser::ParseError> for CollectError {
    fn from(e: super::parser::ParseError) -> Self {
        CollectError::Parse(e.message)
    }
}

fn ticks_to_millis(ticks: u64) -> i64 {
    (ticks * 1000 / CLK_TCK) as i64
}

/// Reads [`ProcessSample`]s from a proc filesystem.
pub struct ProcfsInspector<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
}

impl<F: FileSystem> ProcfsInspector<F> {
    pub fn new(fs: F, proc_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    /// Boot time and current uptime, both in epoch/elapsed milliseconds.
    fn clock(&self) -> Result<(i64, i64), CollectError> {
        let stat = self.fs.read_to_string(&self.proc_path.join("stat"))?;
        let boot_ms = parse_global_stat(&stat)?.btime as i64 * 1000;
        let uptime = self.fs.read_to_string(&self.proc_path.join("uptime"))?;
        let uptime_ms = (parse_uptime(&uptime)? * 1000.0).round() as i64;
        Ok((boot_ms, uptime_ms))
    }

    fn inspect_one(
        &self,
        pid: u32,
        boot_ms: i64,
        uptime_ms: i64,
    ) -> Result<ProcessSample, CollectError> {
        let proc_dir = self.proc_path.join(pid.to_string());

        let stat_content = self
            .fs
            .read_to_string(&proc_dir.join("stat"))
            .map_err(|_| CollectError::ProcessGone(pid))?;
        let stat = parse_proc_stat(&stat_content)?;

        // io is unreadable for other users' processes; count as zero
        let io = self
            .fs
            .read_to_string(&proc_dir.join("io"))
            .ok()
            .and_then(|content| parse_proc_io(&content).ok())
            .unwrap_or_default();

        let started_after_boot = ticks_to_millis(stat.starttime);
        Ok(ProcessSample {
            pid,
            name: stat.comm,
            start_time: boot_ms + started_after_boot,
            up_time: (uptime_ms - started_after_boot).max(0),
            cpu_time: ticks_to_millis(stat.utime + stat.stime),
            resident_bytes: stat.rss.max(0) as u64 * PAGE_SIZE,
            bytes_read: io.read_bytes,
            bytes_written: io.write_bytes,
        })
    }
}

impl<F: FileSystem> ProcessSource for ProcfsInspector<F> {
    fn list_pids(&self) -> Result<Vec<u32>, CollectError> {
        let mut pids: Vec<u32> = self
            .fs
            .read_dir(&self.proc_path)?
            .iter()
            .filter_map(|p| p.file_name()?.to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn inspect(&self, pids: &[u32]) -> Inspection {
        let (boot_ms, uptime_ms) = match self.clock() {
            Ok(clock) => clock,
            Err(e) => {
                warn!(error = %e, "cannot read system clock, skipping process details");
                return Inspection {
                    samples: Vec::new(),
                    gaps: pids.to_vec(),
                };
            }
        };

        let mut inspection = Inspection::default();
        for &pid in pids {
            match self.inspect_one(pid, boot_ms, uptime_ms) {
                Ok(sample) => inspection.samples.push(sample),
                Err(CollectError::ProcessGone(_)) => {}
                Err(e) => {
                    warn!(pid, error = %e, "failed to read process");
                    inspection.gaps.push(pid);
                }
            }
        }
        inspection
    }
}
