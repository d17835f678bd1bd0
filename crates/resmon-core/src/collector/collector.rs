//! Main collector that combines the process tracker and the system sampler.
//!
//! The `Collector` reads host constants once at construction, primes every
//! cumulative baseline, and from then on turns each poll into a batch of
//! [`Metric`] records.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::collector::procfs::{CollectError, ProcfsInspector, SystemSampler};
use crate::collector::tracker::{ProcessTracker, TrackerConfig};
use crate::collector::traits::FileSystem;
use crate::storage::model::{Metric, SystemConstants};
use crate::util::now_millis;

/// Where to read from and how to report cores.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub proc_path: PathBuf,
    pub sys_path: PathBuf,
    /// Report physical instead of logical cores when hyperthreading pairs them.
    pub physical_cores: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
            sys_path: PathBuf::from("/sys"),
            physical_cores: false,
        }
    }
}

/// Timing information for each collector phase.
#[derive(Debug, Clone, Default)]
pub struct CollectorTiming {
    pub total: Duration,
    /// Cpu, memory, network and uptime.
    pub system: Duration,
    pub processes: Duration,
}

pub struct Collector<F: FileSystem + Clone> {
    system: SystemSampler<F>,
    tracker: ProcessTracker<ProcfsInspector<F>>,
    constants: SystemConstants,
    last_timing: Option<CollectorTiming>,
}

impl<F: FileSystem + Clone> Collector<F> {
    pub fn new(fs: F, config: CollectorConfig) -> Result<Self, CollectError> {
        Self::new_at(fs, config, now_millis())
    }

    /// Reads the host constants and primes all baselines at `now`.
    ///
    /// Fails only when the constants cannot be read; a process listing
    /// failure here just leaves the tracker empty.
    pub fn new_at(fs: F, config: CollectorConfig, now: i64) -> Result<Self, CollectError> {
        let mut system = SystemSampler::new(fs.clone(), &config.proc_path, &config.sys_path);
        let constants = system.constants_at(now)?;

        if config.physical_cores {
            system = system.with_physical_cores(&constants);
            if !system.reports_physical_cores() {
                warn!(
                    physical = constants.physical_cores,
                    logical = constants.logical_cores,
                    "cores are not hyperthread pairs, reporting logical cores"
                );
            }
        }
        system.prime(now);

        let inspector = ProcfsInspector::new(fs, &config.proc_path);
        let mut tracker =
            ProcessTracker::new(inspector, TrackerConfig::new(constants.logical_cores));
        if let Err(e) = tracker.prime() {
            warn!(error = %e, "failed to list processes at startup");
        }

        info!(
            total_memory_gb = constants.total_memory,
            logical_cores = constants.logical_cores,
            physical_cores = constants.physical_cores,
            cpu_speed_ghz = constants.cpu_speed,
            "collector initialized"
        );

        Ok(Self {
            system,
            tracker,
            constants,
            last_timing: None,
        })
    }

    /// Host constants read at construction.
    pub fn constants(&self) -> &SystemConstants {
        &self.constants
    }

    pub fn last_timing(&self) -> Option<&CollectorTiming> {
        self.last_timing.as_ref()
    }

    pub fn poll(&mut self) -> Vec<Metric> {
        self.poll_at(now_millis())
    }

    /// Samples every kind over the interval ending at `now`.
    ///
    /// Sources that fail are logged and left out of the batch.
    pub fn poll_at(&mut self, now: i64) -> Vec<Metric> {
        let total_start = Instant::now();
        let mut timing = CollectorTiming::default();

        let start = Instant::now();
        let mut metrics = self.system.sample_at(now);
        timing.system = start.elapsed();

        let start = Instant::now();
        match self.tracker.poll_at(now) {
            Ok(processes) => metrics.extend(processes.into_iter().map(Metric::Processes)),
            Err(e) => warn!(error = %e, "failed to list processes"),
        }
        timing.processes = start.elapsed();

        timing.total = total_start.elapsed();
        debug!(
            records = metrics.len(),
            tracked = self.tracker.tracked(),
            total_us = timing.total.as_micros() as u64,
            "poll complete"
        );
        self.last_timing = Some(timing);
        metrics
    }

    /// Applies `f` to every filesystem handle the collector holds.
    #[cfg(test)]
    fn update_fs(&mut self, f: impl Fn(&mut F)) {
        f(self.system.fs_mut());
        f(self.tracker.source_mut().fs_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;
    use crate::storage::model::{MetricKind, PidState};

    fn host_fs() -> MockFs {
        let mut fs = MockFs::new();
        fs.add_file(
            "/proc/stat",
            "cpu  200 0 200 1600 0 0 0 0\ncpu0 100 0 100 800 0 0 0 0\ncpu1 100 0 100 800 0 0 0 0\nbtime 1700000000\n",
        );
        fs.add_file(
            "/proc/meminfo",
            "MemTotal: 8388608 kB\nMemFree: 1048576 kB\nMemAvailable: 2097152 kB\n",
        );
        fs.add_file("/proc/vmstat", "pswpin 0\n");
        fs.add_file("/proc/uptime", "2000.00 3000.00\n");
        fs.add_file(
            "/proc/net/dev",
            "Inter-| Receive | Transmit\n face |bytes packets|bytes packets\n  eth0: 100 1 0 0 0 0 0 0 100 1 0 0 0 0 0 0\n",
        );
        fs.add_file(
            "/proc/cpuinfo",
            "processor : 0\ncpu MHz : 3000.000\nphysical id : 0\ncore id : 0\n\nprocessor : 1\ncpu MHz : 3000.000\nphysical id : 0\ncore id : 1\n",
        );
        // started 1000s after boot
        fs.add_simple_process(42, "postgres", 100, 0, 100_000, 100, 0, 0);
        fs
    }

    #[test]
    fn test_new_reads_constants() {
        let collector = Collector::new_at(host_fs(), CollectorConfig::default(), 0).unwrap();
        let c = collector.constants();
        assert_eq!(c.total_memory, 8.0);
        assert_eq!(c.logical_cores, 2);
        assert_eq!(c.physical_cores, 2);
        assert_eq!(c.cpu_speed, 3.0);
    }

    #[test]
    fn test_new_fails_without_constants() {
        let mut fs = host_fs();
        fs.remove("/proc/cpuinfo");
        assert!(Collector::new_at(fs, CollectorConfig::default(), 0).is_err());
    }

    #[test]
    fn test_poll_emits_every_kind() {
        let mut collector = Collector::new_at(host_fs(), CollectorConfig::default(), 0).unwrap();

        collector.update_fs(|fs| {
            fs.add_file("/proc/uptime", "2010.00 3010.00\n");
            // 1s more cpu over 10s
            fs.add_simple_process(42, "postgres", 200, 0, 100_000, 100, 0, 0);
            fs.add_simple_process(43, "vacuum", 50, 0, 200_000, 10, 0, 0);
        });
        let metrics = collector.poll_at(10_000);

        let kinds: Vec<MetricKind> = metrics.iter().map(|m| m.kind()).collect();
        for kind in [
            MetricKind::Cpu,
            MetricKind::CpuCore,
            MetricKind::Memory,
            MetricKind::Network,
            MetricKind::SystemMetrics,
            MetricKind::Processes,
        ] {
            assert!(kinds.contains(&kind), "missing {kind}");
        }
        assert!(!kinds.contains(&MetricKind::SystemConstants));

        let processes: Vec<_> = metrics
            .iter()
            .filter_map(|m| match m {
                Metric::Processes(p) => Some((p.pid, p.state)),
                _ => None,
            })
            .collect();
        assert_eq!(
            processes,
            vec![(42, PidState::Running), (43, PidState::New)]
        );

        let running = metrics
            .iter()
            .find_map(|m| match m {
                Metric::Processes(p) if p.pid == 42 => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(running.delta_millis, 10_000);
        // 1000ms cpu over 10000ms on 2 cores
        assert!((running.cpu_usage - 0.05).abs() < 1e-9);
        assert!(collector.last_timing().is_some());
    }

    #[test]
    fn test_poll_reports_ended_process() {
        let mut collector = Collector::new_at(host_fs(), CollectorConfig::default(), 0).unwrap();
        collector.update_fs(|fs| {
            fs.remove("/proc/42");
            fs.add_file("/proc/uptime", "2010.00 3010.00\n");
        });

        let metrics = collector.poll_at(10_000);
        let ended: Vec<_> = metrics
            .iter()
            .filter_map(|m| match m {
                Metric::Processes(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].state, PidState::Ended);
        assert_eq!(ended[0].timestamp, 10_000);

        // Reported once only
        let metrics = collector.poll_at(20_000);
        assert!(metrics.iter().all(|m| !matches!(m, Metric::Processes(_))));
    }

    #[test]
    fn test_physical_cores_only_for_hyperthread_pairs() {
        let config = CollectorConfig {
            physical_cores: true,
            ..CollectorConfig::default()
        };
        let mut collector = Collector::new_at(host_fs(), config, 0).unwrap();
        let cores = collector
            .poll_at(10_000)
            .iter()
            .filter(|m| matches!(m, Metric::CpuCore(_)))
            .count();
        assert_eq!(cores, 2);
    }
}
