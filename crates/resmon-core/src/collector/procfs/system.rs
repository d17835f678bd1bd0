//! Host-wide samplers: cpu, per-core cpu, memory, network and uptime, plus
//! the static system constants.
//!
//! Counters read from `/proc` are cumulative; the sampler keeps the previous
//! reading and reports rates over the interval since the last sample.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::collector::procfs::CollectError;
use crate::collector::procfs::parser::{
    CpuStat, GlobalStat, NetDevStats, parse_cpu_list, parse_cpuinfo, parse_global_stat,
    parse_meminfo, parse_net_dev, parse_uptime, parse_vmstat,
};
use crate::collector::traits::FileSystem;
use crate::storage::model::{
    CpuCoreData, CpuData, MemoryData, Metric, NetworkData, SystemConstants, SystemData,
};

/// Interfaces whose counters have not moved for this long stop counting
/// towards throughput.
const IDLE_INTERFACE_MS: i64 = 5 * 60 * 1000;

const BYTES_PER_GB: f64 = 1_073_741_824.0;

#[derive(Debug, Clone, Default)]
struct InterfaceState {
    rx_bytes: u64,
    tx_bytes: u64,
    idle_ms: i64,
}

pub struct SystemSampler<F: FileSystem> {
    fs: F,
    proc_path: PathBuf,
    sys_path: PathBuf,
    /// Average hyperthread pairs into physical cores.
    report_physical_cores: bool,
    prev_stat: Option<GlobalStat>,
    prev_swap_in: Option<u64>,
    interfaces: HashMap<String, InterfaceState>,
    last_sample: Option<i64>,
}

impl<F: FileSystem> SystemSampler<F> {
    pub fn new(fs: F, proc_path: impl Into<PathBuf>, sys_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
            sys_path: sys_path.into(),
            report_physical_cores: false,
            prev_stat: None,
            prev_swap_in: None,
            interfaces: HashMap::new(),
            last_sample: None,
        }
    }

    /// Reports per physical core, only honored when every physical core has
    /// exactly two logical siblings.
    pub fn with_physical_cores(mut self, constants: &SystemConstants) -> Self {
        self.report_physical_cores = constants.physical_cores * 2 == constants.logical_cores;
        self
    }

    pub fn reports_physical_cores(&self) -> bool {
        self.report_physical_cores
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    fn read_proc(&self, name: &str) -> Result<String, CollectError> {
        Ok(self.fs.read_to_string(&self.proc_path.join(name))?)
    }

    /// Reads memory size and processor topology.
    pub fn constants_at(&self, now: i64) -> Result<SystemConstants, CollectError> {
        let meminfo = parse_meminfo(&self.read_proc("meminfo")?)?;
        let cpuinfo = parse_cpuinfo(&self.read_proc("cpuinfo")?)?;

        let total_bytes = meminfo.mem_total as f64 * 1024.0;
        Ok(SystemConstants {
            total_memory: (10.0 * total_bytes / BYTES_PER_GB).round() / 10.0,
            physical_cores: cpuinfo.physical_cores,
            logical_cores: cpuinfo.logical_cores,
            cpu_speed: (cpuinfo.mhz / 10.0).round() / 100.0,
            timestamp: now,
        })
    }

    /// Records current counters as the baseline for the first interval.
    pub fn prime(&mut self, now: i64) {
        self.prev_stat = self.read_global_stat().ok();
        self.prev_swap_in = self.read_swap_in().ok();
        if let Ok(devices) = self.read_net_dev() {
            for dev in devices {
                self.interfaces.insert(
                    dev.interface,
                    InterfaceState {
                        rx_bytes: dev.rx_bytes,
                        tx_bytes: dev.tx_bytes,
                        idle_ms: 0,
                    },
                );
            }
        }
        self.last_sample = Some(now);
    }

    /// Samples every host-wide kind over the interval ending at `now`.
    ///
    /// A kind whose source cannot be read is skipped with a warning. The
    /// first call only primes the baselines.
    pub fn sample_at(&mut self, now: i64) -> Vec<Metric> {
        let Some(last) = self.last_sample else {
            self.prime(now);
            return Vec::new();
        };
        let delta_millis = now - last;
        if delta_millis <= 0 {
            debug!(delta_millis, "sampling interval too short, skipping");
            return Vec::new();
        }
        self.last_sample = Some(now);

        let mut metrics = Vec::new();

        match self.sample_cpu(delta_millis, now) {
            Ok((cpu, cores)) => {
                metrics.push(Metric::Cpu(cpu));
                metrics.extend(cores.into_iter().map(Metric::CpuCore));
            }
            Err(e) => warn!(error = %e, "failed to sample cpu"),
        }
        match self.sample_memory(delta_millis, now) {
            Ok(memory) => metrics.push(Metric::Memory(memory)),
            Err(e) => warn!(error = %e, "failed to sample memory"),
        }
        match self.sample_network(delta_millis, now) {
            Ok(network) => metrics.push(Metric::Network(network)),
            Err(e) => warn!(error = %e, "failed to sample network"),
        }
        match self.sample_uptime(delta_millis, now) {
            Ok(system) => metrics.push(Metric::SystemMetrics(system)),
            Err(e) => warn!(error = %e, "failed to sample uptime"),
        }

        metrics
    }

    fn read_global_stat(&self) -> Result<GlobalStat, CollectError> {
        Ok(parse_global_stat(&self.read_proc("stat")?)?)
    }

    fn read_swap_in(&self) -> Result<u64, CollectError> {
        Ok(parse_vmstat(&self.read_proc("vmstat")?)?.pswpin)
    }

    fn read_net_dev(&self) -> Result<Vec<NetDevStats>, CollectError> {
        let devices = parse_net_dev(&self.read_proc("net/dev")?)?;
        Ok(devices.into_iter().filter(|d| d.interface != "lo").collect())
    }

    fn sample_cpu(
        &mut self,
        delta_millis: i64,
        now: i64,
    ) -> Result<(CpuData, Vec<CpuCoreData>), CollectError> {
        let current = self.read_global_stat()?;
        let previous = self.prev_stat.replace(current.clone());

        let by_cpu: BTreeMap<u32, f64> = current
            .cores()
            .filter_map(|core| {
                let before = previous
                    .as_ref()
                    .and_then(|p| p.cores().find(|c| c.cpu_id == core.cpu_id));
                Some((core.cpu_id?, core_usage(before, core)))
            })
            .collect();

        let usages: Vec<f64> = if self.report_physical_cores {
            let cpu_ids: Vec<u32> = by_cpu.keys().copied().collect();
            self.physical_core_groups(&cpu_ids)
                .iter()
                .map(|group| {
                    let busy: f64 = group.iter().filter_map(|cpu| by_cpu.get(cpu)).sum();
                    busy / group.len() as f64
                })
                .collect()
        } else {
            by_cpu.into_values().collect()
        };

        let utilization = if usages.is_empty() {
            0.0
        } else {
            usages.iter().sum::<f64>() / usages.len() as f64
        };

        let cores = usages
            .into_iter()
            .enumerate()
            .map(|(core_id, core_utilization)| CpuCoreData {
                core_id: core_id as u32,
                core_utilization,
                delta_millis,
                timestamp: now,
            })
            .collect();

        Ok((
            CpuData {
                utilization,
                temperature: self.cpu_temperature(),
                delta_millis,
                timestamp: now,
            },
            cores,
        ))
    }

    /// Package temperature in °C from the thermal zones, 0.0 when unavailable.
    fn cpu_temperature(&self) -> f64 {
        let thermal = self.sys_path.join("class/thermal");
        let Ok(mut zones) = self.fs.read_dir(&thermal) else {
            return 0.0;
        };
        zones.retain(|z| {
            z.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("thermal_zone"))
        });
        zones.sort();

        let read_temp = |zone: &Path| -> Option<f64> {
            let millis: f64 = self
                .fs
                .read_to_string(&zone.join("temp"))
                .ok()?
                .trim()
                .parse()
                .ok()?;
            Some(millis / 1000.0)
        };
        let is_cpu_zone = |zone: &Path| {
            self.fs
                .read_to_string(&zone.join("type"))
                .map(|t| {
                    let t = t.trim();
                    t == "x86_pkg_temp" || t.contains("cpu")
                })
                .unwrap_or(false)
        };

        zones
            .iter()
            .find(|z| is_cpu_zone(z))
            .or(zones.first())
            .and_then(|z| read_temp(z))
            .unwrap_or(0.0)
    }

    fn sample_memory(&mut self, delta_millis: i64, now: i64) -> Result<MemoryData, CollectError> {
        let meminfo = parse_meminfo(&self.read_proc("meminfo")?)?;
        let utilization = 1.0 - meminfo.mem_available as f64 / meminfo.mem_total as f64;

        let swap_in = self.read_swap_in()?;
        let pages = self
            .prev_swap_in
            .replace(swap_in)
            .map_or(0, |prev| swap_in.saturating_sub(prev));

        Ok(MemoryData::from_counters(utilization, pages, delta_millis, now))
    }

    fn sample_network(&mut self, delta_millis: i64, now: i64) -> Result<NetworkData, CollectError> {
        let devices = self.read_net_dev()?;

        let mut sent = 0u64;
        let mut received = 0u64;
        let mut speed_bps = 0u64;

        for dev in devices {
            let Some(state) = self.interfaces.get(&dev.interface).cloned() else {
                // Appeared since the last sample; counted from the next one
                self.interfaces.insert(
                    dev.interface.clone(),
                    InterfaceState {
                        rx_bytes: dev.rx_bytes,
                        tx_bytes: dev.tx_bytes,
                        idle_ms: 0,
                    },
                );
                continue;
            };

            if state.idle_ms < IDLE_INTERFACE_MS && (dev.tx_bytes != 0 || dev.rx_bytes != 0) {
                sent += dev.tx_bytes.saturating_sub(state.tx_bytes);
                received += dev.rx_bytes.saturating_sub(state.rx_bytes);
                speed_bps += self.link_speed_bps(&dev.interface);
            }

            let updated = if dev.tx_bytes == state.tx_bytes && dev.rx_bytes == state.rx_bytes {
                InterfaceState {
                    idle_ms: state.idle_ms + delta_millis,
                    ..state
                }
            } else {
                InterfaceState {
                    rx_bytes: dev.rx_bytes,
                    tx_bytes: dev.tx_bytes,
                    idle_ms: 0,
                }
            };
            self.interfaces.insert(dev.interface, updated);
        }

        Ok(NetworkData::from_counters(
            sent,
            received,
            speed_bps,
            delta_millis,
            now,
        ))
    }

    /// Groups logical cpus into physical cores by their
    /// `topology/thread_siblings_list`, ordered by the lowest sibling id.
    /// Without readable topology, adjacent ids are paired.
    fn physical_core_groups(&self, cpu_ids: &[u32]) -> Vec<Vec<u32>> {
        let mut groups: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for &cpu in cpu_ids {
            let path = self
                .sys_path
                .join(format!("devices/system/cpu/cpu{cpu}/topology/thread_siblings_list"));
            let first_sibling = self
                .fs
                .read_to_string(&path)
                .ok()
                .and_then(|content| parse_cpu_list(&content).ok())
                .and_then(|siblings| siblings.into_iter().min());
            match first_sibling {
                Some(first) => groups.entry(first).or_default().push(cpu),
                None => {
                    debug!(cpu, "no thread sibling topology, pairing adjacent cpus");
                    return cpu_ids.chunks(2).map(<[u32]>::to_vec).collect();
                }
            }
        }
        groups.into_values().collect()
    }

    /// Negotiated link speed from `/sys/class/net/<if>/speed` (Mbit/s).
    fn link_speed_bps(&self, interface: &str) -> u64 {
        let path = self.sys_path.join("class/net").join(interface).join("speed");
        self.fs
            .read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .filter(|mbps| *mbps > 0)
            .map_or(0, |mbps| mbps as u64 * 1_000_000)
    }

    fn sample_uptime(&self, delta_millis: i64, now: i64) -> Result<SystemData, CollectError> {
        let seconds = parse_uptime(&self.read_proc("uptime")?)?;
        Ok(SystemData {
            up_time: seconds.trunc(),
            delta_millis,
            timestamp: now,
        })
    }
}

/// Busy share of one core between two readings.
fn core_usage(before: Option<&CpuStat>, after: &CpuStat) -> f64 {
    let (total, idle) = match before {
        Some(b) => (
            after.total().saturating_sub(b.total()),
            after.idle_total().saturating_sub(b.idle_total()),
        ),
        None => (after.total(), after.idle_total()),
    };
    if total == 0 {
        return 0.0;
    }
    1.0 - idle as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    const NET_HEADER: &str = "Inter-|   Receive                                                |  Transmit\n face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n";

    fn net_dev(eth0_rx: u64, eth0_tx: u64) -> String {
        format!(
            "{NET_HEADER}    lo: 500 5 0 0 0 0 0 0 500 5 0 0 0 0 0 0\n  eth0: {eth0_rx} 10 0 0 0 0 0 0 {eth0_tx} 10 0 0 0 0 0 0\n"
        )
    }

    fn host_fs() -> MockFs {
        let mut fs = MockFs::new();
        fs.add_file(
            "/proc/stat",
            "cpu  200 0 200 1600 0 0 0 0\ncpu0 100 0 100 800 0 0 0 0\ncpu1 100 0 100 800 0 0 0 0\nbtime 1700000000\n",
        );
        fs.add_file(
            "/proc/meminfo",
            "MemTotal: 16777216 kB\nMemFree: 4194304 kB\nMemAvailable: 8388608 kB\n",
        );
        fs.add_file("/proc/vmstat", "pswpin 100\npswpout 0\n");
        fs.add_file("/proc/uptime", "3600.75 7000.00\n");
        fs.add_file("/proc/net/dev", net_dev(1_000, 2_000));
        fs.add_file(
            "/proc/cpuinfo",
            "processor : 0\ncpu MHz : 2793.437\nphysical id : 0\ncore id : 0\n\nprocessor : 1\ncpu MHz : 2793.437\nphysical id : 0\ncore id : 0\n",
        );
        fs.add_file("/sys/class/net/eth0/speed", "1000\n");
        fs.add_file("/sys/class/thermal/thermal_zone0/type", "acpitz\n");
        fs.add_file("/sys/class/thermal/thermal_zone0/temp", "30000\n");
        fs.add_file("/sys/class/thermal/thermal_zone1/type", "x86_pkg_temp\n");
        fs.add_file("/sys/class/thermal/thermal_zone1/temp", "52500\n");
        fs
    }

    fn sampler(fs: MockFs) -> SystemSampler<MockFs> {
        let mut s = SystemSampler::new(fs, "/proc", "/sys");
        s.prime(0);
        s
    }

    fn find<T>(metrics: &[Metric], pick: impl Fn(&Metric) -> Option<&T>) -> &T {
        metrics.iter().find_map(pick).unwrap()
    }

    #[test]
    fn test_constants() {
        let s = SystemSampler::new(host_fs(), "/proc", "/sys");
        let c = s.constants_at(42).unwrap();
        assert_eq!(c.total_memory, 16.0);
        assert_eq!(c.logical_cores, 2);
        assert_eq!(c.physical_cores, 1);
        assert_eq!(c.cpu_speed, 2.79);
        assert_eq!(c.timestamp, 42);
    }

    #[test]
    fn test_cpu_usage_from_tick_deltas() {
        let mut s = sampler(host_fs());
        // cpu0: 50 busy of 100; cpu1: 0 busy of 100
        s.fs_mut().add_file(
            "/proc/stat",
            "cpu  250 0 200 1750 0 0 0 0\ncpu0 150 0 100 850 0 0 0 0\ncpu1 100 0 100 900 0 0 0 0\nbtime 1700000000\n",
        );
        let metrics = s.sample_at(10_000);

        let cpu = find(&metrics, |m| match m {
            Metric::Cpu(c) => Some(c),
            _ => None,
        });
        assert_eq!(cpu.utilization, 0.25);
        assert_eq!(cpu.temperature, 52.5);
        assert_eq!(cpu.delta_millis, 10_000);

        let cores: Vec<_> = metrics
            .iter()
            .filter_map(|m| match m {
                Metric::CpuCore(c) => Some((c.core_id, c.core_utilization)),
                _ => None,
            })
            .collect();
        assert_eq!(cores, vec![(0, 0.5), (1, 0.0)]);
    }

    #[test]
    fn test_physical_core_reduction() {
        let fs = host_fs();
        let constants = SystemSampler::new(fs.clone(), "/proc", "/sys")
            .constants_at(0)
            .unwrap();
        let mut s = sampler(fs).with_physical_cores(&constants);
        assert!(s.reports_physical_cores());

        s.fs_mut().add_file(
            "/proc/stat",
            "cpu  250 0 200 1750 0 0 0 0\ncpu0 150 0 100 850 0 0 0 0\ncpu1 100 0 100 900 0 0 0 0\nbtime 1700000000\n",
        );
        let metrics = s.sample_at(10_000);
        let cores: Vec<_> = metrics
            .iter()
            .filter_map(|m| match m {
                Metric::CpuCore(c) => Some((c.core_id, c.core_utilization)),
                _ => None,
            })
            .collect();
        assert_eq!(cores, vec![(0, 0.25)]);
    }

    #[test]
    fn test_physical_cores_follow_thread_siblings() {
        let mut fs = host_fs();
        fs.add_file(
            "/proc/stat",
            "cpu  0 0 0 0 0 0 0 0
cpu0 0 0 0 0 0 0 0 0
cpu1 0 0 0 0 0 0 0 0
cpu2 0 0 0 0 0 0 0 0
cpu3 0 0 0 0 0 0 0 0
btime 1700000000
",
        );
        for (cpu, siblings) in [(0, "0,2"), (1, "1,3"), (2, "0,2"), (3, "1,3")] {
            fs.add_file(
                format!("/sys/devices/system/cpu/cpu{cpu}/topology/thread_siblings_list"),
                format!("{siblings}\n"),
            );
        }
        let constants = SystemConstants {
            physical_cores: 2,
            logical_cores: 4,
            ..Default::default()
        };
        let mut s = sampler(fs).with_physical_cores(&constants);

        // cpu0 and cpu2 fully busy, cpu1 and cpu3 idle
        s.fs_mut().add_file(
            "/proc/stat",
            "cpu  200 0 0 200 0 0 0 0
cpu0 100 0 0 0 0 0 0 0
cpu1 0 0 0 100 0 0 0 0
cpu2 100 0 0 0 0 0 0 0
cpu3 0 0 0 100 0 0 0 0
btime 1700000000
",
        );
        let metrics = s.sample_at(10_000);
        let cores: Vec<_> = metrics
            .iter()
            .filter_map(|m| match m {
                Metric::CpuCore(c) => Some((c.core_id, c.core_utilization)),
                _ => None,
            })
            .collect();
        assert_eq!(cores, vec![(0, 1.0), (1, 0.0)]);
    }

    #[test]
    fn test_memory_and_swap_rate() {
        let mut s = sampler(host_fs());
        s.fs_mut().add_file("/proc/vmstat", "pswpin 150\n");
        let metrics = s.sample_at(10_000);

        let memory = find(&metrics, |m| match m {
            Metric::Memory(d) => Some(d),
            _ => None,
        });
        assert_eq!(memory.utilization, 0.5);
        assert_eq!(memory.page_faults, 5.0);
    }

    #[test]
    fn test_network_counts_active_interfaces() {
        let mut s = sampler(host_fs());
        s.fs_mut().add_file("/proc/net/dev", net_dev(11_000, 4_500));
        let metrics = s.sample_at(10_000);

        let net = find(&metrics, |m| match m {
            Metric::Network(n) => Some(n),
            _ => None,
        });
        // loopback excluded; bytes/ms * 8 = kbit/s
        assert_eq!(net.receive, 10_000.0 / 10_000.0 * 8.0);
        assert_eq!(net.send, 2_500.0 / 10_000.0 * 8.0);
        assert_eq!(net.throughput, 1_000_000.0);
    }

    #[test]
    fn test_idle_interface_drops_out_after_five_minutes() {
        let mut s = sampler(host_fs());
        let mut now = 0;
        for _ in 0..31 {
            now += 10_000;
            s.sample_at(now);
        }
        // 310s without counter movement
        s.fs_mut().add_file("/proc/net/dev", net_dev(2_000, 2_000));
        let metrics = s.sample_at(now + 10_000);
        let net = find(&metrics, |m| match m {
            Metric::Network(n) => Some(n),
            _ => None,
        });
        assert_eq!(net.receive, 0.0);
        assert_eq!(net.throughput, 0.0);

        // Movement resets the idle clock
        let metrics = s.sample_at(now + 20_000);
        let net = find(&metrics, |m| match m {
            Metric::Network(n) => Some(n),
            _ => None,
        });
        assert_eq!(net.throughput, 1_000_000.0);
    }

    #[test]
    fn test_uptime_and_zero_interval() {
        let mut s = sampler(host_fs());
        assert!(s.sample_at(0).is_empty());

        let metrics = s.sample_at(5_000);
        let system = find(&metrics, |m| match m {
            Metric::SystemMetrics(d) => Some(d),
            _ => None,
        });
        assert_eq!(system.up_time, 3600.0);
        assert_eq!(system.delta_millis, 5_000);
    }

    #[test]
    fn test_missing_source_skips_only_that_kind() {
        let mut fs = host_fs();
        fs.remove("/proc/vmstat");
        let mut s = sampler(fs);
        let metrics = s.sample_at(10_000);

        assert!(metrics.iter().all(|m| !matches!(m, Metric::Memory(_))));
        assert!(metrics.iter().any(|m| matches!(m, Metric::Cpu(_))));
        assert!(metrics.iter().any(|m| matches!(m, Metric::SystemMetrics(_))));
    }
}
