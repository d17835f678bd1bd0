//! Parsers for `/proc` filesystem files.
//!
//! These are pure functions that parse the content of various `/proc` files
//! into structured data. They are designed to be easily testable with string inputs.

use std::collections::HashSet;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// Fields of `/proc/[pid]/stat` used for process sampling.
#[derive(Debug, Clone, Default)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub state: char,
    /// User-mode time in clock ticks.
    pub utime: u64,
    /// Kernel-mode time in clock ticks.
    pub stime: u64,
    /// Start time after boot in clock ticks.
    pub starttime: u64,
    /// Resident set size in pages.
    pub rss: i64,
}

/// Parses `/proc/[pid]/stat` content.
///
/// The comm field can contain spaces and parentheses, so fields are counted
/// from the last `)`.
/// Format: pid (comm) state ppid pgrp session tty_nr ...
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, ParseError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;

    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: u32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;

    let comm = content[open_paren + 1..close_paren].to_string();

    // fields[0] is state, fields[21] is rss
    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();
    if fields.len() < 22 {
        return Err(ParseError::new(format!(
            "not enough fields in stat: expected 22+, got {}",
            fields.len()
        )));
    }

    let parse_u64 = |idx: usize, name: &str| -> Result<u64, ParseError> {
        fields[idx]
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    };

    Ok(ProcStat {
        pid,
        comm,
        state: fields[0].chars().next().unwrap_or('?'),
        utime: parse_u64(11, "utime")?,
        stime: parse_u64(12, "stime")?,
        starttime: parse_u64(19, "starttime")?,
        rss: fields[21]
            .parse()
            .map_err(|_| ParseError::new("invalid rss"))?,
    })
}

/// Parsed data from `/proc/[pid]/io`.
#[derive(Debug, Clone, Default)]
pub struct ProcIo {
    pub rchar: u64,
    pub wchar: u64,
    /// Bytes fetched from the storage layer.
    pub read_bytes: u64,
    /// Bytes sent to the storage layer.
    pub write_bytes: u64,
}

/// Parses `/proc/[pid]/io` content.
///
/// Format is key: value pairs, one per line.
pub fn parse_proc_io(content: &str) -> Result<ProcIo, ParseError> {
    let mut io = ProcIo::default();

    for line in content.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let value: u64 = value.trim().parse().unwrap_or(0);
            match key.trim() {
                "rchar" => io.rchar = value,
                "wchar" => io.wchar = value,
                "read_bytes" => io.read_bytes = value,
                "write_bytes" => io.write_bytes = value,
                _ => {}
            }
        }
    }

    Ok(io)
}

/// Parsed data from `/proc/meminfo`, in KB.
#[derive(Debug, Clone, Default)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
}

/// Parses `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();

    let parse_kb = |line: &str| -> u64 {
        line.split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            info.mem_total = parse_kb(line);
        } else if line.starts_with("MemFree:") {
            info.mem_free = parse_kb(line);
        } else if line.starts_with("MemAvailable:") {
            info.mem_available = parse_kb(line);
        }
    }

    if info.mem_total == 0 {
        return Err(ParseError::new("MemTotal missing from meminfo"));
    }
    // Kernels before 3.14 have no MemAvailable
    if info.mem_available == 0 {
        info.mem_available = info.mem_free;
    }

    Ok(info)
}

/// Single CPU line from `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuStat {
    pub cpu_id: Option<u32>, // None for aggregate "cpu" line
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStat {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Ticks not spent doing work.
    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Global stats from `/proc/stat`.
#[derive(Debug, Clone, Default)]
pub struct GlobalStat {
    pub cpus: Vec<CpuStat>,
    /// Boot time, seconds since epoch.
    pub btime: u64,
}

impl GlobalStat {
    /// Per-core lines, without the aggregate.
    pub fn cores(&self) -> impl Iterator<Item = &CpuStat> {
        self.cpus.iter().filter(|c| c.cpu_id.is_some())
    }
}

/// Parses `/proc/stat` content.
pub fn parse_global_stat(content: &str) -> Result<GlobalStat, ParseError> {
    let mut stat = GlobalStat::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        if parts[0].starts_with("cpu") {
            let cpu_id = if parts[0] == "cpu" {
                None
            } else {
                parts[0].strip_prefix("cpu").and_then(|s| s.parse().ok())
            };

            let get_val =
                |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

            stat.cpus.push(CpuStat {
                cpu_id,
                user: get_val(1),
                nice: get_val(2),
                system: get_val(3),
                idle: get_val(4),
                iowait: get_val(5),
                irq: get_val(6),
                softirq: get_val(7),
                steal: get_val(8),
            });
        } else if parts[0] == "btime" {
            stat.btime = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
        }
    }

    if stat.cpus.is_empty() {
        return Err(ParseError::new("no cpu lines in stat"));
    }

    Ok(stat)
}

/// Parsed data from `/proc/net/dev`.
#[derive(Debug, Clone, Default)]
pub struct NetDevStats {
    /// Interface name (eth0, lo, etc.)
    pub interface: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Parses `/proc/net/dev` content.
///
/// Format:
/// Inter-|   Receive                                                |  Transmit
///  face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
///    lo: 1234567     1234    0    0    0     0          0         0  1234567     1234    0    0    0     0       0          0
pub fn parse_net_dev(content: &str) -> Result<Vec<NetDevStats>, ParseError> {
    let mut devices = Vec::new();

    for line in content.lines() {
        if line.contains('|') || line.trim().is_empty() {
            continue;
        }

        let Some((interface, counters)) = line.split_once(':') else {
            continue;
        };
        let values: Vec<&str> = counters.split_whitespace().collect();
        if values.len() < 16 {
            continue;
        }

        let get_val =
            |idx: usize| -> u64 { values.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        devices.push(NetDevStats {
            interface: interface.trim().to_string(),
            rx_bytes: get_val(0),
            rx_packets: get_val(1),
            tx_bytes: get_val(8),
            tx_packets: get_val(9),
        });
    }

    Ok(devices)
}

/// Swap counters from `/proc/vmstat`, in pages.
#[derive(Debug, Clone, Default)]
pub struct VmstatInfo {
    pub pswpin: u64,
    pub pswpout: u64,
}

/// Parses `/proc/vmstat` content.
///
/// Format: key value (one per line)
pub fn parse_vmstat(content: &str) -> Result<VmstatInfo, ParseError> {
    let mut info = VmstatInfo::default();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match key {
            "pswpin" => info.pswpin = value,
            "pswpout" => info.pswpout = value,
            _ => {}
        }
    }

    Ok(info)
}

/// Parses `/proc/uptime` and returns seconds since boot.
pub fn parse_uptime(content: &str) -> Result<f64, ParseError> {
    content
        .split_whitespace()
        .next()
        .ok_or_else(|| ParseError::new("empty uptime"))?
        .parse()
        .map_err(|_| ParseError::new("invalid uptime"))
}

/// Parses a sysfs cpu list such as `0,4` or `0-3,8`.
pub fn parse_cpu_list(content: &str) -> Result<Vec<u32>, ParseError> {
    let mut cpus = Vec::new();
    for part in content.trim().split(',').filter(|p| !p.is_empty()) {
        let invalid = || ParseError::new(format!("invalid cpu list entry: {}", part));
        match part.split_once('-') {
            Some((first, last)) => {
                let first: u32 = first.parse().map_err(|_| invalid())?;
                let last: u32 = last.parse().map_err(|_| invalid())?;
                if last < first {
                    return Err(invalid());
                }
                cpus.extend(first..=last);
            }
            None => cpus.push(part.parse().map_err(|_| invalid())?),
        }
    }
    if cpus.is_empty() {
        return Err(ParseError::new("empty cpu list"));
    }
    Ok(cpus)
}

/// Processor topology from `/proc/cpuinfo`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuInfo {
    pub logical_cores: u32,
    /// Distinct `(physical id, core id)` pairs; falls back to logical count.
    pub physical_cores: u32,
    /// Nominal clock of the first processor, MHz.
    pub mhz: f64,
}

/// Parses `/proc/cpuinfo` content.
pub fn parse_cpuinfo(content: &str) -> Result<CpuInfo, ParseError> {
    let mut logical = 0u32;
    let mut cores: HashSet<(String, String)> = HashSet::new();
    let mut physical_id = String::new();
    let mut mhz = 0.0;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "processor" => logical += 1,
            "physical id" => physical_id = value.to_string(),
            "core id" => {
                cores.insert((physical_id.clone(), value.to_string()));
            }
            "cpu MHz" if mhz == 0.0 => mhz = value.parse().unwrap_or(0.0),
            _ => {}
        }
    }

    if logical == 0 {
        return Err(ParseError::new("no processors in cpuinfo"));
    }

    let physical_cores = if cores.is_empty() {
        logical
    } else {
        cores.len() as u32
    };

    Ok(CpuInfo {
        logical_cores: logical,
        physical_cores,
        mhz,
    })
}
