//! Duration-weighted merging of metric records.
//!
//! A group of records covering consecutive intervals is merged into one record
//! whose `delta_millis` is the exact sum of the inputs and whose every numeric
//! field (the timestamp included) is the average weighted by `delta_millis`.
//! The mean is computed incrementally:
//!
//! ```text
//! agg <- agg + (value - agg) * (delta / (weight + delta))
//! weight <- weight + delta
//! ```
//!
//! Groups are always iterated in chronological order so the floating-point
//! result does not depend on the order rows come back from storage.
//!
//! Grouping rules depend on the kind:
//! - per-core records are grouped by `core_id`;
//! - process records are grouped by lineage: a NEW or RECYCLED record starts a
//!   new group for its pid, RUNNING records extend it and ENDED sentinels are
//!   passed through untouched.

use std::collections::BTreeMap;

use crate::storage::model::{
    CpuCoreData, CpuData, MemoryData, Metric, MetricKind, NetworkData, PidState, ProcessData,
    Sample, SystemData,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CombineError {
    #[error("cannot combine an empty group")]
    Empty,

    #[error("record at {timestamp} has non-positive interval {delta_millis}ms")]
    InvalidInterval { timestamp: i64, delta_millis: i64 },

    #[error("{found} record in a {expected} group")]
    MixedKinds {
        expected: MetricKind,
        found: MetricKind,
    },

    #[error("{0} records are not combinable")]
    NotCombinable(MetricKind),
}

/// One step of the incremental weighted mean.
///
/// `agg` is the mean of inputs totalling `agg_weight` ms; the result is the
/// mean after folding in `value` observed over `weight` ms.
pub fn weighted_average(agg: f64, agg_weight: i64, value: f64, weight: i64) -> f64 {
    let w = weight as f64;
    agg + (value - agg) * (w / (w + agg_weight as f64))
}

/// Running state for `N` averaged fields plus the timestamp.
struct Accumulator<const N: usize> {
    weight: i64,
    timestamp: f64,
    fields: [f64; N],
}

impl<const N: usize> Accumulator<N> {
    fn new() -> Self {
        Self {
            weight: 0,
            timestamp: 0.0,
            fields: [0.0; N],
        }
    }

    fn add<T: Sample>(&mut self, record: &T, values: [f64; N]) -> Result<(), CombineError> {
        let delta = record.delta_millis();
        if delta <= 0 {
            return Err(CombineError::InvalidInterval {
                timestamp: record.timestamp(),
                delta_millis: delta,
            });
        }
        self.timestamp =
            weighted_average(self.timestamp, self.weight, record.timestamp() as f64, delta);
        for (agg, value) in self.fields.iter_mut().zip(values) {
            *agg = weighted_average(*agg, self.weight, value, delta);
        }
        self.weight += delta;
        Ok(())
    }

    /// Returns `(delta_millis, timestamp, fields)`.
    fn finish(self) -> (i64, i64, [f64; N]) {
        (self.weight, self.timestamp.round() as i64, self.fields)
    }
}

/// Sorts a group chronologically. Ties keep their input order.
fn chronological<'a, T, I>(group: I) -> Result<Vec<&'a T>, CombineError>
where
    T: Sample + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut sorted: Vec<&T> = group.into_iter().collect();
    if sorted.is_empty() {
        return Err(CombineError::Empty);
    }
    sorted.sort_by_key(|m| m.timestamp());
    Ok(sorted)
}

/// Merges a group of same-kind records into a single record.
pub trait Combine: Sample + Sized {
    fn combine<'a, I>(group: I) -> Result<Self, CombineError>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a;
}

impl Combine for CpuData {
    fn combine<'a, I>(group: I) -> Result<Self, CombineError>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        let mut acc = Accumulator::<2>::new();
        for m in chronological(group)? {
            acc.add(m, [m.utilization, m.temperature])?;
        }
        let (delta_millis, timestamp, [utilization, temperature]) = acc.finish();
        Ok(CpuData {
            utilization,
            temperature,
            delta_millis,
            timestamp,
        })
    }
}

impl Combine for CpuCoreData {
    /// All records are expected to share one `core_id`; the first one wins.
    fn combine<'a, I>(group: I) -> Result<Self, CombineError>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        let sorted = chronological(group)?;
        let core_id = sorted[0].core_id;
        let mut acc = Accumulator::<1>::new();
        for m in sorted {
            acc.add(m, [m.core_utilization])?;
        }
        let (delta_millis, timestamp, [core_utilization]) = acc.finish();
        Ok(CpuCoreData {
            core_id,
            core_utilization,
            delta_millis,
            timestamp,
        })
    }
}

impl Combine for MemoryData {
    fn combine<'a, I>(group: I) -> Result<Self, CombineError>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        let mut acc = Accumulator::<2>::new();
        for m in chronological(group)? {
            acc.add(m, [m.utilization, m.page_faults])?;
        }
        let (delta_millis, timestamp, [utilization, page_faults]) = acc.finish();
        Ok(MemoryData {
            utilization,
            page_faults,
            delta_millis,
            timestamp,
        })
    }
}

impl Combine for NetworkData {
    fn combine<'a, I>(group: I) -> Result<Self, CombineError>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        let mut acc = Accumulator::<3>::new();
        for m in chronological(group)? {
            acc.add(m, [m.send, m.receive, m.throughput])?;
        }
        let (delta_millis, timestamp, [send, receive, throughput]) = acc.finish();
        Ok(NetworkData {
            send,
            receive,
            throughput,
            delta_millis,
            timestamp,
        })
    }
}

impl Combine for SystemData {
    fn combine<'a, I>(group: I) -> Result<Self, CombineError>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        let mut acc = Accumulator::<1>::new();
        for m in chronological(group)? {
            acc.add(m, [m.up_time])?;
        }
        let (delta_millis, timestamp, [up_time]) = acc.finish();
        Ok(SystemData {
            up_time,
            delta_millis,
            timestamp,
        })
    }
}

impl Combine for ProcessData {
    /// Merges one lineage. Identity fields (`pid`, `name`, `start_time`,
    /// `state`) come from the chronologically first record.
    fn combine<'a, I>(group: I) -> Result<Self, CombineError>
    where
        I: IntoIterator<Item = &'a Self>,
        Self: 'a,
    {
        let sorted = chronological(group)?;
        let first = sorted[0];
        let mut acc = Accumulator::<5>::new();
        for m in &sorted {
            acc.add(*m, [m.up_time, m.cpu_usage, m.memory, m.kb_read, m.kb_written])?;
        }
        let (delta_millis, timestamp, [up_time, cpu_usage, memory, kb_read, kb_written]) =
            acc.finish();
        Ok(ProcessData {
            pid: first.pid,
            name: first.name.clone(),
            start_time: first.start_time,
            up_time,
            cpu_usage,
            memory,
            kb_read,
            kb_written,
            state: first.state,
            delta_millis,
            timestamp,
        })
    }
}

/// Combines per-core records, one output per `core_id`, ordered by core id.
pub fn combine_cores(records: &[CpuCoreData]) -> Result<Vec<CpuCoreData>, CombineError> {
    if records.is_empty() {
        return Err(CombineError::Empty);
    }
    let mut by_core: BTreeMap<u32, Vec<&CpuCoreData>> = BTreeMap::new();
    for r in records {
        by_core.entry(r.core_id).or_default().push(r);
    }
    by_core
        .into_values()
        .map(CpuCoreData::combine)
        .collect()
}

/// Combines process records by lineage run.
///
/// Output is chronological; ENDED sentinels appear unmodified.
pub fn combine_processes(records: &[ProcessData]) -> Result<Vec<ProcessData>, CombineError> {
    let sorted = chronological(records)?;
    let mut combined = Vec::new();
    let mut open: BTreeMap<u32, Vec<&ProcessData>> = BTreeMap::new();

    for record in sorted {
        match record.state {
            PidState::Ended => combined.push(record.clone()),
            state if state.starts_lineage() => {
                if let Some(previous) = open.insert(record.pid, vec![record]) {
                    combined.push(ProcessData::combine(previous)?);
                }
            }
            _ => open.entry(record.pid).or_default().push(record),
        }
    }
    for lineage in open.into_values() {
        combined.push(ProcessData::combine(lineage)?);
    }

    combined.sort_by_key(|p| p.timestamp);
    Ok(combined)
}

/// Unwraps every row into the typed record of `kind`.
fn unwrap_rows<T>(
    kind: MetricKind,
    rows: Vec<Metric>,
    pick: impl Fn(Metric) -> Option<T>,
) -> Result<Vec<T>, CombineError> {
    rows.into_iter()
        .map(|m| {
            let found = m.kind();
            pick(m).ok_or(CombineError::MixedKinds {
                expected: kind,
                found,
            })
        })
        .collect()
}

/// Combines untyped rows of one kind with that kind's grouping rules.
///
/// Single-record kinds yield exactly one row; per-core and process kinds may
/// yield several.
pub fn combine_metrics(kind: MetricKind, rows: Vec<Metric>) -> Result<Vec<Metric>, CombineError> {
    if rows.is_empty() {
        return Err(CombineError::Empty);
    }
    let combined = match kind {
        MetricKind::Cpu => {
            let typed = unwrap_rows(kind, rows, |m| match m {
                Metric::Cpu(d) => Some(d),
                _ => None,
            })?;
            vec![Metric::Cpu(CpuData::combine(&typed)?)]
        }
        MetricKind::CpuCore => {
            let typed = unwrap_rows(kind, rows, |m| match m {
                Metric::CpuCore(d) => Some(d),
                _ => None,
            })?;
            combine_cores(&typed)?
                .into_iter()
                .map(Metric::CpuCore)
                .collect()
        }
        MetricKind::Memory => {
            let typed = unwrap_rows(kind, rows, |m| match m {
                Metric::Memory(d) => Some(d),
                _ => None,
            })?;
            vec![Metric::Memory(MemoryData::combine(&typed)?)]
        }
        MetricKind::Network => {
            let typed = unwrap_rows(kind, rows, |m| match m {
                Metric::Network(d) => Some(d),
                _ => None,
            })?;
            vec![Metric::Network(NetworkData::combine(&typed)?)]
        }
        MetricKind::Processes => {
            let typed = unwrap_rows(kind, rows, |m| match m {
                Metric::Processes(d) => Some(d),
                _ => None,
            })?;
            combine_processes(&typed)?
                .into_iter()
                .map(Metric::Processes)
                .collect()
        }
        MetricKind::SystemMetrics => {
            let typed = unwrap_rows(kind, rows, |m| match m {
                Metric::SystemMetrics(d) => Some(d),
                _ => None,
            })?;
            vec![Metric::SystemMetrics(SystemData::combine(&typed)?)]
        }
        MetricKind::SystemConstants => return Err(CombineError::NotCombinable(kind)),
    };
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn process(pid: u32, state: PidState, up_time: f64, delta: i64, ts: i64) -> ProcessData {
        ProcessData {
            pid,
            name: format!("proc-{pid}"),
            start_time: 1_000 + pid as i64,
            up_time,
            cpu_usage: 0.1,
            memory: 100.0,
            kb_read: 1.0,
            kb_written: 2.0,
            state,
            delta_millis: delta,
            timestamp: ts,
        }
    }

    #[test]
    fn test_weighted_average_step() {
        assert!((weighted_average(0.0, 0, 5.0, 10) - 5.0).abs() < EPS);
        assert!((weighted_average(4.0, 4, 1.0, 1) - 3.4).abs() < EPS);
    }

    #[test]
    fn test_combine_uptime_two_records() {
        let a = process(1, PidState::New, 4.0, 4, 100);
        let b = process(1, PidState::Running, 1.0, 1, 101);
        let c = ProcessData::combine([&a, &b]).unwrap();
        assert_eq!(c.delta_millis, 5);
        assert!((c.up_time - 3.4).abs() < EPS);
        assert_eq!(c.state, PidState::New);
        assert_eq!(c.pid, 1);
    }

    #[test]
    fn test_combine_sorts_before_iterating() {
        let a = SystemData {
            up_time: 10.0,
            delta_millis: 3,
            timestamp: 10,
        };
        let b = SystemData {
            up_time: 20.0,
            delta_millis: 7,
            timestamp: 20,
        };
        let forward = SystemData::combine([&a, &b]).unwrap();
        let backward = SystemData::combine([&b, &a]).unwrap();
        assert_eq!(forward, backward);
        assert!((forward.up_time - 17.0).abs() < EPS);
        assert_eq!(forward.timestamp, 17);
    }

    #[test]
    fn test_combine_empty_is_error() {
        let empty: Vec<CpuData> = Vec::new();
        assert_eq!(CpuData::combine(&empty), Err(CombineError::Empty));
        assert_eq!(
            combine_metrics(MetricKind::Cpu, Vec::new()),
            Err(CombineError::Empty)
        );
    }

    #[test]
    fn test_combine_rejects_non_positive_interval() {
        let bad = CpuData {
            utilization: 0.5,
            temperature: 0.0,
            delta_millis: 0,
            timestamp: 5,
        };
        assert!(matches!(
            CpuData::combine([&bad]),
            Err(CombineError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_combine_cores_groups_by_core_id() {
        let rows = vec![
            CpuCoreData {
                core_id: 1,
                core_utilization: 0.2,
                delta_millis: 10,
                timestamp: 10,
            },
            CpuCoreData {
                core_id: 0,
                core_utilization: 0.4,
                delta_millis: 10,
                timestamp: 10,
            },
            CpuCoreData {
                core_id: 1,
                core_utilization: 0.6,
                delta_millis: 10,
                timestamp: 20,
            },
        ];
        let combined = combine_cores(&rows).unwrap();
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].core_id, 0);
        assert_eq!(combined[0].delta_millis, 10);
        assert_eq!(combined[1].core_id, 1);
        assert_eq!(combined[1].delta_millis, 20);
        assert!((combined[1].core_utilization - 0.4).abs() < EPS);
    }

    #[test]
    fn test_combine_processes_splits_lineages() {
        let rows = vec![
            process(5, PidState::New, 10.0, 10, 100),
            process(5, PidState::Running, 20.0, 10, 110),
            process(5, PidState::Recycled, 3.0, 3, 113),
            process(5, PidState::Running, 13.0, 10, 123),
            process(6, PidState::Running, 50.0, 10, 105),
            ProcessData::ended(7, "gone", 107),
        ];
        let combined = combine_processes(&rows).unwrap();
        assert_eq!(combined.len(), 4);

        let states: Vec<(u32, PidState, i64)> = combined
            .iter()
            .map(|p| (p.pid, p.state, p.delta_millis))
            .collect();
        assert!(states.contains(&(5, PidState::New, 20)));
        assert!(states.contains(&(5, PidState::Recycled, 13)));
        assert!(states.contains(&(6, PidState::Running, 10)));
        assert!(states.contains(&(7, PidState::Ended, -1)));

        let timestamps: Vec<i64> = combined.iter().map(|p| p.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted);
    }

    #[test]
    fn test_combine_metrics_rejects_mixed_kinds() {
        let rows = vec![
            Metric::Cpu(CpuData {
                utilization: 0.1,
                temperature: 0.0,
                delta_millis: 1,
                timestamp: 1,
            }),
            Metric::Memory(MemoryData {
                utilization: 0.1,
                page_faults: 0.0,
                delta_millis: 1,
                timestamp: 2,
            }),
        ];
        assert_eq!(
            combine_metrics(MetricKind::Cpu, rows),
            Err(CombineError::MixedKinds {
                expected: MetricKind::Cpu,
                found: MetricKind::Memory,
            })
        );
    }

    #[test]
    fn test_constants_are_not_combinable() {
        use crate::storage::model::SystemConstants;
        let rows = vec![Metric::SystemConstants(SystemConstants::default())];
        assert_eq!(
            combine_metrics(MetricKind::SystemConstants, rows),
            Err(CombineError::NotCombinable(MetricKind::SystemConstants))
        );
    }

    fn network_strategy() -> impl Strategy<Value = NetworkData> {
        (
            0.0f64..1e6,
            0.0f64..1e6,
            0.0f64..1e7,
            1i64..3_600_000,
            0i64..1_000_000_000,
        )
            .prop_map(|(send, receive, throughput, delta_millis, timestamp)| NetworkData {
                send,
                receive,
                throughput,
                delta_millis,
                timestamp,
            })
    }

    fn within(value: f64, values: impl Iterator<Item = f64> + Clone) -> bool {
        let min = values.clone().fold(f64::INFINITY, f64::min);
        let max = values.fold(f64::NEG_INFINITY, f64::max);
        let slack = 1e-9 * max.abs().max(1.0);
        value >= min - slack && value <= max + slack
    }

    proptest! {
        #[test]
        fn test_prop_delta_millis_is_exact_sum(group in prop::collection::vec(network_strategy(), 1..40)) {
            let combined = NetworkData::combine(&group).unwrap();
            let sum: i64 = group.iter().map(|m| m.delta_millis).sum();
            prop_assert_eq!(combined.delta_millis, sum);
        }

        #[test]
        fn test_prop_fields_are_bounded(group in prop::collection::vec(network_strategy(), 1..40)) {
            let combined = NetworkData::combine(&group).unwrap();
            prop_assert!(within(combined.send, group.iter().map(|m| m.send)));
            prop_assert!(within(combined.receive, group.iter().map(|m| m.receive)));
            prop_assert!(within(combined.throughput, group.iter().map(|m| m.throughput)));
            let ts = group.iter().map(|m| m.timestamp);
            prop_assert!(combined.timestamp >= ts.clone().min().unwrap());
            prop_assert!(combined.timestamp <= ts.max().unwrap());
        }

        #[test]
        fn test_prop_matches_closed_form(group in prop::collection::vec(network_strategy(), 1..40)) {
            let combined = NetworkData::combine(&group).unwrap();
            let total: f64 = group.iter().map(|m| m.delta_millis as f64).sum();
            let expected: f64 = group.iter().map(|m| m.send * m.delta_millis as f64).sum::<f64>() / total;
            prop_assert!((combined.send - expected).abs() <= 1e-6 * expected.abs().max(1.0));
        }
    }
}
