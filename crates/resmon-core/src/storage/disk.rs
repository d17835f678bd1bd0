//! Durable metric store: one directory per kind holding an append-only WAL
//! and a compressed segment.
//!
//! ```text
//! <base>/
//!   watermarks.bin          postcard map kind -> hourly watermark
//!   cpu/
//!     wal.log               bincode WalEntry records, appended and synced
//!     segment.rsm           committed rows (see `segment`)
//!   memory/
//!   ...
//! ```
//!
//! Every WAL entry carries a sequence number. A segment records the highest
//! sequence it absorbed, so WAL entries left behind by a crash between the
//! segment rename and the WAL truncate are skipped on replay.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::codec::{CodecError, decode_row, encode_row};
use super::segment::{SegmentReader, write_segment};
use super::{MetricStore, StoreError, check_batch, in_range};
use crate::storage::model::{Metric, MetricKind};

const WAL_FILE: &str = "wal.log";
const SEGMENT_FILE: &str = "segment.rsm";
const WATERMARKS_FILE: &str = "watermarks.bin";

/// Tuning for [`DiskStore`].
#[derive(Debug, Clone)]
pub struct DiskStoreConfig {
    /// WAL entries per kind before they are folded into the segment.
    pub checkpoint_rows: usize,
}

impl Default for DiskStoreConfig {
    fn default() -> Self {
        Self {
            checkpoint_rows: 360, // ~1 hour at 10-second intervals
        }
    }
}

impl DiskStoreConfig {
    pub fn new(checkpoint_rows: usize) -> Self {
        Self {
            checkpoint_rows: checkpoint_rows.max(1),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WalEntry {
    seq: u64,
    timestamp: i64,
    /// crc32 of `row`.
    checksum: u32,
    row: Vec<u8>,
}

struct Partition {
    kind: MetricKind,
    dir: PathBuf,
    wal_file: File,
    /// Rows appended since the last checkpoint, in append order.
    pending: Vec<Metric>,
    segment_rows: usize,
    next_seq: u64,
}

impl Partition {
    fn open(kind: MetricKind, dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir)?;
        remove_tmp_files(&dir);

        let segment_path = dir.join(SEGMENT_FILE);
        let (applied_seq, segment_rows) = if segment_path.exists() {
            let reader = SegmentReader::open(&segment_path)?;
            if reader.kind() != kind {
                return Err(StoreError::Transaction {
                    kind,
                    reason: format!("segment holds {} rows", reader.kind()),
                });
            }
            (reader.applied_seq(), reader.row_count())
        } else {
            (0, 0)
        };

        let wal_path = dir.join(WAL_FILE);
        let wal_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&wal_path)?;

        let mut partition = Self {
            kind,
            dir,
            wal_file,
            pending: Vec::new(),
            segment_rows,
            next_seq: applied_seq + 1,
        };
        partition.recover_from_wal(applied_seq)?;
        Ok(partition)
    }

    /// Replays WAL entries newer than `applied_seq` and truncates a corrupt tail.
    fn recover_from_wal(&mut self, applied_seq: u64) -> Result<(), StoreError> {
        let wal_path = self.dir.join(WAL_FILE);
        let data = fs::read(&wal_path)?;
        if data.is_empty() {
            return Ok(());
        }

        let mut cursor = std::io::Cursor::new(&data);
        let mut valid_end_position = 0u64;
        let mut skipped = 0usize;
        let mut last_seq = applied_seq;

        while let Ok(entry) = bincode::deserialize_from::<_, WalEntry>(&mut cursor) {
            if crc32fast::hash(&entry.row) != entry.checksum {
                break;
            }
            let row = match decode_row(self.kind, &entry.row) {
                Ok(row) => row,
                Err(_) => break,
            };
            valid_end_position = cursor.position();
            last_seq = last_seq.max(entry.seq);
            if entry.seq <= applied_seq {
                skipped += 1;
                continue;
            }
            self.pending.push(row);
        }

        self.next_seq = last_seq + 1;

        let file_size = data.len() as u64;
        if valid_end_position < file_size {
            let garbage_bytes = file_size - valid_end_position;
            warn!(
                kind = %self.kind,
                garbage_bytes,
                valid = self.pending.len() + skipped,
                "WAL corruption detected, truncating"
            );
            if let Err(e) = self.wal_file.set_len(valid_end_position) {
                warn!(kind = %self.kind, error = %e, "failed to truncate WAL");
            }
        }

        if skipped > 0 || !self.pending.is_empty() {
            debug!(
                kind = %self.kind,
                replayed = self.pending.len(),
                skipped,
                "recovered WAL"
            );
        }
        Ok(())
    }

    fn append(&mut self, metric: &Metric) -> Result<(), StoreError> {
        let row = encode_row(self.kind, metric)?;
        let entry = WalEntry {
            seq: self.next_seq,
            timestamp: metric.timestamp(),
            checksum: crc32fast::hash(&row),
            row,
        };
        let encoded = bincode::serialize(&entry).map_err(std::io::Error::other)?;
        self.wal_file.write_all(&encoded)?;
        self.wal_file.sync_data()?;

        self.next_seq += 1;
        self.pending.push(metric.clone());
        Ok(())
    }

    fn segment_path(&self) -> PathBuf {
        self.dir.join(SEGMENT_FILE)
    }

    fn segment_range(&self, earliest: i64, latest: i64) -> Result<Vec<Metric>, StoreError> {
        if self.segment_rows == 0 {
            return Ok(Vec::new());
        }
        SegmentReader::open(&self.segment_path())?.rows_in(earliest, latest)
    }

    fn range(&self, earliest: i64, latest: i64) -> Result<Vec<Metric>, StoreError> {
        let mut rows = self.segment_range(earliest, latest)?;
        rows.extend(
            self.pending
                .iter()
                .filter(|r| in_range(r.timestamp(), earliest, latest))
                .cloned(),
        );
        rows.sort_by_key(Metric::timestamp);
        Ok(rows)
    }

    /// Writes `rows` as the new segment, then empties the WAL.
    ///
    /// The segment rename is the commit; a failure before it leaves both the
    /// old segment and the WAL untouched.
    fn commit(&mut self, rows: &[Metric]) -> Result<(), StoreError> {
        let applied_seq = self.next_seq - 1;
        write_segment(&self.segment_path(), self.kind, applied_seq, rows)?;

        self.segment_rows = rows.len();
        self.pending.clear();

        // Entries left behind are skipped on replay via applied_seq
        if let Err(e) = self.wal_file.set_len(0).and_then(|_| self.wal_file.sync_all()) {
            warn!(kind = %self.kind, error = %e, "failed to truncate WAL after commit");
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = self.range(i64::MIN, i64::MAX)?;
        self.commit(&rows)?;
        debug!(kind = %self.kind, rows = rows.len(), "checkpointed WAL into segment");
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.segment_rows == 0 && self.pending.is_empty()
    }
}

fn remove_tmp_files(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.path().extension().is_some_and(|ext| ext == "tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// File-backed [`MetricStore`].
pub struct DiskStore {
    base_path: PathBuf,
    config: DiskStoreConfig,
    partitions: BTreeMap<MetricKind, Partition>,
    watermarks: BTreeMap<MetricKind, i64>,
}

impl DiskStore {
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_config(base_path, DiskStoreConfig::default())
    }

    pub fn open_with_config(
        base_path: impl Into<PathBuf>,
        config: DiskStoreConfig,
    ) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        remove_tmp_files(&base_path);

        let mut partitions = BTreeMap::new();
        for kind in MetricKind::ALL {
            let partition = Partition::open(kind, base_path.join(kind.as_str()))?;
            partitions.insert(kind, partition);
        }

        let watermarks = load_watermarks(&base_path.join(WATERMARKS_FILE))?;

        info!(
            path = %base_path.display(),
            checkpoint_rows = config.checkpoint_rows,
            "opened metric store"
        );

        Ok(Self {
            base_path,
            config,
            partitions,
            watermarks,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Folds every pending WAL into its segment.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        for partition in self.partitions.values_mut() {
            partition.checkpoint()?;
        }
        Ok(())
    }

    /// Number of WAL entries not yet folded into the segment of `kind`.
    pub fn pending_rows(&self, kind: MetricKind) -> usize {
        self.partitions.get(&kind).map_or(0, |p| p.pending.len())
    }

    fn partition(&self, kind: MetricKind) -> Result<&Partition, StoreError> {
        self.partitions
            .get(&kind)
            .ok_or_else(|| StoreError::Transaction {
                kind,
                reason: "partition not open".to_string(),
            })
    }

    fn partition_mut(&mut self, kind: MetricKind) -> Result<&mut Partition, StoreError> {
        self.partitions
            .get_mut(&kind)
            .ok_or_else(|| StoreError::Transaction {
                kind,
                reason: "partition not open".to_string(),
            })
    }

    fn save_watermarks(&self) -> Result<(), StoreError> {
        let bytes = postcard::to_allocvec(&self.watermarks)
            .map_err(|e| CodecError::Frame(format!("watermarks: {}", e)))?;
        let path = self.base_path.join(WATERMARKS_FILE);
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}

fn load_watermarks(path: &Path) -> Result<BTreeMap<MetricKind, i64>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let bytes = fs::read(path)?;
    postcard::from_bytes(&bytes)
        .map_err(|e| StoreError::Decode(CodecError::Frame(format!("watermarks: {}", e))))
}

impl MetricStore for DiskStore {
    fn append(&mut self, metric: &Metric) -> Result<(), StoreError> {
        let checkpoint_rows = self.config.checkpoint_rows;
        let partition = self.partition_mut(metric.kind())?;
        partition.append(metric)?;

        if partition.pending.len() >= checkpoint_rows
            && let Err(e) = partition.checkpoint()
        {
            // Rows are durable in the WAL; the next checkpoint retries
            warn!(kind = %partition.kind, error = %e, "checkpoint failed");
        }
        Ok(())
    }

    fn range(
        &self,
        kind: MetricKind,
        earliest: i64,
        latest: i64,
    ) -> Result<Vec<Metric>, StoreError> {
        self.partition(kind)?.range(earliest, latest)
    }

    fn rewrite_range(
        &mut self,
        kind: MetricKind,
        earliest: i64,
        latest: i64,
        rows: Vec<Metric>,
    ) -> Result<(), StoreError> {
        check_batch(kind, &rows)?;

        let partition = self.partition_mut(kind)?;
        let mut replaced: Vec<Metric> = partition
            .range(i64::MIN, i64::MAX)?
            .into_iter()
            .filter(|r| !in_range(r.timestamp(), earliest, latest))
            .collect();
        replaced.extend(rows);
        replaced.sort_by_key(Metric::timestamp);

        partition.commit(&replaced)
    }

    fn watermark(&self, kind: MetricKind) -> Result<Option<i64>, StoreError> {
        Ok(self.watermarks.get(&kind).copied())
    }

    fn set_watermark(&mut self, kind: MetricKind, bound: i64) -> Result<(), StoreError> {
        let previous = self.watermarks.insert(kind, bound);
        if let Err(e) = self.save_watermarks() {
            match previous {
                Some(p) => self.watermarks.insert(kind, p),
                None => self.watermarks.remove(&kind),
            };
            return Err(e);
        }
        Ok(())
    }

    fn kinds(&self) -> Result<Vec<MetricKind>, StoreError> {
        Ok(self
            .partitions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(kind, _)| *kind)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::{CpuData, MemoryData};
    use tempfile::tempdir;

    fn cpu(ts: i64) -> Metric {
        Metric::Cpu(CpuData {
            utilization: 0.25,
            temperature: 51.0,
            delta_millis: 10_000,
            timestamp: ts,
        })
    }

    fn timestamps(store: &DiskStore, kind: MetricKind) -> Vec<i64> {
        store
            .range(kind, i64::MIN, i64::MAX)
            .unwrap()
            .iter()
            .map(Metric::timestamp)
            .collect()
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = DiskStore::open(dir.path()).unwrap();
            for ts in [30, 10, 20] {
                store.append(&cpu(ts)).unwrap();
            }
            // Dropped without flush (simulated crash)
        }

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(timestamps(&store, MetricKind::Cpu), vec![10, 20, 30]);
        assert_eq!(store.pending_rows(MetricKind::Cpu), 3);
        assert_eq!(store.kinds().unwrap(), vec![MetricKind::Cpu]);
    }

    #[test]
    fn test_checkpoint_moves_wal_into_segment() {
        let dir = tempdir().unwrap();
        {
            let mut store =
                DiskStore::open_with_config(dir.path(), DiskStoreConfig::new(2)).unwrap();
            for ts in [10, 20, 30] {
                store.append(&cpu(ts)).unwrap();
            }
            assert_eq!(store.pending_rows(MetricKind::Cpu), 1);
            assert!(dir.path().join("cpu").join(SEGMENT_FILE).exists());
        }

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(timestamps(&store, MetricKind::Cpu), vec![10, 20, 30]);
        assert_eq!(store.range(MetricKind::Cpu, 20, 30).unwrap(), vec![cpu(20)]);
    }

    #[test]
    fn test_rewrite_range_commits_and_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let mut store = DiskStore::open(dir.path()).unwrap();
            for ts in [10, 20, 30, 40] {
                store.append(&cpu(ts)).unwrap();
            }
            store
                .rewrite_range(MetricKind::Cpu, 15, 35, vec![cpu(25)])
                .unwrap();
            assert_eq!(store.pending_rows(MetricKind::Cpu), 0);
        }

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(timestamps(&store, MetricKind::Cpu), vec![10, 25, 40]);
    }

    #[test]
    fn test_failed_rewrite_leaves_partition_unchanged() {
        let dir = tempdir().unwrap();
        let mut store = DiskStore::open(dir.path()).unwrap();
        for ts in [10, 20, 30] {
            store.append(&cpu(ts)).unwrap();
        }

        let foreign = Metric::Memory(MemoryData::default());
        let err = store
            .rewrite_range(MetricKind::Cpu, 0, 100, vec![cpu(15), foreign])
            .unwrap_err();
        assert!(matches!(err, StoreError::Transaction { .. }));
        assert_eq!(timestamps(&store, MetricKind::Cpu), vec![10, 20, 30]);
        assert!(!dir.path().join("cpu").join(SEGMENT_FILE).exists());
    }

    #[test]
    fn test_stale_wal_entries_are_not_replayed() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("cpu").join(WAL_FILE);
        {
            let mut store = DiskStore::open(dir.path()).unwrap();
            for ts in [10, 20, 30] {
                store.append(&cpu(ts)).unwrap();
            }
            let stale_wal = fs::read(&wal_path).unwrap();
            store
                .rewrite_range(MetricKind::Cpu, 0, 100, vec![cpu(10)])
                .unwrap();
            // Crash between segment rename and WAL truncate
            fs::write(&wal_path, stale_wal).unwrap();
        }

        let mut store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(timestamps(&store, MetricKind::Cpu), vec![10]);

        // Sequence numbers keep increasing past the stale entries
        store.append(&cpu(50)).unwrap();
        drop(store);
        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(timestamps(&store, MetricKind::Cpu), vec![10, 50]);
    }

    #[test]
    fn test_corrupt_wal_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("cpu").join(WAL_FILE);
        {
            let mut store = DiskStore::open(dir.path()).unwrap();
            store.append(&cpu(10)).unwrap();
            store.append(&cpu(20)).unwrap();
        }
        let valid_len = fs::metadata(&wal_path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap();
        drop(file);

        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(timestamps(&store, MetricKind::Cpu), vec![10, 20]);
        assert_eq!(fs::metadata(&wal_path).unwrap().len(), valid_len);
    }

    #[test]
    fn test_watermarks_persist() {
        let dir = tempdir().unwrap();
        {
            let mut store = DiskStore::open(dir.path()).unwrap();
            store.set_watermark(MetricKind::Network, 3_600_000).unwrap();
        }
        let store = DiskStore::open(dir.path()).unwrap();
        assert_eq!(
            store.watermark(MetricKind::Network).unwrap(),
            Some(3_600_000)
        );
        assert_eq!(store.watermark(MetricKind::Cpu).unwrap(), None);
    }

    #[test]
    fn test_flush_empties_every_wal() {
        let dir = tempdir().unwrap();
        let mut store = DiskStore::open(dir.path()).unwrap();
        store.append(&cpu(10)).unwrap();
        store
            .append(&Metric::Memory(MemoryData {
                utilization: 0.5,
                page_faults: 0.0,
                delta_millis: 10_000,
                timestamp: 10,
            }))
            .unwrap();
        store.flush().unwrap();

        assert_eq!(store.pending_rows(MetricKind::Cpu), 0);
        assert_eq!(store.pending_rows(MetricKind::Memory), 0);
        assert_eq!(
            fs::metadata(dir.path().join("memory").join(WAL_FILE))
                .unwrap()
                .len(),
            0
        );
        assert_eq!(
            store.kinds().unwrap(),
            vec![MetricKind::Cpu, MetricKind::Memory]
        );
    }
}
