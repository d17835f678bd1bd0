//! Segment file format: one partition's committed rows, zstd framed per row
//! with a shared trained dictionary and a timestamp index.
//!
//! File layout:
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ HEADER (32 bytes, uncompressed)                         │
//! │   magic: [u8; 4]              = b"RSM1"                 │
//! │   version: u16                = 1                       │
//! │   kind: u8                    (MetricKind::tag)         │
//! │   _reserved: u8               = 0                       │
//! │   row_count: u32                                        │
//! │   applied_seq: u64            (last WAL seq folded in)  │
//! │   dict_len: u32                                         │
//! │   _reserved: [u8; 8]          = [0; 8]                  │
//! ├─────────────────────────────────────────────────────────┤
//! │ INDEX TABLE (row_count × 24 bytes, uncompressed)        │
//! │   Per row, in timestamp order:                          │
//! │     offset: u64           (byte position in file)       │
//! │     compressed_len: u32                                 │
//! │     uncompressed_len: u32                               │
//! │     timestamp: i64                                      │
//! ├─────────────────────────────────────────────────────────┤
//! │ DICTIONARY (raw bytes, may be empty)                    │
//! ├─────────────────────────────────────────────────────────┤
//! │ ROW FRAMES (each compressed WITH dictionary)            │
//! │   zstd_dict(postcard(row_0))                            │
//! │   ...                                                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A segment is only ever replaced whole: the new file is written to `.tmp`,
//! synced and renamed over the old one. The rename is the commit point of a
//! partition rewrite.

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use super::codec::{CodecError, decode_row, encode_row};
use super::{StoreError, in_range};
use crate::storage::model::{Metric, MetricKind};

const MAGIC: [u8; 4] = *b"RSM1";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 32;
const INDEX_ENTRY_SIZE: usize = 24; // offset: u64 + compressed_len: u32 + uncompressed_len: u32 + timestamp: i64
const DICT_MAX_SIZE: usize = 16 * 1024;
const ZSTD_LEVEL: i32 = 3;

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn corrupt(msg: impl Into<String>) -> StoreError {
    StoreError::Decode(CodecError::Frame(msg.into()))
}

/// Writes `rows` (already in timestamp order) as the segment of `kind`.
///
/// An empty row set produces a valid empty segment.
pub fn write_segment(
    path: &Path,
    kind: MetricKind,
    applied_seq: u64,
    rows: &[Metric],
) -> Result<(), StoreError> {
    let raw_rows: Vec<Vec<u8>> = rows
        .iter()
        .map(|r| encode_row(kind, r))
        .collect::<Result<_, _>>()?;

    let row_count = u32::try_from(raw_rows.len())
        .map_err(|_| corrupt(format!("too many rows for segment: {}", raw_rows.len())))?;

    // Dictionary training needs a reasonable sample set; fall back to plain zstd.
    let dictionary = if raw_rows.len() >= 8 {
        zstd::dict::from_samples(&raw_rows, DICT_MAX_SIZE).unwrap_or_default()
    } else {
        Vec::new()
    };

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;

    // Placeholders, rewritten once offsets are known
    file.write_all(&[0u8; HEADER_SIZE])?;
    file.write_all(&vec![0u8; raw_rows.len() * INDEX_ENTRY_SIZE])?;

    file.write_all(&dictionary)?;

    let mut compressor = zstd::bulk::Compressor::with_dictionary(ZSTD_LEVEL, &dictionary)?;
    let mut index: Vec<(u64, u32, u32, i64)> = Vec::with_capacity(raw_rows.len());
    for (raw, row) in raw_rows.iter().zip(rows) {
        let offset = file.stream_position()?;
        let compressed = compressor.compress(raw)?;
        file.write_all(&compressed)?;
        index.push((
            offset,
            compressed.len() as u32,
            raw.len() as u32,
            row.timestamp(),
        ));
    }

    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = kind.tag();
    header[8..12].copy_from_slice(&row_count.to_le_bytes());
    header[12..20].copy_from_slice(&applied_seq.to_le_bytes());
    header[20..24].copy_from_slice(&(dictionary.len() as u32).to_le_bytes());
    file.write_all(&header)?;

    for (offset, compressed_len, uncompressed_len, timestamp) in &index {
        file.write_all(&offset.to_le_bytes())?;
        file.write_all(&compressed_len.to_le_bytes())?;
        file.write_all(&uncompressed_len.to_le_bytes())?;
        file.write_all(&timestamp.to_le_bytes())?;
    }

    file.sync_all()?;
    drop(file);

    fs::rename(tmp_path, path)?;

    Ok(())
}

/// Reader over one segment file with per-row random access.
pub struct SegmentReader {
    kind: MetricKind,
    applied_seq: u64,
    /// (byte_offset, compressed_len, uncompressed_len, timestamp) per row.
    index: Vec<(u64, u32, u32, i64)>,
    dictionary: Vec<u8>,
    data: Vec<u8>,
}

impl SegmentReader {
    /// Opens a segment: parses header, index and dictionary without decoding rows.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data = fs::read(path)?;

        if data.len() < HEADER_SIZE {
            return Err(corrupt("segment too small for header"));
        }
        if data[0..4] != MAGIC {
            return Err(corrupt(format!(
                "invalid magic: expected RSM1, got {:?}",
                &data[0..4]
            )));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(corrupt(format!("unsupported segment version: {}", version)));
        }
        let kind = MetricKind::from_tag(data[6])
            .ok_or_else(|| corrupt(format!("unknown kind tag: {}", data[6])))?;
        let row_count = read_u32(&data, 8) as usize;
        let applied_seq = read_u64(&data, 12);
        let dict_len = read_u32(&data, 20) as usize;

        let dict_end = row_count
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|len| len.checked_add(HEADER_SIZE + dict_len))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| corrupt("segment too small for index and dictionary"))?;
        let dict_start = dict_end - dict_len;

        let mut index = Vec::with_capacity(row_count);
        for i in 0..row_count {
            let base = HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let offset = read_u64(&data, base);
            let compressed_len = read_u32(&data, base + 8);
            let uncompressed_len = read_u32(&data, base + 12);
            let timestamp = read_u64(&data, base + 16) as i64;
            let row_end = usize::try_from(offset)
                .ok()
                .and_then(|start| start.checked_add(compressed_len as usize));
            if row_end.is_none_or(|end| end > data.len()) {
                return Err(corrupt(format!("row {} extends past end of segment", i)));
            }
            index.push((offset, compressed_len, uncompressed_len, timestamp));
        }

        let dictionary = data[dict_start..dict_end].to_vec();

        Ok(Self {
            kind,
            applied_seq,
            index,
            dictionary,
            data,
        })
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Highest WAL sequence number already contained in this segment.
    pub fn applied_seq(&self) -> u64 {
        self.applied_seq
    }

    pub fn row_count(&self) -> usize {
        self.index.len()
    }

    /// Decodes rows whose index timestamp lies in `[earliest, latest)`.
    pub fn rows_in(&self, earliest: i64, latest: i64) -> Result<Vec<Metric>, StoreError> {
        let mut decompressor = zstd::bulk::Decompressor::with_dictionary(&self.dictionary)?;
        let mut rows = Vec::new();
        for (idx, (offset, compressed_len, uncompressed_len, ts)) in self.index.iter().enumerate() {
            if !in_range(*ts, earliest, latest) {
                continue;
            }
            let start = *offset as usize;
            let end = start + *compressed_len as usize;
            let raw = decompressor.decompress(&self.data[start..end], *uncompressed_len as usize)?;
            let row = decode_row(self.kind, &raw).map_err(|e| {
                warn!(
                    idx,
                    kind = %self.kind,
                    compressed_len,
                    uncompressed_len,
                    error = %e,
                    "segment: row deserialization failed"
                );
                e
            })?;
            rows.push(row);
        }
        Ok(rows)
    }
}
