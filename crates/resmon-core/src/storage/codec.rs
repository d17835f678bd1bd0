//! Row codec registry: one encode/decode pair per metric kind.
//!
//! Stored rows carry no discriminator of their own; the partition a row lives
//! in determines which entry of [`CODECS`] decodes it. Rows are postcard
//! encoded, which keeps them compact and independent of the JSON wire names.

use crate::storage::model::{Metric, MetricKind};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {kind} row: {source}")]
    Encode {
        kind: MetricKind,
        #[source]
        source: postcard::Error,
    },

    #[error("failed to decode {kind} row: {source}")]
    Decode {
        kind: MetricKind,
        #[source]
        source: postcard::Error,
    },

    #[error("{found} row handed to the {expected} codec")]
    KindMismatch {
        expected: MetricKind,
        found: MetricKind,
    },

    #[error("corrupt frame: {0}")]
    Frame(String),
}

/// Encode/decode functions for one kind.
pub struct RowCodec {
    pub kind: MetricKind,
    pub encode: fn(&Metric) -> Result<Vec<u8>, CodecError>,
    pub decode: fn(&[u8]) -> Result<Metric, CodecError>,
}

macro_rules! row_codec {
    ($kind:ident, $ty:ty) => {
        RowCodec {
            kind: MetricKind::$kind,
            encode: |metric| match metric {
                Metric::$kind(row) => {
                    postcard::to_allocvec(row).map_err(|source| CodecError::Encode {
                        kind: MetricKind::$kind,
                        source,
                    })
                }
                other => Err(CodecError::KindMismatch {
                    expected: MetricKind::$kind,
                    found: other.kind(),
                }),
            },
            decode: |bytes| {
                postcard::from_bytes::<$ty>(bytes)
                    .map(Metric::$kind)
                    .map_err(|source| CodecError::Decode {
                        kind: MetricKind::$kind,
                        source,
                    })
            },
        }
    };
}

/// Registry indexed in [`MetricKind::ALL`] order.
pub static CODECS: [RowCodec; 7] = [
    row_codec!(Cpu, crate::storage::model::CpuData),
    row_codec!(CpuCore, crate::storage::model::CpuCoreData),
    row_codec!(Memory, crate::storage::model::MemoryData),
    row_codec!(Network, crate::storage::model::NetworkData),
    row_codec!(Processes, crate::storage::model::ProcessData),
    row_codec!(SystemMetrics, crate::storage::model::SystemData),
    row_codec!(SystemConstants, crate::storage::model::SystemConstants),
];

/// Looks up the codec of `kind`.
pub fn codec(kind: MetricKind) -> &'static RowCodec {
    let idx = MetricKind::ALL
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_default();
    &CODECS[idx]
}

/// Encodes a row for the partition of `kind`.
pub fn encode_row(kind: MetricKind, metric: &Metric) -> Result<Vec<u8>, CodecError> {
    (codec(kind).encode)(metric)
}

/// Decodes a row stored in the partition of `kind`.
pub fn decode_row(kind: MetricKind, bytes: &[u8]) -> Result<Metric, CodecError> {
    (codec(kind).decode)(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::{CpuCoreData, PidState, ProcessData};

    #[test]
    fn test_registry_matches_kind_order() {
        for (codec, kind) in CODECS.iter().zip(MetricKind::ALL) {
            assert_eq!(codec.kind, kind);
            assert_eq!(super::codec(kind).kind, kind);
        }
    }

    #[test]
    fn test_process_row_round_trip() {
        let row = Metric::Processes(ProcessData {
            pid: 42,
            name: "postgres".to_string(),
            start_time: 1_700_000_000_000,
            up_time: 12_000.0,
            cpu_usage: 0.05,
            memory: 20_480.0,
            kb_read: 1.5,
            kb_written: 0.25,
            state: PidState::Recycled,
            delta_millis: 10_000,
            timestamp: 1_700_000_012_000,
        });
        let bytes = encode_row(MetricKind::Processes, &row).unwrap();
        let back = decode_row(MetricKind::Processes, &bytes).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_encode_rejects_foreign_kind() {
        let row = Metric::CpuCore(CpuCoreData::default());
        let err = encode_row(MetricKind::Memory, &row).unwrap_err();
        assert!(matches!(
            err,
            CodecError::KindMismatch {
                expected: MetricKind::Memory,
                found: MetricKind::CpuCore
            }
        ));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let err = decode_row(MetricKind::Processes, &[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }
}
