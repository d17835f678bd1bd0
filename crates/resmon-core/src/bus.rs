//! Newline-delimited JSON transport of [`Metric`] records.
//!
//! One record per line, discriminated by `metric_type`. Lines that cannot be
//! decoded are logged and skipped; only I/O errors end a stream.

use std::io::{self, BufRead, Write};
use std::str::FromStr;

use serde_json::Value;
use tracing::warn;

use crate::storage::model::{Metric, MetricKind};

const DISCRIMINATOR: &str = "metric_type";

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record has no {DISCRIMINATOR} field")]
    MissingType,

    #[error("unknown {DISCRIMINATOR} '{0}'")]
    UnknownType(String),
}

/// Decodes one bus line.
pub fn decode_line(line: &str) -> Result<Metric, BusError> {
    let value: Value = serde_json::from_str(line)?;
    let tag = value
        .get(DISCRIMINATOR)
        .and_then(Value::as_str)
        .ok_or(BusError::MissingType)?;
    if MetricKind::from_str(tag).is_err() {
        return Err(BusError::UnknownType(tag.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}

pub struct MetricWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> MetricWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn write(&mut self, metric: &Metric) -> Result<(), BusError> {
        serde_json::to_writer(&mut self.inner, metric)?;
        self.inner.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn write_all<'a>(
        &mut self,
        metrics: impl IntoIterator<Item = &'a Metric>,
    ) -> Result<(), BusError> {
        for metric in metrics {
            self.write(metric)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), BusError> {
        Ok(self.inner.flush()?)
    }

    /// Records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Iterates over the records of a bus stream.
pub struct MetricReader<R: BufRead> {
    inner: R,
    line: String,
    line_no: u64,
    skipped: u64,
}

impl<R: BufRead> MetricReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
            line_no: 0,
            skipped: 0,
        }
    }

    /// Lines dropped because they could not be decoded.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl<R: BufRead> Iterator for MetricReader<R> {
    type Item = Result<Metric, BusError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.inner.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line_no += 1;

            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            match decode_line(line) {
                Ok(metric) => return Some(Ok(metric)),
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "skipping bus record");
                    self.skipped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::model::{MemoryData, PidState, ProcessData, SystemData};

    #[test]
    fn test_wire_format() {
        let mut writer = MetricWriter::new(Vec::new());
        writer
            .write(&Metric::Memory(MemoryData {
                utilization: 0.5,
                page_faults: 0.0,
                delta_millis: 10_000,
                timestamp: 1_700_000_000_000,
            }))
            .unwrap();
        writer
            .write(&Metric::Processes(ProcessData::ended(7, "sleep", 5)))
            .unwrap();
        assert_eq!(writer.written(), 2);

        let out = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let memory: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(memory["metric_type"], "memory");
        assert_eq!(memory["datetime"], 1_700_000_000_000i64);
        assert_eq!(memory["delta_millis"], 10_000);

        let process: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(process["metric_type"], "processes");
        assert_eq!(process["state"], "ENDED");
    }

    #[test]
    fn test_reader_skips_bad_lines() {
        let input = concat!(
            r#"{"metric_type":"system_metrics","uptime":3.0,"delta_millis":1000,"datetime":10}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"metric_type":"gpu","load":1.0}"#,
            "\n",
            r#"{"uptime":3.0,"delta_millis":1000,"datetime":10}"#,
            "\n",
            r#"{"metric_type":"memory","utilization":"high"}"#,
            "\n",
            r#"{"metric_type":"processes","pid":9,"name":"x","start_time":1,"uptime":2.0,"cpu_usage":0.1,"memory":1.0,"kb_read":0.0,"kb_written":0.0,"state":"NEW","delta_millis":2,"datetime":3}"#,
            "\n",
        );
        let mut reader = MetricReader::new(input.as_bytes());
        let metrics: Vec<Metric> = reader.by_ref().map(|r| r.unwrap()).collect();

        assert_eq!(
            metrics[0],
            Metric::SystemMetrics(SystemData {
                up_time: 3.0,
                delta_millis: 1000,
                timestamp: 10,
            })
        );
        match &metrics[1] {
            Metric::Processes(p) => assert_eq!(p.state, PidState::New),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(metrics.len(), 2);
        assert_eq!(reader.skipped(), 4);
    }

    #[test]
    fn test_decode_line_errors() {
        assert!(matches!(
            decode_line(r#"{"metric_type":"gpu"}"#),
            Err(BusError::UnknownType(t)) if t == "gpu"
        ));
        assert!(matches!(
            decode_line(r#"{"datetime":1}"#),
            Err(BusError::MissingType)
        ));
        assert!(matches!(decode_line("[1,"), Err(BusError::Json(_))));
    }
}
