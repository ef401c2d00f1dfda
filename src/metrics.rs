// metrics.rs

use crate::error::{Error, IoContext, Result};
use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Destination for per-epoch scalars.
pub trait MetricsSink {
    fn scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps scalars in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub scalars: Vec<(String, i64, f64)>,
}

impl RecordingSink {
    pub fn values(&self, tag: &str) -> Vec<f64> {
        self.scalars
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|(_, _, v)| *v)
            .collect()
    }
}

impl MetricsSink for RecordingSink {
    fn scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<()> {
        self.scalars.push((tag.to_string(), step, value));
        Ok(())
    }
}

/// TensorBoard event file (`events.out.tfevents.<ts>.<host>`) in `dir`.
pub struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self> {
        fs::create_dir_all(dir).at(dir)?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).at(&path)?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(128);
        event
            .encode(&mut buffer)
            .map_err(|e| Error::Metrics(format!("failed to encode event: {e}")))?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .at(&self.path)?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }
}

impl MetricsSink for TensorBoardWriter {
    fn scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<()> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().at(&self.path)?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

/// One row of a stage's history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// Per-epoch losses and accuracies of one stage.
#[derive(Debug, Clone, Default)]
pub struct TrainingStats {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Save training metrics to CSV file
    pub fn save_to_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).at(parent)?;
        }
        let mut file = BufWriter::new(File::create(path).at(path)?);
        writeln!(
            file,
            "epoch,train_loss,train_accuracy,val_loss,val_accuracy,learning_rate"
        )
        .at(path)?;
        for r in &self.epochs {
            writeln!(
                file,
                "{},{:.6},{:.4},{:.6},{:.4},{:e}",
                r.epoch, r.train_loss, r.train_accuracy, r.val_loss, r.val_accuracy, r.learning_rate
            )
            .at(path)?;
        }
        file.flush().at(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_records(path: &Path) -> Vec<Vec<u8>> {
        let mut raw = Vec::new();
        File::open(path).unwrap().read_to_end(&mut raw).unwrap();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < raw.len() {
            let len_bytes = &raw[pos..pos + 8];
            let len = u64::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
            let len_crc = u32::from_le_bytes(raw[pos + 8..pos + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(len_bytes));
            let data = &raw[pos + 12..pos + 12 + len];
            let data_crc =
                u32::from_le_bytes(raw[pos + 12 + len..pos + 16 + len].try_into().unwrap());
            assert_eq!(data_crc, masked_crc32(data));
            out.push(data.to_vec());
            pos += 16 + len;
        }
        out
    }

    #[test]
    fn event_file_holds_framed_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut tb = TensorBoardWriter::create(dir.path(), 10).unwrap();
            tb.scalar("Loss/train_stage1", 0, 1.25).unwrap();
            tb.scalar("Accuracy/validation_stage1", 0, 50.0).unwrap();
            tb.path().to_path_buf()
        };
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("events.out.tfevents."));

        let records = read_records(&path);
        assert_eq!(records.len(), 3);
        let header = Event::decode(records[0].as_slice()).unwrap();
        assert_eq!(header.file_version.as_deref(), Some("brain.Event:2"));

        let event = Event::decode(records[1].as_slice()).unwrap();
        let value = &event.summary.unwrap().value[0];
        assert_eq!(value.tag, "Loss/train_stage1");
        assert_eq!(value.simple_value, Some(1.25));
    }

    #[test]
    fn stats_csv_has_one_row_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("stage1_metrics.csv");
        let mut stats = TrainingStats::new();
        for epoch in 1..=3 {
            stats.push(EpochRecord {
                epoch,
                train_loss: 1.0 / epoch as f64,
                train_accuracy: 40.0,
                val_loss: 0.8,
                val_accuracy: 55.0,
                learning_rate: 1e-3,
            });
        }
        stats.save_to_csv(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("epoch,train_loss"));
        assert!(lines[3].starts_with("3,0.333333"));
    }

    #[test]
    fn recording_sink_filters_by_tag() {
        let mut sink = RecordingSink::default();
        sink.scalar("a", 0, 1.0).unwrap();
        sink.scalar("b", 0, 2.0).unwrap();
        sink.scalar("a", 1, 3.0).unwrap();
        assert_eq!(sink.values("a"), vec![1.0, 3.0]);
    }
}
