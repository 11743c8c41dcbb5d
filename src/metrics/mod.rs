//! Metrics recorder: ordered scalar readings with a durable JSON-lines log
//!
//! - `record` appends in chronological order and indexes by (split, name)
//! - `snapshot` hands the full sequence to the plotter
//! - pending records are appended to `metrics.log` every `flush_every`
//!   records and on demand, so a crashed run keeps everything up to the last flush

pub mod plot;

use crate::error::{HarnessError, HarnessResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const TRAIN_LOSS: &str = "train_loss";
pub const LEARNING_RATE: &str = "learning_rate";
pub const EVAL_LOSS: &str = "eval_loss";
pub const PERPLEXITY: &str = "perplexity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Eval,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Eval => write!(f, "eval"),
        }
    }
}

/// One point-in-time scalar reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: u64,
    pub epoch: u32,
    pub split: Split,
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricRecord {
    pub fn new(step: u64, epoch: u32, split: Split, name: impl Into<String>, value: f64) -> Self {
        Self {
            step,
            epoch,
            split,
            name: name.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct MetricsRecorder {
    records: Vec<MetricRecord>,
    index: BTreeMap<(Split, String), Vec<usize>>,
    log_path: Option<PathBuf>,
    flushed: usize,
    flush_every: usize,
}

impl MetricsRecorder {
    /// In-memory recorder with no durable log
    pub fn in_memory() -> Self {
        Self {
            records: Vec::new(),
            index: BTreeMap::new(),
            log_path: None,
            flushed: 0,
            flush_every: usize::MAX,
        }
    }

    /// Recorder backed by `path`; a fresh run truncates it, a resumed run appends
    pub fn with_log(path: impl Into<PathBuf>, flush_every: usize, append: bool) -> HarnessResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)?;
        Ok(Self {
            log_path: Some(path),
            flush_every: flush_every.max(1),
            ..Self::in_memory()
        })
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn record(&mut self, record: MetricRecord) -> HarnessResult<()> {
        self.index
            .entry((record.split, record.name.clone()))
            .or_default()
            .push(self.records.len());
        self.records.push(record);
        if self.records.len() - self.flushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// The full ordered sequence
    pub fn snapshot(&self) -> &[MetricRecord] {
        &self.records
    }

    /// `(step, value)` points of one metric, in recording order
    pub fn series(&self, split: Split, name: &str) -> Vec<(u64, f64)> {
        self.index
            .get(&(split, name.to_string()))
            .map(|idx| idx.iter().map(|&i| (self.records[i].step, self.records[i].value)).collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, split: Split, name: &str) -> Option<&MetricRecord> {
        self.index
            .get(&(split, name.to_string()))
            .and_then(|idx| idx.last())
            .map(|&i| &self.records[i])
    }

    /// Most recent value of every metric, keyed `<split>/<name>`
    pub fn latest_values(&self) -> BTreeMap<String, f64> {
        latest_values(&self.records)
    }

    pub fn pending(&self) -> usize {
        self.records.len() - self.flushed
    }

    /// Append every unflushed record to the log
    pub fn flush(&mut self) -> HarnessResult<()> {
        let Some(path) = &self.log_path else {
            self.flushed = self.records.len();
            return Ok(());
        };
        if self.flushed == self.records.len() {
            return Ok(());
        }
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        let mut writer = BufWriter::new(file);
        for record in &self.records[self.flushed..] {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        self.flushed = self.records.len();
        Ok(())
    }

    /// Parse a `metrics.log` written by a recorder
    pub fn read_log(path: &Path) -> HarnessResult<Vec<MetricRecord>> {
        let file = std::fs::File::open(path)?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| {
                HarnessError::Data(format!("{}:{}: {e}", path.display(), line_no + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Drop every record of the log at `path` with a step after `step`.
    ///
    /// A resumed run replays those steps, so keeping them would duplicate
    /// them out of order. Returns the number of records removed.
    pub fn truncate_log_after(path: &Path, step: u64) -> HarnessResult<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let records = Self::read_log(path)?;
        let total = records.len();
        let kept: Vec<_> = records.into_iter().filter(|r| r.step <= step).collect();
        if kept.len() == total {
            return Ok(0);
        }
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        for record in &kept {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(total - kept.len())
    }
}

/// Most recent value of every metric in `records`, keyed `<split>/<name>`
pub fn latest_values(records: &[MetricRecord]) -> BTreeMap<String, f64> {
    records
        .iter()
        .map(|r| (format!("{}/{}", r.split, r.name), r.value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_and_latest() {
        let mut rec = MetricsRecorder::in_memory();
        rec.record(MetricRecord::new(1, 0, Split::Train, TRAIN_LOSS, 2.0)).unwrap();
        rec.record(MetricRecord::new(2, 0, Split::Train, TRAIN_LOSS, 1.5)).unwrap();
        rec.record(MetricRecord::new(2, 0, Split::Eval, EVAL_LOSS, 1.7)).unwrap();
        assert_eq!(rec.series(Split::Train, TRAIN_LOSS), vec![(1, 2.0), (2, 1.5)]);
        assert_eq!(rec.latest(Split::Eval, EVAL_LOSS).unwrap().value, 1.7);
        assert!(rec.latest(Split::Eval, PERPLEXITY).is_none());
        assert_eq!(rec.snapshot().len(), 3);
        assert_eq!(rec.latest_values()["train/train_loss"], 1.5);
    }

    #[test]
    fn test_flush_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.log");
        let mut rec = MetricsRecorder::with_log(&path, 2, false).unwrap();
        rec.record(MetricRecord::new(1, 0, Split::Train, TRAIN_LOSS, 3.0)).unwrap();
        assert_eq!(MetricsRecorder::read_log(&path).unwrap().len(), 0);
        rec.record(MetricRecord::new(2, 0, Split::Train, TRAIN_LOSS, 2.0)).unwrap();
        assert_eq!(MetricsRecorder::read_log(&path).unwrap().len(), 2);
        rec.record(MetricRecord::new(3, 0, Split::Train, TRAIN_LOSS, 1.0)).unwrap();
        assert_eq!(rec.pending(), 1);
        rec.flush().unwrap();
        let logged = MetricsRecorder::read_log(&path).unwrap();
        assert_eq!(logged, rec.snapshot());
    }

    #[test]
    fn test_append_mode_keeps_previous_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.log");
        let mut first = MetricsRecorder::with_log(&path, 1, false).unwrap();
        first.record(MetricRecord::new(1, 0, Split::Eval, EVAL_LOSS, 1.0)).unwrap();
        let mut second = MetricsRecorder::with_log(&path, 1, true).unwrap();
        second.record(MetricRecord::new(2, 0, Split::Eval, EVAL_LOSS, 0.9)).unwrap();
        assert_eq!(MetricsRecorder::read_log(&path).unwrap().len(), 2);
        MetricsRecorder::with_log(&path, 1, false).unwrap();
        assert!(MetricsRecorder::read_log(&path).unwrap().is_empty());
    }

    #[test]
    fn test_truncate_log_after_resume_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.log");
        assert_eq!(MetricsRecorder::truncate_log_after(&path, 2).unwrap(), 0);

        let mut rec = MetricsRecorder::with_log(&path, 1, false).unwrap();
        for step in 1..=4 {
            rec.record(MetricRecord::new(step, 0, Split::Train, TRAIN_LOSS, 1.0 / step as f64)).unwrap();
        }
        rec.record(MetricRecord::new(4, 0, Split::Eval, EVAL_LOSS, 0.5)).unwrap();

        assert_eq!(MetricsRecorder::truncate_log_after(&path, 2).unwrap(), 3);
        let steps: Vec<u64> = MetricsRecorder::read_log(&path).unwrap().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![1, 2]);

        let mut resumed = MetricsRecorder::with_log(&path, 1, true).unwrap();
        resumed.record(MetricRecord::new(3, 0, Split::Train, TRAIN_LOSS, 0.3)).unwrap();
        let steps: Vec<u64> = MetricsRecorder::read_log(&path).unwrap().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }
}
