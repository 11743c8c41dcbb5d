//! Dataset loading: CSV rows of named text fields, shuffled and split
//!
//! - `DataRow`: one CSV record keyed by column name
//! - `load_splits`: read, verify columns, shuffle with the run seed, split
//! - `ByteTokenizer`: byte-level ids shared by both objectives

pub mod tokenizer;

pub use tokenizer::{ByteTokenizer, BOS_ID, EOS_ID, MASK_ID, PAD_ID, VOCAB_SIZE};

use crate::config::{DataConfig, ObjectiveConfig};
use crate::error::{HarnessError, HarnessResult};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;

/// A single dataset record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataRow {
    fields: BTreeMap<String, String>,
}

impl DataRow {
    pub fn new<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    /// Field value, or a `DataError` naming the missing column
    pub fn require(&self, column: &str) -> HarnessResult<&str> {
        self.get(column)
            .ok_or_else(|| HarnessError::Data(format!("row has no column '{column}'")))
    }
}

/// Train and held-out rows for one run
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Vec<DataRow>,
    pub eval: Vec<DataRow>,
}

/// Columns an objective reads from every row
pub fn required_columns(data: &DataConfig, objective: &ObjectiveConfig) -> Vec<String> {
    match objective {
        ObjectiveConfig::Masked { .. } => data.text_fields.clone(),
        ObjectiveConfig::Causal { .. } => vec![data.question_field.clone(), data.answer_field.clone()],
    }
}

/// Read every row of a headed CSV file
pub fn read_csv(path: &Path) -> HarnessResult<(Vec<String>, Vec<DataRow>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_path(path)
        .map_err(|e| HarnessError::Data(format!("cannot open dataset {}: {e}", path.display())))?;

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(DataRow::new(
            headers.iter().cloned().zip(record.iter().map(str::to_string)),
        ));
    }
    Ok((headers, rows))
}

/// Load the configured dataset and split off the held-out rows
pub fn load_splits(
    data: &DataConfig,
    objective: &ObjectiveConfig,
    seed: u64,
) -> HarnessResult<DatasetSplits> {
    let (headers, rows) = read_csv(&data.path)?;
    let missing: Vec<String> = required_columns(data, objective)
        .into_iter()
        .filter(|c| !headers.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(HarnessError::Data(format!(
            "dataset {} is missing column(s): {} (found: {})",
            data.path.display(),
            missing.join(", "),
            headers.join(", ")
        )));
    }

    let splits = split_rows(rows, data.validation_split, seed)?;
    info!(
        "Loaded dataset {} | train={} | eval={}",
        data.path.display(),
        splits.train.len(),
        splits.eval.len()
    );
    Ok(splits)
}

/// Shuffle with `seed` and hold out `fraction` of the rows (at least one on each side)
pub fn split_rows(mut rows: Vec<DataRow>, fraction: f64, seed: u64) -> HarnessResult<DatasetSplits> {
    if rows.len() < 2 {
        return Err(HarnessError::Data(format!(
            "dataset needs at least 2 rows to split, found {}",
            rows.len()
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    rows.shuffle(&mut rng);

    let n = rows.len();
    let eval_len = ((n as f64 * fraction).round() as usize).clamp(1, n - 1);
    let train = rows.split_off(eval_len);
    Ok(DatasetSplits { train, eval: rows })
}
