//! Checkpoint store: `checkpoint-<step>/` snapshots with integrity checks
//!
//! Each snapshot holds the weight file for its scope, `state.json` and a
//! `checkpoint.json` manifest carrying the weight file's SHA256. `best/`
//! mirrors the snapshot with the best early-stopping metric. Old step
//! snapshots are rotated out past `save_total_limit`.

use super::state::TrainingState;
use crate::error::{HarnessError, HarnessResult};
use crate::model::{LanguageModel, WeightScope};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "state.json";
pub const MANIFEST_FILE: &str = "checkpoint.json";
pub const BEST_DIR: &str = "best";
const STEP_PREFIX: &str = "checkpoint-";

/// Monitored metric at the time a checkpoint was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetric {
    pub name: String,
    pub value: f64,
}

/// Manifest written last into every checkpoint directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: u64,
    pub epoch: u32,
    pub model: String,
    pub scope: WeightScope,
    pub weights_file: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub metric: Option<CheckpointMetric>,
    pub timestamp: DateTime<Utc>,
}

/// A verified checkpoint read back from disk
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub dir: PathBuf,
    pub meta: CheckpointMeta,
    pub state: TrainingState,
}

impl LoadedCheckpoint {
    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(&self.meta.weights_file)
    }
}

fn sha256_file(path: &Path) -> HarnessResult<(String, u64)> {
    let bytes = std::fs::read(path)?;
    Ok((hex::encode(Sha256::digest(&bytes)), bytes.len() as u64))
}

pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: Option<usize>,
}

impl CheckpointManager {
    pub fn new(output_dir: impl Into<PathBuf>, save_total_limit: Option<usize>) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_total_limit,
        }
    }

    pub fn step_dir(&self, step: u64) -> PathBuf {
        self.output_dir.join(format!("{STEP_PREFIX}{step}"))
    }

    pub fn best_dir(&self) -> PathBuf {
        self.output_dir.join(BEST_DIR)
    }

    /// Write `checkpoint-<state.global_step>/`, replacing any earlier one for the same step
    pub fn save<M: LanguageModel>(
        &self,
        model: &M,
        state: &TrainingState,
        scope: WeightScope,
        metric: Option<CheckpointMetric>,
    ) -> HarnessResult<CheckpointMeta> {
        let dir = self.step_dir(state.global_step);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        let weights_path = dir.join(scope.file_name());
        model.save_weights(&weights_path, scope)?;
        state.save(&dir.join(STATE_FILE))?;
        let (checksum, size_bytes) = sha256_file(&weights_path)?;

        let meta = CheckpointMeta {
            step: state.global_step,
            epoch: state.epoch,
            model: model.name().to_string(),
            scope,
            weights_file: scope.file_name().to_string(),
            checksum,
            size_bytes,
            metric,
            timestamp: Utc::now(),
        };
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&meta)?)?;

        info!(
            "Saved checkpoint step {} ({:?}, {} bytes) -> {}",
            meta.step,
            scope,
            size_bytes,
            dir.display()
        );
        self.rotate()?;
        Ok(meta)
    }

    /// Copy `checkpoint-<step>/` into `best/`
    pub fn mirror_best(&self, step: u64) -> HarnessResult<PathBuf> {
        let source = self.step_dir(step);
        let best = self.best_dir();
        if best.exists() {
            std::fs::remove_dir_all(&best)?;
        }
        std::fs::create_dir_all(&best)?;
        for entry in std::fs::read_dir(&source)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), best.join(entry.file_name()))?;
            }
        }
        info!("Best checkpoint is now step {step}");
        Ok(best)
    }

    /// Step checkpoints on disk, oldest first
    pub fn list(&self) -> HarnessResult<Vec<(u64, PathBuf)>> {
        list_checkpoints(&self.output_dir)
    }

    /// Delete the oldest step checkpoints beyond the configured limit
    pub fn rotate(&self) -> HarnessResult<usize> {
        let Some(limit) = self.save_total_limit else {
            return Ok(0);
        };
        let existing = self.list()?;
        if existing.len() <= limit {
            return Ok(0);
        }
        let remove = existing.len() - limit;
        for (step, dir) in &existing[..remove] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                warn!("Could not remove checkpoint step {step}: {e}");
            }
        }
        info!("Removed {remove} old checkpoint(s), keeping latest {limit}");
        Ok(remove)
    }
}

/// Step checkpoints under `output_dir`, oldest first
pub fn list_checkpoints(output_dir: &Path) -> HarnessResult<Vec<(u64, PathBuf)>> {
    if !output_dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(step) = name
            .to_str()
            .and_then(|n| n.strip_prefix(STEP_PREFIX))
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        if entry.path().join(MANIFEST_FILE).exists() {
            found.push((step, entry.path()));
        }
    }
    found.sort_by_key(|(step, _)| *step);
    Ok(found)
}

/// Read a checkpoint manifest and state, verifying the weight checksum
pub fn load_checkpoint(dir: &Path) -> HarnessResult<LoadedCheckpoint> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let text = std::fs::read_to_string(&manifest_path).map_err(|e| {
        HarnessError::Checkpoint(format!("no checkpoint manifest at {}: {e}", manifest_path.display()))
    })?;
    let meta: CheckpointMeta = serde_json::from_str(&text)
        .map_err(|e| HarnessError::Checkpoint(format!("corrupt manifest {}: {e}", manifest_path.display())))?;

    let weights = dir.join(&meta.weights_file);
    let (checksum, _) = sha256_file(&weights)
        .map_err(|e| HarnessError::Checkpoint(format!("cannot read {}: {e}", weights.display())))?;
    if checksum != meta.checksum {
        return Err(HarnessError::Checkpoint(format!(
            "checksum mismatch for {}: expected {}, got {}",
            weights.display(),
            meta.checksum,
            checksum
        )));
    }

    let state = TrainingState::load(&dir.join(STATE_FILE))?;
    if state.global_step != meta.step {
        return Err(HarnessError::Checkpoint(format!(
            "state step {} does not match manifest step {}",
            state.global_step, meta.step
        )));
    }
    info!("Loaded checkpoint step {} from {}, checksum OK", meta.step, dir.display());
    Ok(LoadedCheckpoint {
        dir: dir.to_path_buf(),
        meta,
        state,
    })
}
