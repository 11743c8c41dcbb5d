//! Mutable progress of one run, owned by the engine and checkpointed as `state.json`

use super::schedule::SchedulerState;
use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// AdamW hyperparameters and step count.
///
/// Candle's AdamW keeps its moment estimates private, so a resumed run starts
/// with fresh moments; everything else needed to continue is recorded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: String,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub steps: u64,
    pub trainable_parameters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: u64,
    pub epoch: u32,
    /// Micro-batches already consumed in `epoch` (data cursor for resume)
    pub batches_in_epoch: usize,
    pub best_metric: Option<f64>,
    pub best_step: Option<u64>,
    pub evals_since_improvement: u32,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
    pub seed: u64,
}

impl TrainingState {
    pub fn new(seed: u64, optimizer: OptimizerState, scheduler: SchedulerState) -> Self {
        Self {
            global_step: 0,
            epoch: 0,
            batches_in_epoch: 0,
            best_metric: None,
            best_step: None,
            evals_since_improvement: 0,
            optimizer,
            scheduler,
            seed,
        }
    }

    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Checkpoint(format!("cannot read training state {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            HarnessError::Checkpoint(format!("corrupt training state {}: {e}", path.display()))
        })
    }
}
