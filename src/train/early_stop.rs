//! Early stopping on the configured evaluation metric

use super::state::TrainingState;
use crate::config::{EarlyStoppingConfig, StopMetric};

/// What one evaluation meant for early stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalVerdict {
    /// Strictly better than every earlier evaluation
    Improved,
    /// Not better; `since` evaluations without improvement so far
    NoImprovement { since: u32 },
    /// Patience exhausted; the run should stop
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStopping {
    patience: u32,
    metric: StopMetric,
    greater_is_better: bool,
}

impl EarlyStopping {
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            patience: config.patience,
            metric: config.metric,
            greater_is_better: config.greater_is_better,
        }
    }

    pub fn metric(&self) -> StopMetric {
        self.metric
    }

    fn is_improvement(&self, value: f64, best: Option<f64>) -> bool {
        match best {
            None => value.is_finite(),
            Some(best) if self.greater_is_better => value > best,
            Some(best) => value < best,
        }
    }

    /// Fold one evaluation into the tracked best value and no-improvement counter.
    ///
    /// The run stops once the counter exceeds `patience`, one evaluation later
    /// than a stop on reaching it. With patience 2 and eval losses
    /// `[0.9, 0.8, 0.85, 0.86, 0.87]` the counter reads 1, 2, 3 over the last
    /// three evaluations, so the stop comes after the fifth evaluation and
    /// the best value stays 0.8 from the second.
    pub fn observe(&self, state: &mut TrainingState, value: f64) -> EvalVerdict {
        if self.is_improvement(value, state.best_metric) {
            state.best_metric = Some(value);
            state.best_step = Some(state.global_step);
            state.evals_since_improvement = 0;
            return EvalVerdict::Improved;
        }
        state.evals_since_improvement += 1;
        if state.evals_since_improvement > self.patience {
            EvalVerdict::Exhausted
        } else {
            EvalVerdict::NoImprovement {
                since: state.evals_since_improvement,
            }
        }
    }
}

/// Best-value tracking used when early stopping is disabled
pub fn track_best(state: &mut TrainingState, value: f64) -> bool {
    let improved = match state.best_metric {
        None => value.is_finite(),
        Some(best) => value < best,
    };
    if improved {
        state.best_metric = Some(value);
        state.best_step = Some(state.global_step);
        state.evals_since_improvement = 0;
    } else {
        state.evals_since_improvement += 1;
    }
    improved
}
