//! Learning-rate schedule: linear warmup to the peak, then decay

use crate::config::LrScheduleKind;
use serde::{Deserialize, Serialize};

/// Serialisable scheduler position, stored in every checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: LrScheduleKind,
    pub peak_lr: f64,
    pub warmup_steps: u64,
    pub total_steps: u64,
    /// Rate used by the most recent optimizer step
    pub last_lr: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LrScheduler {
    kind: LrScheduleKind,
    peak_lr: f64,
    warmup_steps: u64,
    total_steps: u64,
}

impl LrScheduler {
    pub fn new(kind: LrScheduleKind, peak_lr: f64, warmup_steps: u64, total_steps: u64) -> Self {
        Self {
            kind,
            peak_lr,
            warmup_steps,
            total_steps: total_steps.max(1),
        }
    }

    /// Rate for the optimizer step that follows `completed` finished steps
    pub fn lr_at(&self, completed: u64) -> f64 {
        if completed < self.warmup_steps {
            return self.peak_lr * (completed + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((completed - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        match self.kind {
            LrScheduleKind::Constant => self.peak_lr,
            LrScheduleKind::Linear => self.peak_lr * (1.0 - progress),
            LrScheduleKind::Cosine => {
                self.peak_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
            }
        }
    }

    pub fn state(&self, last_lr: f64) -> SchedulerState {
        SchedulerState {
            kind: self.kind,
            peak_lr: self.peak_lr,
            warmup_steps: self.warmup_steps,
            total_steps: self.total_steps,
            last_lr,
        }
    }
}
