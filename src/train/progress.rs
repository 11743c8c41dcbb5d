use super::engine::RunState;
use crate::metrics::MetricRecord;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Side-channel notifications from a running engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StateChanged { state: RunState },
    Step { step: u64, total: u64, loss: f64, learning_rate: f64 },
    Metric { record: MetricRecord },
    Checkpoint { step: u64, path: PathBuf, best: bool },
    Message { message: String },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to the `log` facade
#[derive(Debug, Default)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::StateChanged { state } => info!("[run] state -> {state:?}"),
            ProgressEvent::Step { .. } | ProgressEvent::Metric { .. } => {}
            ProgressEvent::Checkpoint { step, path, best } => {
                let tag = if best { " (best)" } else { "" };
                info!("[run] checkpoint step {step}{tag} -> {}", path.display());
            }
            ProgressEvent::Message { message } => info!("[run] {message}"),
        }
    }
}
