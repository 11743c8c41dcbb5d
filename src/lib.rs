//! lmtune: fine-tuning harness for small language models
//!
//! Freezing policies and LoRA adapters decide what trains, a masked or
//! causal objective decides what the loss sees, and the training engine runs
//! early-stopped, checkpointed, resumable runs with a durable metrics log.

pub mod config;
pub mod data;
pub mod driver;
pub mod error;
pub mod freeze;
pub mod metrics;
pub mod model;
pub mod objective;
pub mod train;

pub use config::RunConfig;
pub use driver::{RunArtifacts, RunDriver, RunId, RunStatus};
pub use error::{HarnessError, HarnessResult};
pub use freeze::FreezePlan;
pub use metrics::{MetricRecord, MetricsRecorder};
pub use model::{LanguageModel, TinyLm};
pub use objective::Objective;
pub use train::{PreparedRun, RunState, RunSummary, TrainingEngine};
