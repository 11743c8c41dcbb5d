//! Training run: engine, checkpoints, schedules and progress reporting

pub mod checkpoint;
pub mod early_stop;
pub mod engine;
pub mod prefetch;
pub mod progress;
pub mod schedule;
pub mod state;

pub use checkpoint::{list_checkpoints, load_checkpoint, CheckpointManager, CheckpointMeta, LoadedCheckpoint};
pub use early_stop::{EarlyStopping, EvalVerdict};
pub use engine::{PreparedRun, RunFailure, RunState, RunSummary, TrainingEngine, METRICS_FILE, SUMMARY_FILE};
pub use progress::{LogProgressSink, ProgressEvent, ProgressSink};
pub use schedule::LrScheduler;
pub use state::TrainingState;
