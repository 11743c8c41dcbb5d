//! Error taxonomy for the fine-tuning harness
//!
//! Configuration, template and dataset problems are rejected before any
//! compute is allocated. Numerical and resource failures abort a run in
//! progress but leave earlier checkpoints and the flushed metrics log intact.

use thiserror::Error;

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid or contradictory run configuration
    #[error("config error: {0}")]
    Config(String),

    /// Causal template / placeholder mismatch
    #[error("format error: {0}")]
    Format(String),

    /// Dataset could not be read or does not match the configured columns
    #[error("data error: {0}")]
    Data(String),

    /// Non-finite loss; the run is aborted
    #[error("non-finite loss {value} at step {step} (batch {batch_index})")]
    Numerical {
        step: u64,
        batch_index: usize,
        value: f32,
    },

    /// Device, memory or tensor backend failure
    #[error("resource error: {0}")]
    Resource(String),

    /// Missing or corrupt checkpoint
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl From<candle_core::Error> for HarnessError {
    fn from(err: candle_core::Error) -> Self {
        HarnessError::Resource(err.to_string())
    }
}

impl HarnessError {
    /// Stable machine-readable kind, reported by the run driver
    pub fn kind(&self) -> &'static str {
        match self {
            HarnessError::Config(_) => "config_error",
            HarnessError::Format(_) => "format_error",
            HarnessError::Data(_) | HarnessError::Csv(_) => "data_error",
            HarnessError::Numerical { .. } => "numerical_error",
            HarnessError::Resource(_) => "resource_error",
            HarnessError::Checkpoint(_) => "checkpoint_error",
            HarnessError::Io(_) => "io_error",
            HarnessError::Json(_) | HarnessError::Yaml(_) => "serialization_error",
        }
    }

    /// True for errors raised before a run allocates anything
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            HarnessError::Config(_)
                | HarnessError::Format(_)
                | HarnessError::Data(_)
                | HarnessError::Csv(_)
                | HarnessError::Yaml(_)
        )
    }

    /// Process exit code for the CLI: 2 = rejected before start, 1 = fatal
    pub fn exit_code(&self) -> u8 {
        if self.is_rejection() {
            2
        } else {
            1
        }
    }
}
