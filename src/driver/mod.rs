//! Run driver: starts training runs on blocking workers and tracks them by id
//!
//! Configuration, dataset and model problems are reported by `start_run`
//! itself; once a `RunId` is issued the run proceeds on its own worker and
//! is observed through `get_status` / `get_artifacts` / `wait`.

use crate::config::RunConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::model::load_model;
use crate::train::checkpoint::{list_checkpoints, BEST_DIR};
use crate::train::{
    LogProgressSink, PreparedRun, ProgressEvent, ProgressSink, RunFailure, RunState, RunSummary,
    TrainingEngine, METRICS_FILE, SUMMARY_FILE,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Opaque identifier for a run started by the driver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
    pub current_step: u64,
    pub total_steps: Option<u64>,
    /// Latest value per metric, keyed `<split>/<name>`
    pub latest_metrics: BTreeMap<String, f64>,
    pub output_dir: PathBuf,
    pub error: Option<RunFailure>,
}

impl RunStatus {
    fn new(run_id: RunId, output_dir: PathBuf) -> Self {
        Self {
            run_id,
            state: RunState::Initializing,
            current_step: 0,
            total_steps: None,
            latest_metrics: BTreeMap::new(),
            output_dir,
            error: None,
        }
    }
}

/// Files a run has produced so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArtifacts {
    pub checkpoint_paths: Vec<PathBuf>,
    pub best_checkpoint: Option<PathBuf>,
    pub plot_paths: Vec<PathBuf>,
    pub metrics_log: Option<PathBuf>,
    pub summary: Option<PathBuf>,
}

impl RunArtifacts {
    /// Scan an output directory
    pub fn scan(output_dir: &Path) -> HarnessResult<Self> {
        let checkpoint_paths = list_checkpoints(output_dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        let mut plot_paths = Vec::new();
        let plots = output_dir.join("plots");
        if plots.is_dir() {
            for entry in std::fs::read_dir(&plots)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "html") {
                    plot_paths.push(path);
                }
            }
            plot_paths.sort();
        }
        let existing = |name: &str| {
            let path = output_dir.join(name);
            path.exists().then_some(path)
        };
        Ok(Self {
            checkpoint_paths,
            best_checkpoint: existing(BEST_DIR),
            plot_paths,
            metrics_log: existing(METRICS_FILE),
            summary: existing(SUMMARY_FILE),
        })
    }
}

/// Keeps a run's status current from engine events
struct StatusSink {
    status: Arc<Mutex<RunStatus>>,
    log: LogProgressSink,
}

impl ProgressSink for StatusSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut status) = self.status.lock() {
            match &event {
                ProgressEvent::StateChanged { state } => status.state = *state,
                ProgressEvent::Step { step, total, .. } => {
                    status.current_step = *step;
                    status.total_steps = Some(*total);
                }
                ProgressEvent::Metric { record } => {
                    status
                        .latest_metrics
                        .insert(format!("{}/{}", record.split, record.name), record.value);
                }
                ProgressEvent::Checkpoint { step, .. } => status.current_step = *step,
                ProgressEvent::Message { .. } => {}
            }
        }
        self.log.on_event(event);
    }
}

struct RunHandle {
    status: Arc<Mutex<RunStatus>>,
    cancel: Arc<AtomicBool>,
    task: Option<JoinHandle<HarnessResult<RunSummary>>>,
    output_dir: PathBuf,
}

fn worker_error(err: tokio::task::JoinError) -> HarnessError {
    HarnessError::Resource(format!("run worker failed: {err}"))
}

#[derive(Default)]
pub struct RunDriver {
    runs: tokio::sync::Mutex<HashMap<RunId, RunHandle>>,
}

impl RunDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, load data and model, then launch the run on a blocking worker
    pub async fn start_run(&self, config: RunConfig) -> HarnessResult<RunId> {
        let (prepared, model) = tokio::task::spawn_blocking(move || {
            let prepared = PreparedRun::prepare(config)?;
            let model = load_model(&prepared.config.model, prepared.config.training.seed)?;
            Ok::<_, HarnessError>((prepared, model))
        })
        .await
        .map_err(worker_error)??;

        let id = RunId::new();
        let output_dir = prepared.config.output.dir.clone();
        let status = Arc::new(Mutex::new(RunStatus::new(id.clone(), output_dir.clone())));
        let cancel = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(StatusSink {
            status: status.clone(),
            log: LogProgressSink,
        });

        let engine = TrainingEngine::new(prepared, model)
            .with_sink(sink)
            .with_cancel_flag(cancel.clone());
        let task_status = status.clone();
        let task = tokio::task::spawn_blocking(move || {
            let result = engine.run();
            if let Ok(mut status) = task_status.lock() {
                match &result {
                    Ok(summary) => {
                        status.state = summary.state;
                        status.current_step = summary.total_steps;
                        status.error = summary.error.clone();
                    }
                    Err(err) => {
                        status.state = RunState::Aborted;
                        status.error = Some(RunFailure::from(err));
                    }
                }
            }
            result
        });

        info!("Started run {id} -> {}", output_dir.display());
        self.runs.lock().await.insert(
            id.clone(),
            RunHandle {
                status,
                cancel,
                task: Some(task),
                output_dir,
            },
        );
        Ok(id)
    }

    pub async fn get_status(&self, id: &RunId) -> HarnessResult<RunStatus> {
        let runs = self.runs.lock().await;
        let handle = runs.get(id).ok_or_else(|| unknown_run(id))?;
        let status = handle
            .status
            .lock()
            .map_err(|_| HarnessError::Resource(format!("status of run {id} is poisoned")))?;
        Ok(status.clone())
    }

    pub async fn get_artifacts(&self, id: &RunId) -> HarnessResult<RunArtifacts> {
        let output_dir = {
            let runs = self.runs.lock().await;
            runs.get(id).ok_or_else(|| unknown_run(id))?.output_dir.clone()
        };
        RunArtifacts::scan(&output_dir)
    }

    /// Request cooperative cancellation; the run stops after its in-flight step
    pub async fn cancel(&self, id: &RunId) -> HarnessResult<()> {
        let runs = self.runs.lock().await;
        let handle = runs.get(id).ok_or_else(|| unknown_run(id))?;
        handle.cancel.store(true, Ordering::SeqCst);
        info!("Cancellation requested for run {id}");
        Ok(())
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(&self, id: &RunId) -> HarnessResult<RunSummary> {
        let (task, output_dir) = {
            let mut runs = self.runs.lock().await;
            let handle = runs.get_mut(id).ok_or_else(|| unknown_run(id))?;
            (handle.task.take(), handle.output_dir.clone())
        };
        match task {
            Some(task) => task.await.map_err(worker_error)?,
            None => RunSummary::load(&output_dir),
        }
    }

    pub async fn run_ids(&self) -> Vec<RunId> {
        self.runs.lock().await.keys().cloned().collect()
    }
}

fn unknown_run(id: &RunId) -> HarnessError {
    HarnessError::Config(format!("unknown run id {id}"))
}
