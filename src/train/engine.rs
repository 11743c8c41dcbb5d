//! Training loop engine
//!
//! Drives one run through `Initializing -> Running <-> Evaluating ->
//! (Completed | EarlyStopped | Cancelled) -> Finalizing`, or straight to
//! `Aborted` on a fatal error. The engine owns the model, the optimizer and
//! the `TrainingState` for the whole run; nothing else mutates them.
//!
//! - optimizer: candle `AdamW` over the trainable variables only
//! - gradient accumulation: micro-batch losses are averaged, one backward per step
//! - a non-finite loss aborts before the optimizer touches the weights
//! - cancellation is honoured between optimizer steps, never inside one

use super::checkpoint::{load_checkpoint, CheckpointManager, CheckpointMetric};
use super::early_stop::{track_best, EarlyStopping, EvalVerdict};
use super::prefetch::{BatchPrefetcher, DataCursor, PrefetchItem};
use super::progress::{LogProgressSink, ProgressEvent, ProgressSink};
use super::schedule::LrScheduler;
use super::state::{OptimizerState, TrainingState};
use crate::config::{RunConfig, StopMetric};
use crate::data::{self, DatasetSplits};
use crate::error::{HarnessError, HarnessResult};
use crate::freeze;
use crate::metrics::{
    plot, MetricRecord, MetricsRecorder, Split, EVAL_LOSS, LEARNING_RATE, PERPLEXITY, TRAIN_LOSS,
};
use crate::model::{ForwardMode, LanguageModel, WeightScope};
use crate::objective::{mean_token_nll, token_nll, Batch, EncodedExample, Objective};
use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const SUMMARY_FILE: &str = "summary.json";
pub const METRICS_FILE: &str = "metrics.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Running,
    Evaluating,
    Finalizing,
    Completed,
    EarlyStopped,
    Cancelled,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::EarlyStopped | RunState::Cancelled | RunState::Aborted
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Completed | RunState::EarlyStopped | RunState::Cancelled)
    }

    pub fn stop_reason(&self) -> &'static str {
        match self {
            RunState::Completed => "step budget exhausted",
            RunState::EarlyStopped => "early-stopping patience exhausted",
            RunState::Cancelled => "cancelled by request",
            RunState::Aborted => "fatal error",
            _ => "in progress",
        }
    }
}

/// Error attached to an aborted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
}

impl From<&HarnessError> for RunFailure {
    fn from(err: &HarnessError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// `summary.json`: what a finished run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub model: String,
    pub objective: String,
    pub state: RunState,
    pub stop_reason: String,
    pub total_steps: u64,
    pub epoch: u32,
    pub final_metrics: BTreeMap<String, f64>,
    pub best_metric: Option<f64>,
    pub best_step: Option<u64>,
    pub best_checkpoint: Option<PathBuf>,
    pub checkpoints: Vec<PathBuf>,
    pub metrics_log: PathBuf,
    pub plot: Option<PathBuf>,
    pub transitions: Vec<RunState>,
    pub error: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn load(output_dir: &Path) -> HarnessResult<Self> {
        let path = output_dir.join(SUMMARY_FILE);
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// 0 for successful terminal states, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        if self.state.is_success() {
            0
        } else {
            1
        }
    }
}

/// Everything that can be checked before any model exists
pub struct PreparedRun {
    pub config: RunConfig,
    pub objective: Objective,
    pub train: Vec<EncodedExample>,
    pub eval: Vec<EncodedExample>,
}

impl PreparedRun {
    /// Validate the config, load the dataset and encode every example
    pub fn prepare(config: RunConfig) -> HarnessResult<Self> {
        config.validate()?;
        let splits = data::load_splits(&config.data, &config.objective, config.training.seed)?;
        Self::from_splits(config, splits)
    }

    /// Same as `prepare` with rows already in memory
    pub fn from_splits(config: RunConfig, splits: DatasetSplits) -> HarnessResult<Self> {
        config.validate()?;
        let objective = Objective::from_config(&config)?;
        let train = objective.encode_all(&splits.train, "train")?;
        let eval = objective.encode_all(&splits.eval, "eval")?;
        if train.is_empty() || eval.is_empty() {
            return Err(HarnessError::Data("train and eval splits must both be non-empty".into()));
        }
        info!(
            "Prepared {} run | train={} | eval={}",
            objective.name(),
            train.len(),
            eval.len()
        );
        Ok(Self {
            config,
            objective,
            train,
            eval,
        })
    }
}

/// Per-run machinery built in `Initializing`
struct Session {
    optimizer: AdamW,
    scheduler: LrScheduler,
    training: TrainingState,
    recorder: MetricsRecorder,
    checkpoints: CheckpointManager,
    early_stopping: Option<EarlyStopping>,
    scope: WeightScope,
    total_steps: u64,
    resumed: bool,
    last_eval_step: Option<u64>,
    last_checkpoint_step: Option<u64>,
    loss_window: (f64, u64),
    started_at: DateTime<Utc>,
}

pub struct TrainingEngine<M: LanguageModel> {
    config: RunConfig,
    objective: Arc<Objective>,
    train: Arc<Vec<EncodedExample>>,
    eval_batches: Vec<Batch>,
    model: M,
    sink: Arc<dyn ProgressSink>,
    cancel: Arc<AtomicBool>,
    state: RunState,
    transitions: Vec<RunState>,
}

impl<M: LanguageModel> TrainingEngine<M> {
    pub fn new(run: PreparedRun, model: M) -> Self {
        let t = &run.config.training;
        let eval_batches = run.objective.eval_batches(&run.eval, t.eval_batch_size, t.seed);
        Self {
            eval_batches,
            objective: Arc::new(run.objective),
            train: Arc::new(run.train),
            config: run.config,
            model,
            sink: Arc::new(LogProgressSink),
            cancel: Arc::new(AtomicBool::new(false)),
            state: RunState::Initializing,
            transitions: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Setting the flag requests cancellation after the in-flight step
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn transition(&mut self, next: RunState) {
        self.state = next;
        self.transitions.push(next);
        self.sink.on_event(ProgressEvent::StateChanged { state: next });
    }

    /// Execute the run to a terminal state.
    ///
    /// Errors raised while initializing are returned as `Err`; anything later
    /// ends the run as `Aborted` with the error recorded in the summary.
    pub fn run(mut self) -> HarnessResult<RunSummary> {
        let started_at = Utc::now();
        self.transition(RunState::Initializing);
        let mut session = match self.initialize(started_at) {
            Ok(session) => session,
            Err(err) => {
                error!("Run rejected during initialization: {err}");
                self.transition(RunState::Aborted);
                return Err(err);
            }
        };
        self.transition(RunState::Running);

        match self.train_loop(&mut session) {
            Ok(terminal) => match self.finalize(&mut session, terminal) {
                Ok(summary) => Ok(summary),
                Err(err) => self.abort(&mut session, err),
            },
            Err(err) => self.abort(&mut session, err),
        }
    }

    fn initialize(&mut self, started_at: DateTime<Utc>) -> HarnessResult<Session> {
        let config = self.config.clone();
        let t = &config.training;

        if config.data.max_length > self.model.max_positions() {
            return Err(HarnessError::Config(format!(
                "max_length {} exceeds the model's {} positions",
                config.data.max_length,
                self.model.max_positions()
            )));
        }

        let groups = self.model.parameter_groups();
        let plan = freeze::plan(&groups, &config.freeze, &config.adapter)?;
        plan.ensure_trainable()?;
        if config.adapter.enabled {
            self.model
                .inject_adapters(&plan.adapter_groups, &config.adapter, t.seed.wrapping_add(1))?;
        }
        self.model.apply_freeze(&plan);
        info!("Freezing policy: {plan}");
        let scope = if config.adapter.enabled {
            WeightScope::AdapterOnly
        } else {
            WeightScope::Full
        };

        let total_steps = t.total_steps(self.train.len());
        let scheduler = LrScheduler::new(t.lr_schedule, t.learning_rate, t.warmup_steps, total_steps);
        let params = ParamsAdamW {
            lr: t.learning_rate,
            weight_decay: t.weight_decay,
            ..ParamsAdamW::default()
        };
        let vars = self.model.trainable_vars();
        let trainable_parameters = vars.iter().map(|v| v.elem_count()).sum();
        let optimizer = AdamW::new(vars, params.clone())?;
        let optimizer_state = OptimizerState {
            kind: "adamw".into(),
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay: params.weight_decay,
            steps: 0,
            trainable_parameters,
        };
        let mut training = TrainingState::new(t.seed, optimizer_state, scheduler.state(0.0));

        let mut resumed = false;
        if let Some(dir) = &t.resume_from {
            let checkpoint = load_checkpoint(dir)?;
            if checkpoint.meta.scope != scope {
                return Err(HarnessError::Checkpoint(format!(
                    "checkpoint holds {:?} weights but this run trains {:?}",
                    checkpoint.meta.scope, scope
                )));
            }
            self.model.load_weights(&checkpoint.weights_path(), scope)?;
            training = checkpoint.state;
            resumed = true;
            info!(
                "Resumed from {} at step {} (epoch {}, batch {})",
                dir.display(),
                training.global_step,
                training.epoch,
                training.batches_in_epoch
            );
        }

        let output_dir = &config.output.dir;
        std::fs::create_dir_all(output_dir)?;
        if resumed {
            let dropped =
                MetricsRecorder::truncate_log_after(&output_dir.join(METRICS_FILE), training.global_step)?;
            if dropped > 0 {
                info!(
                    "Dropped {dropped} metric records after step {} from {METRICS_FILE}",
                    training.global_step
                );
            }
        }
        let recorder = MetricsRecorder::with_log(
            output_dir.join(METRICS_FILE),
            t.metrics_flush_every,
            resumed,
        )?;

        info!(
            "Training '{}' | objective={} | steps={} | batch={}x{} | lr={:.2e} | schedule={:?} | trainable={}",
            self.model.name(),
            self.objective.name(),
            total_steps,
            t.batch_size,
            t.gradient_accumulation_steps,
            t.learning_rate,
            t.lr_schedule,
            trainable_parameters,
        );

        Ok(Session {
            optimizer,
            scheduler,
            training,
            recorder,
            checkpoints: CheckpointManager::new(output_dir, t.save_total_limit),
            early_stopping: t.early_stopping.as_ref().map(EarlyStopping::new),
            scope,
            total_steps,
            resumed,
            last_eval_step: None,
            last_checkpoint_step: None,
            loss_window: (0.0, 0),
            started_at,
        })
    }

    fn train_loop(&mut self, s: &mut Session) -> HarnessResult<RunState> {
        let t = self.config.training.clone();

        if t.evaluate_at_start && s.training.global_step == 0 && !s.resumed {
            self.transition(RunState::Evaluating);
            self.evaluate(s)?;
            self.transition(RunState::Running);
        }
        if s.training.global_step >= s.total_steps {
            return Ok(RunState::Completed);
        }

        let cursor = DataCursor {
            epoch: s.training.epoch,
            batches_in_epoch: s.training.batches_in_epoch,
        };
        let mut prefetch = BatchPrefetcher::spawn(
            self.objective.clone(),
            self.train.clone(),
            t.batch_size,
            t.seed,
            cursor,
            t.prefetch_depth,
        )?;
        let mut pending: Vec<(Tensor, f32)> = Vec::with_capacity(t.gradient_accumulation_steps);

        loop {
            if pending.is_empty() && self.cancel.load(Ordering::SeqCst) {
                info!("Cancellation requested at step {}", s.training.global_step);
                self.write_checkpoint(s, None)?;
                return Ok(RunState::Cancelled);
            }

            let item = prefetch
                .next_item()
                .ok_or_else(|| HarnessError::Resource("batch prefetch worker stopped".into()))?;
            let epoch_end = match item {
                PrefetchItem::Batch { epoch, index, batch } => {
                    pending.push(self.micro_batch_loss(s, &batch, index)?);
                    s.training.epoch = epoch;
                    s.training.batches_in_epoch = index + 1;
                    false
                }
                PrefetchItem::EpochEnd { epoch } => {
                    s.training.epoch = epoch + 1;
                    s.training.batches_in_epoch = 0;
                    true
                }
            };

            let group_full = pending.len() >= t.gradient_accumulation_steps;
            if !(group_full || (epoch_end && !pending.is_empty())) {
                continue;
            }
            self.optimizer_step(s, std::mem::take(&mut pending))?;
            if let Some(terminal) = self.after_step(s)? {
                return Ok(terminal);
            }
        }
    }

    /// Forward one micro-batch; a non-finite loss is fatal
    fn micro_batch_loss(&self, s: &Session, batch: &Batch, index: usize) -> HarnessResult<(Tensor, f32)> {
        let tensors = batch.to_tensors(self.model.device())?;
        let dropout_seed = s
            .training
            .seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(s.training.global_step * 1_000_003 + index as u64);
        let mode = ForwardMode::train(self.objective.attention(), dropout_seed);
        let logits = self
            .model
            .forward(&tensors.input_ids, &tensors.attention_mask, mode)?;
        let loss = mean_token_nll(&logits, &tensors)?;
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(HarnessError::Numerical {
                step: s.training.global_step + 1,
                batch_index: index,
                value,
            });
        }
        Ok((loss, value))
    }

    fn optimizer_step(&mut self, s: &mut Session, losses: Vec<(Tensor, f32)>) -> HarnessResult<()> {
        let lr = s.scheduler.lr_at(s.training.global_step);
        s.optimizer.set_learning_rate(lr);
        let terms: Vec<Tensor> = losses.iter().map(|(loss, _)| loss.clone()).collect();
        let loss = Tensor::stack(&terms, 0)?.mean_all()?;
        s.optimizer.backward_step(&loss)?;

        let value = losses.iter().map(|(_, v)| *v as f64).sum::<f64>() / losses.len() as f64;
        s.training.global_step += 1;
        s.training.optimizer.steps += 1;
        s.training.scheduler = s.scheduler.state(lr);
        s.loss_window.0 += value;
        s.loss_window.1 += 1;

        let step = s.training.global_step;
        self.sink.on_event(ProgressEvent::Step {
            step,
            total: s.total_steps,
            loss: value,
            learning_rate: lr,
        });

        if step % self.config.training.logging_steps == 0 {
            let mean = s.loss_window.0 / s.loss_window.1.max(1) as f64;
            s.loss_window = (0.0, 0);
            let epoch = s.training.epoch;
            self.record(s, MetricRecord::new(step, epoch, Split::Train, TRAIN_LOSS, mean))?;
            self.record(s, MetricRecord::new(step, epoch, Split::Train, LEARNING_RATE, lr))?;
            info!(
                "  step={:>5}/{} | epoch={} | loss={:.4} | lr={:.3e}",
                step, s.total_steps, epoch, mean, lr
            );
        }
        Ok(())
    }

    /// Evaluation and terminal checks after an optimizer step
    fn after_step(&mut self, s: &mut Session) -> HarnessResult<Option<RunState>> {
        let step = s.training.global_step;
        let budget_exhausted = step >= s.total_steps;
        if step % self.config.training.eval_steps != 0 {
            return Ok(budget_exhausted.then_some(RunState::Completed));
        }

        self.transition(RunState::Evaluating);
        let verdict = self.evaluate_and_checkpoint(s)?;
        if verdict == Some(EvalVerdict::Exhausted) {
            info!(
                "Early stopping at step {step}: no improvement in {} evaluations (best {:?} at step {:?})",
                s.training.evals_since_improvement, s.training.best_metric, s.training.best_step
            );
            return Ok(Some(RunState::EarlyStopped));
        }
        if budget_exhausted {
            return Ok(Some(RunState::Completed));
        }
        self.transition(RunState::Running);
        Ok(None)
    }

    fn record(&self, s: &mut Session, record: MetricRecord) -> HarnessResult<()> {
        s.recorder.record(record.clone())?;
        self.sink.on_event(ProgressEvent::Metric { record });
        Ok(())
    }

    /// Mean eval loss and perplexity over the whole held-out split
    fn evaluate(&mut self, s: &mut Session) -> HarnessResult<(f64, f64)> {
        let mode = ForwardMode::eval(self.objective.attention());
        let mut nll = 0.0f64;
        let mut tokens = 0usize;
        let (step, epoch) = (s.training.global_step, s.training.epoch);
        for (batch_index, batch) in self.eval_batches.iter().enumerate() {
            let tensors = batch.to_tensors(self.model.device())?;
            let logits = self
                .model
                .forward(&tensors.input_ids, &tensors.attention_mask, mode)?
                .detach();
            let batch_nll = token_nll(&logits, &tensors)?.to_scalar::<f32>()?;
            // Nothing is recorded or checkpointed for a step whose eval loss is non-finite.
            if !batch_nll.is_finite() {
                return Err(HarnessError::Numerical {
                    step,
                    batch_index,
                    value: batch_nll,
                });
            }
            nll += batch_nll as f64;
            tokens += tensors.loss_tokens;
        }
        let eval_loss = nll / tokens.max(1) as f64;
        let perplexity = eval_loss.exp();

        self.record(s, MetricRecord::new(step, epoch, Split::Eval, EVAL_LOSS, eval_loss))?;
        self.record(s, MetricRecord::new(step, epoch, Split::Eval, PERPLEXITY, perplexity))?;
        s.recorder.flush()?;
        s.last_eval_step = Some(step);
        info!(
            "  eval step={step} | eval_loss={eval_loss:.4} | perplexity={perplexity:.3} | tokens={tokens}"
        );
        Ok((eval_loss, perplexity))
    }

    /// Evaluate, update best-metric tracking and write `checkpoint-<step>`
    fn evaluate_and_checkpoint(&mut self, s: &mut Session) -> HarnessResult<Option<EvalVerdict>> {
        let (eval_loss, perplexity) = self.evaluate(s)?;
        let metric = s
            .early_stopping
            .as_ref()
            .map(EarlyStopping::metric)
            .unwrap_or_default();
        let value = match metric {
            StopMetric::EvalLoss => eval_loss,
            StopMetric::Perplexity => perplexity,
        };

        let (improved, verdict) = match &s.early_stopping {
            Some(es) => {
                let verdict = es.observe(&mut s.training, value);
                (verdict == EvalVerdict::Improved, Some(verdict))
            }
            None => (track_best(&mut s.training, value), None),
        };

        let step = s.training.global_step;
        self.write_checkpoint(
            s,
            Some(CheckpointMetric {
                name: metric.metric_name().to_string(),
                value,
            }),
        )?;
        if improved {
            let best = s.checkpoints.mirror_best(step)?;
            self.sink.on_event(ProgressEvent::Checkpoint {
                step,
                path: best,
                best: true,
            });
        }
        Ok(verdict)
    }

    fn write_checkpoint(&mut self, s: &mut Session, metric: Option<CheckpointMetric>) -> HarnessResult<()> {
        let meta = s.checkpoints.save(&self.model, &s.training, s.scope, metric)?;
        s.last_checkpoint_step = Some(meta.step);
        self.sink.on_event(ProgressEvent::Checkpoint {
            step: meta.step,
            path: s.checkpoints.step_dir(meta.step),
            best: false,
        });
        Ok(())
    }

    fn finalize(&mut self, s: &mut Session, terminal: RunState) -> HarnessResult<RunSummary> {
        self.transition(terminal);
        self.transition(RunState::Finalizing);
        let step = s.training.global_step;

        if terminal != RunState::Cancelled && s.last_eval_step != Some(step) {
            self.evaluate_and_checkpoint(s)?;
        } else if s.last_checkpoint_step != Some(step) {
            self.write_checkpoint(s, None)?;
        }
        s.recorder.flush()?;
        let plot = self.write_plot(s);

        let summary = self.summary(s, terminal, plot, None)?;
        self.transition(terminal);
        info!(
            "Run finished: {:?} after {} steps | best {:?} at step {:?}",
            terminal, summary.total_steps, summary.best_metric, summary.best_step
        );
        Ok(summary)
    }

    /// Fatal error: flush what was recorded, keep earlier checkpoints, write the summary
    fn abort(&mut self, s: &mut Session, err: HarnessError) -> HarnessResult<RunSummary> {
        error!("Run aborted: {err}");
        self.transition(RunState::Aborted);
        if let Err(flush_err) = s.recorder.flush() {
            warn!("Could not flush metrics after abort: {flush_err}");
        }
        let plot = self.write_plot(s);
        self.summary(s, RunState::Aborted, plot, Some(RunFailure::from(&err)))
    }

    fn write_plot(&self, s: &Session) -> Option<PathBuf> {
        let path = plot::plot_path(&self.config.output.dir, &self.config.model.slug());
        let title = format!("{} ({}) loss", self.config.model.id, self.objective.name());
        match plot::write_plot(&path, s.recorder.snapshot(), &title) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Could not write loss plot: {e}");
                None
            }
        }
    }

    fn summary(
        &self,
        s: &Session,
        state: RunState,
        plot: Option<PathBuf>,
        error: Option<RunFailure>,
    ) -> HarnessResult<RunSummary> {
        let output_dir = &self.config.output.dir;
        let best_dir = s.checkpoints.best_dir();
        let mut transitions = self.transitions.clone();
        if transitions.last() != Some(&state) {
            transitions.push(state);
        }
        let summary = RunSummary {
            model: self.model.name().to_string(),
            objective: self.objective.name().to_string(),
            state,
            stop_reason: match &error {
                Some(failure) => failure.message.clone(),
                None => state.stop_reason().to_string(),
            },
            total_steps: s.training.global_step,
            epoch: s.training.epoch,
            final_metrics: s.recorder.latest_values(),
            best_metric: s.training.best_metric,
            best_step: s.training.best_step,
            best_checkpoint: best_dir.exists().then_some(best_dir),
            checkpoints: s.checkpoints.list()?.into_iter().map(|(_, p)| p).collect(),
            metrics_log: output_dir.join(METRICS_FILE),
            plot,
            transitions,
            error,
            started_at: s.started_at,
            finished_at: Utc::now(),
        };
        std::fs::write(output_dir.join(SUMMARY_FILE), serde_json::to_string_pretty(&summary)?)?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataRow, VOCAB_SIZE};
    use crate::freeze::{FreezePlan, ParameterGroup};
    use crate::model::TinyLm;
    use candle_core::{DType, Device, Var};
    use std::cell::Cell;
    use std::sync::Mutex;

    const BASE: &str = "data:\n  path: unused.csv\n  max_length: 64\nmodel:\n  architecture:\n    hidden_size: 16\n    num_layers: 2\n    mlp_size: 32\n    max_positions: 64\n";

    fn config(out: &Path, extra: &str) -> RunConfig {
        let yaml = format!("{BASE}output:\n  dir: {}\n{extra}", out.display());
        RunConfig::from_yaml_str(&yaml).unwrap()
    }

    fn rows(n: usize) -> Vec<DataRow> {
        (0..n)
            .map(|i| {
                DataRow::new([
                    ("question", format!("what is {i}+{i}?")),
                    ("answer", format!("{}", 2 * i)),
                ])
            })
            .collect()
    }

    fn prepared(config: RunConfig) -> PreparedRun {
        let splits = DatasetSplits {
            train: rows(12),
            eval: rows(4),
        };
        PreparedRun::from_splits(config, splits).unwrap()
    }

    fn tiny(config: &RunConfig) -> TinyLm {
        let arch = config.model.architecture.clone().unwrap();
        TinyLm::new(arch, config.training.seed, &Device::Cpu).unwrap()
    }

    fn eval_loss_at(output_dir: &Path, step: u64) -> Option<f64> {
        MetricsRecorder::read_log(&output_dir.join(METRICS_FILE))
            .unwrap()
            .into_iter()
            .find(|r| r.split == Split::Eval && r.name == EVAL_LOSS && r.step == step)
            .map(|r| r.value)
    }

    /// Delegates to TinyLm but can poison the Nth training forward, every eval
    /// forward from a given training step on, or return constant logits
    struct Scripted {
        inner: TinyLm,
        train_calls: Cell<u64>,
        poison_at: Option<u64>,
        eval_poison_from: Option<u64>,
        constant: bool,
    }

    impl Scripted {
        fn new(inner: TinyLm) -> Self {
            Self {
                inner,
                train_calls: Cell::new(0),
                poison_at: None,
                eval_poison_from: None,
                constant: false,
            }
        }
    }

    impl LanguageModel for Scripted {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn device(&self) -> &Device {
            self.inner.device()
        }
        fn max_positions(&self) -> usize {
            self.inner.max_positions()
        }
        fn parameter_groups(&self) -> Vec<ParameterGroup> {
            self.inner.parameter_groups()
        }
        fn inject_adapters(
            &mut self,
            groups: &[ParameterGroup],
            adapter: &crate::config::AdapterConfig,
            seed: u64,
        ) -> HarnessResult<()> {
            self.inner.inject_adapters(groups, adapter, seed)
        }
        fn apply_freeze(&mut self, plan: &FreezePlan) {
            self.inner.apply_freeze(plan)
        }
        fn trainable_vars(&self) -> Vec<Var> {
            self.inner.trainable_vars()
        }
        fn forward(
            &self,
            input_ids: &Tensor,
            attention_mask: &Tensor,
            mode: ForwardMode,
        ) -> candle_core::Result<Tensor> {
            if self.constant {
                let (b, t) = input_ids.dims2()?;
                return Tensor::zeros((b, t, VOCAB_SIZE), DType::F32, &Device::Cpu);
            }
            let logits = self.inner.forward(input_ids, attention_mask, mode)?;
            if mode.dropout_seed.is_some() {
                let n = self.train_calls.get() + 1;
                self.train_calls.set(n);
                if self.poison_at == Some(n) {
                    return logits.affine(f64::NAN, 0.0);
                }
            } else if self.eval_poison_from.is_some_and(|from| self.train_calls.get() >= from) {
                return logits.affine(f64::NAN, 0.0);
            }
            Ok(logits)
        }
        fn save_weights(&self, path: &Path, scope: WeightScope) -> HarnessResult<()> {
            self.inner.save_weights(path, scope)
        }
        fn load_weights(&mut self, path: &Path, scope: WeightScope) -> HarnessResult<()> {
            self.inner.load_weights(path, scope)
        }
    }

    /// Records every event and optionally requests cancellation after a given step
    struct Recording {
        events: Mutex<Vec<ProgressEvent>>,
        cancel_after: Option<(u64, Arc<AtomicBool>)>,
    }

    impl ProgressSink for Recording {
        fn on_event(&self, event: ProgressEvent) {
            if let (ProgressEvent::Step { step, .. }, Some((after, flag))) = (&event, &self.cancel_after) {
                if step == after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_masked_run_completes_with_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "training:\n  batch_size: 4\n  learning_rate: 0.01\n  max_steps: 6\n  eval_steps: 3\n  logging_steps: 1\n  warmup_steps: 2\n",
        );
        let model = tiny(&cfg);
        let summary = TrainingEngine::new(prepared(cfg), model).run().unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.total_steps, 6);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.checkpoints.len(), 2);
        assert!(summary.best_checkpoint.is_some());
        assert!(summary.plot.as_ref().unwrap().exists());
        assert!(summary.final_metrics.contains_key("eval/perplexity"));
        assert_eq!(
            &summary.transitions[..3],
            &[RunState::Initializing, RunState::Running, RunState::Evaluating]
        );
        assert_eq!(*summary.transitions.last().unwrap(), RunState::Completed);

        let records = MetricsRecorder::read_log(&dir.path().join(METRICS_FILE)).unwrap();
        let lrs: Vec<f64> = records
            .iter()
            .filter(|r| r.name == LEARNING_RATE)
            .map(|r| r.value)
            .collect();
        assert_eq!(lrs.len(), 6);
        assert!((lrs[0] - 0.005).abs() < 1e-12);
        assert!((lrs[1] - 0.01).abs() < 1e-12);
        assert!(lrs[5] < lrs[2]);

        let on_disk = RunSummary::load(dir.path()).unwrap();
        assert_eq!(on_disk.state, RunState::Completed);
    }

    #[test]
    fn test_non_finite_loss_aborts_and_keeps_earlier_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "training:\n  batch_size: 4\n  learning_rate: 0.01\n  max_steps: 10\n  eval_steps: 2\n  logging_steps: 1\n",
        );
        let mut model = Scripted::new(tiny(&cfg));
        model.poison_at = Some(5);
        let summary = TrainingEngine::new(prepared(cfg), model).run().unwrap();

        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(summary.exit_code(), 1);
        let failure = summary.error.unwrap();
        assert_eq!(failure.kind, "numerical_error");
        assert!(failure.message.contains("step 5"));
        assert_eq!(summary.total_steps, 4);
        assert!(!summary.transitions.contains(&RunState::Finalizing));

        let records = MetricsRecorder::read_log(&dir.path().join(METRICS_FILE)).unwrap();
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r.step < 5));
        let checkpoint = load_checkpoint(&dir.path().join("checkpoint-4")).unwrap();
        assert_eq!(checkpoint.state.global_step, 4);
        assert!(!dir.path().join("checkpoint-5").exists());
    }

    #[test]
    fn test_non_finite_eval_loss_aborts_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "training:\n  batch_size: 4\n  max_steps: 6\n  eval_steps: 2\n  logging_steps: 1\n",
        );
        let mut model = Scripted::new(tiny(&cfg));
        model.eval_poison_from = Some(4);
        let summary = TrainingEngine::new(prepared(cfg), model).run().unwrap();

        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(summary.error.as_ref().unwrap().kind, "numerical_error");
        assert_eq!(summary.total_steps, 4);
        assert_eq!(summary.best_step, Some(2));

        let records = MetricsRecorder::read_log(&dir.path().join(METRICS_FILE)).unwrap();
        assert!(records.iter().all(|r| r.value.is_finite()));
        assert!(records.iter().all(|r| r.split != Split::Eval || r.step < 4));
        assert!(eval_loss_at(dir.path(), 2).is_some());
        let on_disk = RunSummary::load(dir.path()).unwrap();
        assert_eq!(on_disk.state, RunState::Aborted);
        assert!(load_checkpoint(&dir.path().join("checkpoint-2")).is_ok());
        assert!(!dir.path().join("checkpoint-4").exists());
    }

    #[test]
    fn test_cancellation_finishes_step_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "training:\n  batch_size: 4\n  max_steps: 50\n  eval_steps: 10\n",
        );
        let flag = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(Recording {
            events: Mutex::new(Vec::new()),
            cancel_after: Some((3, flag.clone())),
        });
        let model = tiny(&cfg);
        let summary = TrainingEngine::new(prepared(cfg), model)
            .with_sink(sink.clone())
            .with_cancel_flag(flag)
            .run()
            .unwrap();

        assert_eq!(summary.state, RunState::Cancelled);
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.exit_code(), 0);
        assert!(load_checkpoint(&dir.path().join("checkpoint-3")).is_ok());
        let steps = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Step { .. }))
            .count();
        assert_eq!(steps, 3);
    }

    #[test]
    fn test_resume_for_zero_steps_reproduces_eval_loss() {
        let first = tempfile::tempdir().unwrap();
        let extra = "objective:\n  kind: causal\n  system_prompt: add\n  template: \"{system_prompt} Q:{question} A:{answer}\"\nadapter:\n  enabled: true\n  rank: 2\n  dropout: 0.1\ntraining:\n  batch_size: 4\n  learning_rate: 0.01\n  max_steps: 4\n  eval_steps: 2\n";
        let cfg = config(first.path(), extra);
        let model = tiny(&cfg);
        let original = TrainingEngine::new(prepared(cfg), model).run().unwrap();
        assert_eq!(original.state, RunState::Completed);
        let original_loss = eval_loss_at(first.path(), 4).unwrap();
        assert!(first.path().join("checkpoint-4/adapter_model.safetensors").exists());

        let second = tempfile::tempdir().unwrap();
        let resume = format!(
            "{extra}  resume_from: {}\n",
            first.path().join("checkpoint-4").display()
        );
        let cfg = config(second.path(), &resume);
        let model = tiny(&cfg);
        let resumed = TrainingEngine::new(prepared(cfg), model).run().unwrap();
        assert_eq!(resumed.state, RunState::Completed);
        assert_eq!(resumed.total_steps, 4);
        assert_eq!(eval_loss_at(second.path(), 4), Some(original_loss));
    }

    #[test]
    fn test_resume_into_same_dir_rewrites_metrics_log() {
        let dir = tempfile::tempdir().unwrap();
        let extra = "training:\n  batch_size: 4\n  learning_rate: 0.01\n  max_steps: 6\n  eval_steps: 2\n  logging_steps: 1\n";
        let cfg = config(dir.path(), extra);
        let model = tiny(&cfg);
        let first = TrainingEngine::new(prepared(cfg), model).run().unwrap();
        assert_eq!(first.state, RunState::Completed);

        let resume = format!(
            "{extra}  resume_from: {}\n",
            dir.path().join("checkpoint-2").display()
        );
        let cfg = config(dir.path(), &resume);
        let model = tiny(&cfg);
        let resumed = TrainingEngine::new(prepared(cfg), model).run().unwrap();
        assert_eq!(resumed.state, RunState::Completed);
        assert_eq!(resumed.total_steps, 6);

        let records = MetricsRecorder::read_log(&dir.path().join(METRICS_FILE)).unwrap();
        let train_steps: Vec<u64> = records
            .iter()
            .filter(|r| r.name == TRAIN_LOSS)
            .map(|r| r.step)
            .collect();
        assert_eq!(train_steps, vec![1, 2, 3, 4, 5, 6]);
        assert!(records.windows(2).all(|w| w[0].step <= w[1].step));
        let eval_steps: Vec<u64> = records
            .iter()
            .filter(|r| r.name == EVAL_LOSS)
            .map(|r| r.step)
            .collect();
        assert_eq!(eval_steps, vec![2, 4, 6]);
    }

    #[test]
    fn test_early_stopping_wins_tie_with_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "training:\n  batch_size: 4\n  max_steps: 3\n  eval_steps: 1\n  early_stopping:\n    patience: 1\n",
        );
        let mut model = Scripted::new(tiny(&cfg));
        model.constant = true;
        let summary = TrainingEngine::new(prepared(cfg), model).run().unwrap();

        assert_eq!(summary.state, RunState::EarlyStopped);
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.best_step, Some(1));
        let best = load_checkpoint(summary.best_checkpoint.as_ref().unwrap()).unwrap();
        assert_eq!(best.meta.step, 1);
        assert!((summary.best_metric.unwrap() - (VOCAB_SIZE as f64).ln()).abs() < 1e-4);
    }

    #[test]
    fn test_early_stopping_before_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "training:\n  batch_size: 4\n  max_steps: 40\n  eval_steps: 2\n  early_stopping:\n    patience: 2\n    metric: perplexity\n",
        );
        let mut model = Scripted::new(tiny(&cfg));
        model.constant = true;
        let summary = TrainingEngine::new(prepared(cfg), model).run().unwrap();
        assert_eq!(summary.state, RunState::EarlyStopped);
        assert_eq!(summary.total_steps, 8);
        assert_eq!(summary.best_step, Some(2));
    }

    #[test]
    fn test_degenerate_freeze_trains_head_only() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "freeze:\n  embeddings: true\n  encoder_layers: 99\ntraining:\n  batch_size: 4\n  max_steps: 2\n  eval_steps: 2\n",
        );
        let model = tiny(&cfg);
        let summary = TrainingEngine::new(prepared(cfg), model).run().unwrap();
        assert_eq!(summary.state, RunState::Completed);
    }

    #[test]
    fn test_nothing_trainable_rejected_at_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            "freeze:\n  embeddings: true\n  encoder_layers: 99\n  head: true\n",
        );
        let model = tiny(&cfg);
        let err = TrainingEngine::new(prepared(cfg), model).run().unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(!dir.path().join(METRICS_FILE).exists());
    }

    #[test]
    fn test_gradient_accumulation_counts_optimizer_steps() {
        let dir = tempfile::tempdir().unwrap();
        // 12 rows / batch 5 -> 3 micro-batches -> 2 optimizer steps per epoch
        let cfg = config(
            dir.path(),
            "training:\n  batch_size: 5\n  gradient_accumulation_steps: 2\n  num_epochs: 2\n  eval_steps: 100\n  evaluate_at_start: true\n",
        );
        let model = tiny(&cfg);
        let summary = TrainingEngine::new(prepared(cfg), model).run().unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.total_steps, 4);
        assert_eq!(summary.epoch, 2);
        assert!(eval_loss_at(dir.path(), 0).is_some());
        assert!(eval_loss_at(dir.path(), 4).is_some());
    }
}
