//! Run configuration: the immutable description of one fine-tuning run
//!
//! Loaded once from YAML or JSON (by file extension), rejected on unknown
//! keys, validated, and never mutated afterwards.

use crate::error::{HarnessError, HarnessResult};
use crate::model::TinyLmConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholders a causal template must contain
pub const REQUIRED_PLACEHOLDERS: [&str; 3] = ["{system_prompt}", "{question}", "{answer}"];

/// Chat-style template used when a causal run does not configure one
pub const DEFAULT_CAUSAL_TEMPLATE: &str =
    "<|system|>\n{system_prompt}\n</s>\n<|user|>\n{question}\n</s>\n<|assistant|>\n{answer}\n</s>";

/// Model id that selects the builtin transformer instead of a directory
pub const BUILTIN_MODEL_ID: &str = "builtin:tiny-lm";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub objective: ObjectiveConfig,
    #[serde(default)]
    pub freeze: FreezeSpec,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    pub output: OutputConfig,
}

/// Dataset location and text extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub path: PathBuf,
    /// Columns joined into one text per row (masked objective)
    #[serde(default = "default_text_fields")]
    pub text_fields: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Column substituted for `{question}` (causal objective)
    #[serde(default = "default_question_field")]
    pub question_field: String,
    /// Column substituted for `{answer}` (causal objective)
    #[serde(default = "default_answer_field")]
    pub answer_field: String,
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
    /// Maximum sequence length in tokens, specials included
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// `builtin:tiny-lm` or a directory with `config.json` + `model.safetensors`
    #[serde(default = "default_model_id")]
    pub id: String,
    /// Shape of the builtin model; ignored for pretrained directories
    #[serde(default)]
    pub architecture: Option<TinyLmConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            architecture: None,
        }
    }
}

impl ModelConfig {
    pub fn is_builtin(&self) -> bool {
        self.id == BUILTIN_MODEL_ID
    }

    /// File-system friendly form of the model id, used for plot names
    pub fn slug(&self) -> String {
        self.id.replace(['/', ':', '\\'], "_")
    }
}

/// Training objective, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ObjectiveConfig {
    Masked {
        #[serde(default = "default_mask_probability")]
        mask_probability: f64,
    },
    Causal {
        #[serde(default)]
        system_prompt: String,
        #[serde(default = "default_template")]
        template: String,
    },
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        ObjectiveConfig::Masked {
            mask_probability: default_mask_probability(),
        }
    }
}

impl ObjectiveConfig {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectiveConfig::Masked { .. } => "masked",
            ObjectiveConfig::Causal { .. } => "causal",
        }
    }
}

/// Declarative freezing rules for the base model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FreezeSpec {
    #[serde(default)]
    pub embeddings: bool,
    /// Freeze the first N encoder layers; larger than the layer count freezes all
    #[serde(default)]
    pub encoder_layers: usize,
    #[serde(default)]
    pub head: bool,
}

impl FreezeSpec {
    pub fn is_active(&self) -> bool {
        self.embeddings || self.encoder_layers > 0 || self.head
    }
}

/// Low-rank adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rank")]
    pub rank: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_adapter_dropout")]
    pub dropout: f64,
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rank: default_rank(),
            alpha: default_alpha(),
            dropout: default_adapter_dropout(),
            target_modules: default_target_modules(),
        }
    }
}

impl AdapterConfig {
    /// LoRA scaling factor (alpha / rank)
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// Learning-rate decay after warmup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleKind {
    #[default]
    Linear,
    Cosine,
    Constant,
}

/// Metric watched by early stopping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMetric {
    #[default]
    EvalLoss,
    Perplexity,
}

impl StopMetric {
    pub fn metric_name(&self) -> &'static str {
        match self {
            StopMetric::EvalLoss => "eval_loss",
            StopMetric::Perplexity => "perplexity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EarlyStoppingConfig {
    pub patience: u32,
    #[serde(default)]
    pub metric: StopMetric,
    #[serde(default)]
    pub greater_is_better: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub eval_batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub warmup_steps: u64,
    #[serde(default)]
    pub lr_schedule: LrScheduleKind,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: f64,
    /// Optimizer-step budget; overrides `num_epochs` when set
    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default = "default_eval_steps")]
    pub eval_steps: u64,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: u64,
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,
    /// Keep at most this many `checkpoint-<step>` directories
    #[serde(default)]
    pub save_total_limit: Option<usize>,
    #[serde(default)]
    pub evaluate_at_start: bool,
    #[serde(default = "default_flush_every")]
    pub metrics_flush_every: usize,
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingConfig>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            batch_size: default_batch_size(),
            eval_batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            warmup_steps: 0,
            lr_schedule: LrScheduleKind::default(),
            num_epochs: default_num_epochs(),
            max_steps: None,
            eval_steps: default_eval_steps(),
            logging_steps: default_logging_steps(),
            gradient_accumulation_steps: default_grad_accum(),
            save_total_limit: None,
            evaluate_at_start: false,
            metrics_flush_every: default_flush_every(),
            prefetch_depth: default_prefetch_depth(),
            resume_from: None,
            early_stopping: None,
        }
    }
}

impl TrainingConfig {
    /// Optimizer steps in one pass over `train_len` examples
    pub fn steps_per_epoch(&self, train_len: usize) -> u64 {
        let micro_batches = train_len.div_ceil(self.batch_size);
        micro_batches.div_ceil(self.gradient_accumulation_steps).max(1) as u64
    }

    /// Total optimizer-step budget for the run
    pub fn total_steps(&self, train_len: usize) -> u64 {
        match self.max_steps {
            Some(steps) => steps,
            None => {
                let per_epoch = self.steps_per_epoch(train_len) as f64;
                ((per_epoch * self.num_epochs).ceil() as u64).max(1)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

fn default_text_fields() -> Vec<String> {
    vec!["question".into(), "answer".into()]
}
fn default_separator() -> String {
    "\n\n".into()
}
fn default_question_field() -> String {
    "question".into()
}
fn default_answer_field() -> String {
    "answer".into()
}
fn default_validation_split() -> f64 {
    0.2
}
fn default_max_length() -> usize {
    256
}
fn default_model_id() -> String {
    BUILTIN_MODEL_ID.into()
}
fn default_mask_probability() -> f64 {
    0.15
}
fn default_template() -> String {
    DEFAULT_CAUSAL_TEMPLATE.into()
}
fn default_rank() -> usize {
    8
}
fn default_alpha() -> f64 {
    16.0
}
fn default_adapter_dropout() -> f64 {
    0.05
}
fn default_target_modules() -> Vec<String> {
    ["q_proj", "k_proj", "v_proj", "o_proj"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}
fn default_seed() -> u64 {
    42
}
fn default_batch_size() -> usize {
    8
}
fn default_learning_rate() -> f64 {
    5e-5
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_num_epochs() -> f64 {
    3.0
}
fn default_eval_steps() -> u64 {
    50
}
fn default_logging_steps() -> u64 {
    10
}
fn default_grad_accum() -> usize {
    1
}
fn default_flush_every() -> usize {
    10
}
fn default_prefetch_depth() -> usize {
    4
}

impl RunConfig {
    /// Load and validate a config file; `.json` is parsed as JSON, anything else as YAML
    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    pub fn from_yaml_str(text: &str) -> HarnessResult<Self> {
        let config: RunConfig = serde_yaml::from_str(text)
            .map_err(|e| HarnessError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> HarnessResult<Self> {
        let config: RunConfig = serde_json::from_str(text)
            .map_err(|e| HarnessError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field rule; nothing is partially applied on failure
    pub fn validate(&self) -> HarnessResult<()> {
        let t = &self.training;
        let d = &self.data;

        if t.batch_size == 0 || t.eval_batch_size == 0 {
            return config_err("batch sizes must be positive");
        }
        if t.gradient_accumulation_steps == 0 {
            return config_err("gradient_accumulation_steps must be positive");
        }
        if t.eval_steps == 0 || t.logging_steps == 0 {
            return config_err("eval_steps and logging_steps must be positive");
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return config_err("learning_rate must be a finite positive number");
        }
        if !(t.weight_decay.is_finite() && t.weight_decay >= 0.0) {
            return config_err("weight_decay cannot be negative");
        }
        if !(t.num_epochs.is_finite() && t.num_epochs > 0.0) {
            return config_err("num_epochs must be a finite positive number");
        }
        if t.max_steps == Some(0) {
            return config_err("max_steps must be at least 1 when set");
        }
        if t.metrics_flush_every == 0 || t.prefetch_depth == 0 {
            return config_err("metrics_flush_every and prefetch_depth must be positive");
        }
        if t.save_total_limit == Some(0) {
            return config_err("save_total_limit must be at least 1 when set");
        }
        if !(d.validation_split > 0.0 && d.validation_split < 1.0) {
            return config_err("validation_split must lie strictly between 0 and 1");
        }
        if d.max_length < 4 {
            return config_err("max_length must be at least 4 tokens");
        }

        let a = &self.adapter;
        if a.enabled {
            if a.rank == 0 {
                return config_err("adapter rank must be at least 1");
            }
            if !(a.alpha.is_finite() && a.alpha > 0.0) {
                return config_err("adapter alpha must be positive");
            }
            if !(0.0..1.0).contains(&a.dropout) {
                return config_err("adapter dropout must lie in [0, 1)");
            }
            if a.target_modules.is_empty() {
                return config_err("adapter target_modules cannot be empty");
            }
            if self.freeze.is_active() {
                return config_err(
                    "adapter mode and freeze rules are mutually exclusive; disable one of them",
                );
            }
        }

        match &self.objective {
            ObjectiveConfig::Masked { mask_probability } => {
                if !(*mask_probability > 0.0 && *mask_probability < 1.0) {
                    return config_err("mask_probability must lie strictly between 0 and 1");
                }
                if d.text_fields.is_empty() {
                    return config_err("text_fields cannot be empty for the masked objective");
                }
            }
            ObjectiveConfig::Causal { template, .. } => validate_template(template)?,
        }

        Ok(())
    }
}

/// Reject causal templates that miss a placeholder or repeat `{answer}`
pub fn validate_template(template: &str) -> HarnessResult<()> {
    let missing: Vec<&str> = REQUIRED_PLACEHOLDERS
        .iter()
        .copied()
        .filter(|p| !template.contains(p))
        .collect();
    if !missing.is_empty() {
        return Err(HarnessError::Format(format!(
            "template is missing required placeholder(s): {}",
            missing.join(", ")
        )));
    }
    if template.matches("{answer}").count() != 1 {
        return Err(HarnessError::Format(
            "template must contain {answer} exactly once".into(),
        ));
    }
    Ok(())
}

fn config_err<T>(msg: &str) -> HarnessResult<T> {
    Err(HarnessError::Config(msg.to_string()))
}
