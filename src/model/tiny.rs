//! TinyLm: a small pre-norm transformer language model
//!
//! Token + learned position embeddings, `num_layers` single-head layers
//! (`q_proj`, `k_proj`, `v_proj`, `o_proj`, `up_proj`, `down_proj`), a final
//! norm and an LM head. Initialisation is fully determined by the seed.

use super::{insert_var, uniform_tensor, AdapterSet, Attention, ForwardMode, LanguageModel, WeightScope};
use crate::config::{AdapterConfig, BUILTIN_MODEL_ID};
use crate::data::VOCAB_SIZE;
use crate::error::{HarnessError, HarnessResult};
use crate::freeze::{FreezePlan, GroupKind, ParameterGroup, ParameterInfo};
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Embedding, Linear, VarMap};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const LAYER_NORM_EPS: f64 = 1e-5;
const PROJECTIONS: [&str; 6] = ["q_proj", "k_proj", "v_proj", "o_proj", "up_proj", "down_proj"];

/// Architecture of a TinyLm; also the `config.json` of a pretrained directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TinyLmConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_mlp_size")]
    pub mlp_size: usize,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
}

fn default_vocab_size() -> usize {
    VOCAB_SIZE
}
fn default_hidden_size() -> usize {
    32
}
fn default_num_layers() -> usize {
    2
}
fn default_mlp_size() -> usize {
    64
}
fn default_max_positions() -> usize {
    512
}

impl Default for TinyLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            mlp_size: default_mlp_size(),
            max_positions: default_max_positions(),
        }
    }
}

impl TinyLmConfig {
    fn validate(&self) -> HarnessResult<()> {
        if self.vocab_size != VOCAB_SIZE {
            return Err(HarnessError::Config(format!(
                "model vocab_size {} does not match the byte tokenizer ({VOCAB_SIZE})",
                self.vocab_size
            )));
        }
        if self.hidden_size == 0 || self.mlp_size == 0 || self.max_positions == 0 {
            return Err(HarnessError::Config(
                "model hidden_size, mlp_size and max_positions must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Weight names and shapes, grouped the way the freezing policy sees them
    fn layout(&self) -> Vec<ParameterGroup> {
        let (v, h, m) = (self.vocab_size, self.hidden_size, self.mlp_size);
        let mut groups = vec![ParameterGroup::new(
            "embeddings",
            GroupKind::Embeddings,
            vec![
                ParameterInfo::new("embeddings.token.weight", &[v, h]),
                ParameterInfo::new("embeddings.position.weight", &[self.max_positions, h]),
            ],
        )];
        for i in 0..self.num_layers {
            let p = format!("encoder.layer.{i}");
            let mut params = Vec::new();
            for norm in ["attn_norm", "mlp_norm"] {
                params.push(ParameterInfo::new(format!("{p}.{norm}.weight"), &[h]));
                params.push(ParameterInfo::new(format!("{p}.{norm}.bias"), &[h]));
            }
            for proj in PROJECTIONS {
                let (out_dim, in_dim) = match proj {
                    "up_proj" => (m, h),
                    "down_proj" => (h, m),
                    _ => (h, h),
                };
                params.push(ParameterInfo::new(format!("{p}.{proj}.weight"), &[out_dim, in_dim]));
                params.push(ParameterInfo::new(format!("{p}.{proj}.bias"), &[out_dim]));
            }
            groups.push(ParameterGroup::new(p, GroupKind::Layer(i), params));
        }
        groups.push(ParameterGroup::new(
            "head",
            GroupKind::Head,
            vec![
                ParameterInfo::new("head.norm.weight", &[h]),
                ParameterInfo::new("head.norm.bias", &[h]),
                ParameterInfo::new("head.lm_head.weight", &[v, h]),
                ParameterInfo::new("head.lm_head.bias", &[v]),
            ],
        ));
        groups
    }
}

pub struct TinyLm {
    name: String,
    config: TinyLmConfig,
    device: Device,
    base: VarMap,
    weights: BTreeMap<String, Var>,
    groups: Vec<ParameterGroup>,
    frozen: BTreeSet<String>,
    adapters: Option<AdapterSet>,
}

impl TinyLm {
    /// Fresh model with seeded initialisation
    pub fn new(config: TinyLmConfig, seed: u64, device: &Device) -> HarnessResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let base = VarMap::new();
        let mut weights = BTreeMap::new();
        let groups = config.layout();

        for info in groups.iter().flat_map(|g| g.parameters.iter()) {
            let tensor = if info.name.contains("norm.weight") {
                Tensor::ones(info.shape.as_slice(), DType::F32, device)?
            } else if info.name.ends_with(".bias") {
                Tensor::zeros(info.shape.as_slice(), DType::F32, device)?
            } else if info.name.starts_with("embeddings.") {
                uniform_tensor(&mut rng, &info.shape, 0.1, device)?
            } else {
                let fan_in = info.shape[1] as f64;
                uniform_tensor(&mut rng, &info.shape, 1.0 / fan_in.sqrt(), device)?
            };
            let var = insert_var(&base, &info.name, tensor)?;
            weights.insert(info.name.clone(), var);
        }

        let model = Self {
            name: BUILTIN_MODEL_ID.to_string(),
            config,
            device: device.clone(),
            base,
            weights,
            groups,
            frozen: BTreeSet::new(),
            adapters: None,
        };
        debug!(
            "TinyLm | hidden={} | layers={} | params={}",
            model.config.hidden_size,
            model.config.num_layers,
            model.groups.iter().map(ParameterGroup::numel).sum::<usize>()
        );
        Ok(model)
    }

    /// Load a directory holding `config.json` and `model.safetensors`
    pub fn from_pretrained(dir: &Path, seed: u64, device: &Device) -> HarnessResult<Self> {
        let config_path = dir.join("config.json");
        let text = std::fs::read_to_string(&config_path).map_err(|e| {
            HarnessError::Config(format!("cannot read model config {}: {e}", config_path.display()))
        })?;
        let config: TinyLmConfig = serde_json::from_str(&text)
            .map_err(|e| HarnessError::Config(format!("invalid model config: {e}")))?;
        let mut model = Self::new(config, seed, device)?;
        model.load_weights(&dir.join(WeightScope::Full.file_name()), WeightScope::Full)?;
        model.name = dir.display().to_string();
        info!("Loaded pretrained model from {}", dir.display());
        Ok(model)
    }

    /// Write `config.json` + `model.safetensors` so `from_pretrained` can reload it
    pub fn save_pretrained(&self, dir: &Path) -> HarnessResult<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&self.config)?)?;
        self.save_weights(&dir.join(WeightScope::Full.file_name()), WeightScope::Full)
    }

    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }

    pub fn adapters(&self) -> Option<&AdapterSet> {
        self.adapters.as_ref()
    }

    fn group_of(name: &str) -> &str {
        if let Some(rest) = name.strip_prefix("encoder.layer.") {
            let end = rest.find('.').map_or(name.len(), |i| "encoder.layer.".len() + i);
            &name[..end]
        } else if name.starts_with("embeddings.") {
            "embeddings"
        } else {
            "head"
        }
    }

    /// Weight tensor; frozen groups are detached from the autograd graph
    fn weight(&self, name: &str) -> candle_core::Result<Tensor> {
        let var = self
            .weights
            .get(name)
            .ok_or_else(|| candle_core::Error::Msg(format!("unknown weight {name}")))?;
        if self.adapters.is_some() || self.frozen.contains(Self::group_of(name)) {
            Ok(var.as_tensor().detach())
        } else {
            Ok(var.as_tensor().clone())
        }
    }

    fn linear(&self, prefix: &str) -> candle_core::Result<Linear> {
        Ok(Linear::new(
            self.weight(&format!("{prefix}.weight"))?,
            Some(self.weight(&format!("{prefix}.bias"))?),
        ))
    }

    fn layer_norm(&self, x: &Tensor, prefix: &str) -> candle_core::Result<Tensor> {
        let weight = self.weight(&format!("{prefix}.weight"))?;
        let bias = self.weight(&format!("{prefix}.bias"))?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&var.affine(1.0, LAYER_NORM_EPS)?.sqrt()?)?;
        normed.broadcast_mul(&weight)?.broadcast_add(&bias)
    }

    /// Base projection plus its adapter delta, when one is attached
    fn project(
        &self,
        x: &Tensor,
        layer: usize,
        module: &str,
        mode: ForwardMode,
    ) -> candle_core::Result<Tensor> {
        let out = self
            .linear(&format!("encoder.layer.{layer}.{module}"))?
            .forward(x)?;
        match self.adapters.as_ref().and_then(|a| a.get(layer, module)) {
            Some(pair) => {
                let site = layer * PROJECTIONS.len()
                    + PROJECTIONS.iter().position(|p| *p == module).unwrap_or(0);
                let seed = mode
                    .dropout_seed
                    .map(|s| s.wrapping_mul(1_000_003).wrapping_add(site as u64));
                out.add(&pair.forward(x, seed)?)
            }
            None => Ok(out),
        }
    }

    /// Additive attention bias: `(b, 1, t)` for padding, `(b, t, t)` once causal
    fn attention_bias(
        &self,
        attention_mask: &Tensor,
        seq_len: usize,
        attention: Attention,
    ) -> candle_core::Result<Tensor> {
        let padding = attention_mask.affine(1e9, -1e9)?.unsqueeze(1)?;
        match attention {
            Attention::Bidirectional => Ok(padding),
            Attention::Causal => {
                let future: Vec<f32> = (0..seq_len)
                    .flat_map(|i| (0..seq_len).map(move |j| if j > i { -1e9 } else { 0.0 }))
                    .collect();
                let future = Tensor::from_vec(future, (seq_len, seq_len), &self.device)?;
                padding.broadcast_add(&future)
            }
        }
    }
}

impl LanguageModel for TinyLm {
    fn name(&self) -> &str {
        &self.name
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn max_positions(&self) -> usize {
        self.config.max_positions
    }

    fn parameter_groups(&self) -> Vec<ParameterGroup> {
        self.groups.clone()
    }

    fn inject_adapters(
        &mut self,
        groups: &[ParameterGroup],
        adapter: &AdapterConfig,
        seed: u64,
    ) -> HarnessResult<()> {
        for group in groups {
            for info in &group.parameters {
                let Some(base_name) = info
                    .name
                    .strip_prefix("adapter.")
                    .and_then(|rest| rest.rsplit_once('.'))
                    .map(|(module, _)| format!("encoder.{module}.weight"))
                else {
                    continue;
                };
                if !self.weights.contains_key(&base_name) {
                    return Err(HarnessError::Config(format!(
                        "adapter weight {} targets unknown projection {base_name}",
                        info.name
                    )));
                }
            }
        }
        let set = AdapterSet::materialize(groups, adapter, seed, &self.device)?;
        info!("Injected adapters: {}", set.summary());
        self.adapters = Some(set);
        Ok(())
    }

    fn apply_freeze(&mut self, plan: &FreezePlan) {
        self.frozen = plan
            .frozen()
            .filter(|d| !matches!(d.kind, GroupKind::Adapter(_)))
            .map(|d| d.name.clone())
            .collect();
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = if self.adapters.is_some() {
            Vec::new()
        } else {
            self.groups
                .iter()
                .filter(|g| !self.frozen.contains(&g.name))
                .flat_map(|g| g.parameters.iter())
                .filter_map(|p| self.weights.get(&p.name).cloned())
                .collect()
        };
        if let Some(adapters) = &self.adapters {
            vars.extend(adapters.vars());
        }
        vars
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        mode: ForwardMode,
    ) -> candle_core::Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_positions {
            candle_core::bail!(
                "sequence length {seq_len} exceeds max_positions {}",
                self.config.max_positions
            );
        }
        let hidden = self.config.hidden_size;

        let tokens = Embedding::new(self.weight("embeddings.token.weight")?, hidden).forward(input_ids)?;
        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let positions = self
            .weight("embeddings.position.weight")?
            .index_select(&positions, 0)?;
        let mut x = tokens.broadcast_add(&positions)?;

        let bias = self.attention_bias(attention_mask, seq_len, mode.attention)?;
        let scale = 1.0 / (hidden as f64).sqrt();
        for layer in 0..self.config.num_layers {
            let prefix = format!("encoder.layer.{layer}");
            let normed = self.layer_norm(&x, &format!("{prefix}.attn_norm"))?;
            let q = self.project(&normed, layer, "q_proj", mode)?;
            let k = self.project(&normed, layer, "k_proj", mode)?;
            let v = self.project(&normed, layer, "v_proj", mode)?;
            let scores = q
                .matmul(&k.t()?.contiguous()?)?
                .affine(scale, 0.0)?
                .broadcast_add(&bias)?;
            let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
            let attended = probs.matmul(&v)?;
            x = x.add(&self.project(&attended, layer, "o_proj", mode)?)?;

            let normed = self.layer_norm(&x, &format!("{prefix}.mlp_norm"))?;
            let up = self.project(&normed, layer, "up_proj", mode)?.gelu()?;
            x = x.add(&self.project(&up, layer, "down_proj", mode)?)?;
        }

        let x = self.layer_norm(&x, "head.norm")?;
        let logits = self.linear("head.lm_head")?.forward(&x)?;
        debug_assert_eq!(logits.dims(), &[batch, seq_len, self.config.vocab_size]);
        Ok(logits)
    }

    fn save_weights(&self, path: &Path, scope: WeightScope) -> HarnessResult<()> {
        match scope {
            WeightScope::Full => self.base.save(path)?,
            WeightScope::AdapterOnly => self
                .adapters
                .as_ref()
                .ok_or_else(|| HarnessError::Checkpoint("model has no adapters to save".into()))?
                .save(path)?,
        }
        Ok(())
    }

    fn load_weights(&mut self, path: &Path, scope: WeightScope) -> HarnessResult<()> {
        match scope {
            WeightScope::Full => self.base.load(path).map_err(|e| {
                HarnessError::Checkpoint(format!("cannot load weights {}: {e}", path.display()))
            }),
            WeightScope::AdapterOnly => self
                .adapters
                .as_mut()
                .ok_or_else(|| HarnessError::Checkpoint("model has no adapters to load into".into()))?
                .load(path),
        }
    }
}
