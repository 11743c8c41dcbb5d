//! Model capability: the trainable language model the engine drives
//!
//! The engine only sees `LanguageModel`: parameter-group introspection,
//! adapter injection, optimizer-visible variables, a logits-producing forward
//! pass and scoped weight persistence. `TinyLm` is the builtin implementation.

pub mod adapter;
pub mod tiny;

pub use adapter::{AdapterSet, LoraPair};
pub use tiny::{TinyLm, TinyLmConfig};

use crate::config::{AdapterConfig, ModelConfig};
use crate::error::{HarnessError, HarnessResult};
use crate::freeze::{FreezePlan, ParameterGroup};
use candle_core::{Device, Shape, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Attention pattern for a forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attention {
    /// Every token sees every non-padding token (masked objective)
    Bidirectional,
    /// Token `i` sees tokens `0..=i` (causal objective)
    Causal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardMode {
    pub attention: Attention,
    /// Seed for adapter dropout; `None` disables dropout (evaluation)
    pub dropout_seed: Option<u64>,
}

impl ForwardMode {
    pub fn train(attention: Attention, seed: u64) -> Self {
        Self {
            attention,
            dropout_seed: Some(seed),
        }
    }

    pub fn eval(attention: Attention) -> Self {
        Self {
            attention,
            dropout_seed: None,
        }
    }
}

/// Which weight domain a checkpoint holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightScope {
    /// All base-model weights
    Full,
    /// Only the injected adapter pairs
    AdapterOnly,
}

impl WeightScope {
    pub fn file_name(&self) -> &'static str {
        match self {
            WeightScope::Full => "model.safetensors",
            WeightScope::AdapterOnly => "adapter_model.safetensors",
        }
    }
}

/// A trainable language model
pub trait LanguageModel {
    fn name(&self) -> &str;

    fn device(&self) -> &Device;

    /// Longest sequence the position table supports
    fn max_positions(&self) -> usize;

    /// Base-model groups in model order (embeddings, layers by index, head)
    fn parameter_groups(&self) -> Vec<ParameterGroup>;

    /// Create adapter weights for groups derived by the freezing policy
    fn inject_adapters(
        &mut self,
        groups: &[ParameterGroup],
        adapter: &AdapterConfig,
        seed: u64,
    ) -> HarnessResult<()>;

    /// Record which groups are frozen; frozen weights receive no gradient
    fn apply_freeze(&mut self, plan: &FreezePlan);

    /// Variables the optimizer may update
    fn trainable_vars(&self) -> Vec<Var>;

    /// Logits `(batch, seq, vocab)` for `input_ids (batch, seq)` with a `{0,1}` f32 attention mask
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        mode: ForwardMode,
    ) -> candle_core::Result<Tensor>;

    fn save_weights(&self, path: &Path, scope: WeightScope) -> HarnessResult<()>;

    fn load_weights(&mut self, path: &Path, scope: WeightScope) -> HarnessResult<()>;
}

/// Build the configured model on the CPU
pub fn load_model(config: &ModelConfig, seed: u64) -> HarnessResult<TinyLm> {
    let device = Device::Cpu;
    if config.is_builtin() {
        let arch = config.architecture.clone().unwrap_or_default();
        TinyLm::new(arch, seed, &device)
    } else {
        TinyLm::from_pretrained(Path::new(&config.id), seed, &device)
    }
}

/// Uniform `[-bound, bound]` tensor from a seeded generator
pub(crate) fn uniform_tensor(
    rng: &mut StdRng,
    shape: &[usize],
    bound: f64,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let n: usize = shape.iter().product();
    let bound = bound as f32;
    let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-bound..=bound)).collect();
    Tensor::from_vec(data, shape, device)
}

/// Inverted-dropout mask: 0 with probability `p`, `1 / (1 - p)` otherwise
pub(crate) fn dropout_mask(
    shape: &[usize],
    p: f64,
    seed: u64,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let keep = (1.0 / (1.0 - p)) as f32;
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n)
        .map(|_| if rng.gen_bool(p) { 0.0 } else { keep })
        .collect();
    Tensor::from_vec(data, Shape::from(shape), device)
}

/// Wrap `tensor` in a `Var` and register it under `name`
pub(crate) fn insert_var(varmap: &VarMap, name: &str, tensor: Tensor) -> HarnessResult<Var> {
    let var = Var::from_tensor(&tensor)?;
    varmap
        .data()
        .lock()
        .map_err(|_| HarnessError::Resource("weight map lock poisoned".into()))?
        .insert(name.to_string(), var.clone());
    Ok(var)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropout_mask_is_seeded() {
        let a = dropout_mask(&[4, 8], 0.5, 3, &Device::Cpu).unwrap();
        let b = dropout_mask(&[4, 8], 0.5, 3, &Device::Cpu).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
        for v in a.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_load_builtin_model() {
        let model = load_model(&ModelConfig::default(), 1).unwrap();
        assert_eq!(model.name(), crate::config::BUILTIN_MODEL_ID);
        assert_eq!(model.parameter_groups().len(), 2 + model.config().num_layers);
    }
}
