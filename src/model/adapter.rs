//! LoRA adapters: low-rank weight deltas kept in their own weight domain
//!
//! Each targeted projection `W` gets a pair `A (r x in)`, `B (out x r)` and
//! contributes `scale * B A x`, with `scale = alpha / r`. `B` starts at zero,
//! so an injected model computes exactly what the base model did. The pairs
//! live in a separate `VarMap`; the base weights are never handed to the
//! optimizer in adapter mode.

use super::{dropout_mask, insert_var, uniform_tensor};
use crate::config::AdapterConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::freeze::{GroupKind, ParameterGroup};
use candle_core::{Device, Module, Tensor, Var};
use candle_nn::{Linear, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;

/// One low-rank pair attached to a projection
#[derive(Clone)]
pub struct LoraPair {
    pub module: String,
    pub rank: usize,
    lora_a: Var,
    lora_b: Var,
    scaling: f64,
    dropout: f64,
}

impl LoraPair {
    /// Scaling factor: alpha / rank
    pub fn scaling_factor(&self) -> f64 {
        self.scaling
    }

    /// Low-rank contribution for input `x`; dropout applies only when a seed is given
    pub fn forward(&self, x: &Tensor, dropout_seed: Option<u64>) -> candle_core::Result<Tensor> {
        let x = match dropout_seed {
            Some(seed) if self.dropout > 0.0 => {
                let mask = dropout_mask(x.dims(), self.dropout, seed, x.device())?;
                x.mul(&mask)?
            }
            _ => x.clone(),
        };
        let down = Linear::new(self.lora_a.as_tensor().clone(), None).forward(&x)?;
        let up = Linear::new(self.lora_b.as_tensor().clone(), None).forward(&down)?;
        up.affine(self.scaling, 0.0)
    }

    /// Dense weight delta `scale * B A`, shaped like the base projection
    pub fn weight_delta(&self) -> candle_core::Result<Tensor> {
        self.lora_b
            .as_tensor()
            .matmul(self.lora_a.as_tensor())?
            .affine(self.scaling, 0.0)
    }

    /// Frobenius norm of the effective contribution
    pub fn contribution_norm(&self) -> candle_core::Result<f32> {
        self.weight_delta()?.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()
    }
}

/// Every adapter pair of a model, keyed by (layer, module)
pub struct AdapterSet {
    varmap: VarMap,
    pairs: BTreeMap<(usize, String), LoraPair>,
    groups: Vec<ParameterGroup>,
}

impl AdapterSet {
    /// Create the weights for the adapter groups produced by the freezing policy
    pub fn materialize(
        groups: &[ParameterGroup],
        config: &AdapterConfig,
        seed: u64,
        device: &Device,
    ) -> HarnessResult<Self> {
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut pairs = BTreeMap::new();

        for group in groups {
            let GroupKind::Adapter(layer) = group.kind else {
                return Err(HarnessError::Config(format!(
                    "group '{}' is not an adapter group",
                    group.name
                )));
            };
            for chunk in group.parameters.chunks(2) {
                let [a_info, b_info] = chunk else {
                    return Err(HarnessError::Config(format!(
                        "adapter group '{}' has an unpaired parameter",
                        group.name
                    )));
                };
                let module = a_info
                    .name
                    .strip_suffix(".lora_a")
                    .and_then(|prefix| prefix.rsplit('.').next())
                    .ok_or_else(|| {
                        HarnessError::Config(format!("unexpected adapter weight '{}'", a_info.name))
                    })?
                    .to_string();
                let in_dim = a_info.shape[1];
                let bound = 1.0 / (in_dim as f64).sqrt();
                let a = insert_var(&varmap, &a_info.name, uniform_tensor(&mut rng, &a_info.shape, bound, device)?)?;
                let b = insert_var(&varmap, &b_info.name, Tensor::zeros(b_info.shape.as_slice(), candle_core::DType::F32, device)?)?;
                pairs.insert(
                    (layer, module.clone()),
                    LoraPair {
                        module,
                        rank: config.rank,
                        lora_a: a,
                        lora_b: b,
                        scaling: config.scaling(),
                        dropout: config.dropout,
                    },
                );
            }
        }

        Ok(Self {
            varmap,
            pairs,
            groups: groups.to_vec(),
        })
    }

    pub fn get(&self, layer: usize, module: &str) -> Option<&LoraPair> {
        self.pairs.get(&(layer, module.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    /// Adapter variables in group order, as registered with the optimizer
    pub fn vars(&self) -> Vec<Var> {
        self.pairs
            .values()
            .flat_map(|p| [p.lora_a.clone(), p.lora_b.clone()])
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.groups.iter().map(ParameterGroup::numel).sum()
    }

    pub fn save(&self, path: &Path) -> HarnessResult<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path) -> HarnessResult<()> {
        self.varmap.load(path).map_err(|e| {
            HarnessError::Checkpoint(format!("cannot load adapter weights {}: {e}", path.display()))
        })
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        let (rank, scaling) = self
            .pairs
            .values()
            .next()
            .map(|p| (p.rank, p.scaling))
            .unwrap_or((0, 0.0));
        format!(
            "LoRA | pairs={} | rank={} | scale={:.2} | params={}",
            self.len(),
            rank,
            scaling,
            self.parameter_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::ParameterInfo;

    fn adapter_group() -> ParameterGroup {
        ParameterGroup::new(
            "adapter.layer.0",
            GroupKind::Adapter(0),
            vec![
                ParameterInfo::new("adapter.layer.0.q_proj.lora_a", &[2, 6]),
                ParameterInfo::new("adapter.layer.0.q_proj.lora_b", &[4, 2]),
            ],
        )
    }

    fn config() -> AdapterConfig {
        AdapterConfig {
            enabled: true,
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
            target_modules: vec!["q_proj".into()],
        }
    }

    #[test]
    fn test_fresh_adapter_is_a_no_op() {
        let set = AdapterSet::materialize(&[adapter_group()], &config(), 7, &Device::Cpu).unwrap();
        assert_eq!(set.len(), 1);
        let pair = set.get(0, "q_proj").unwrap();
        assert_eq!(pair.scaling_factor(), 2.0);
        let x = Tensor::ones((1, 3, 6), candle_core::DType::F32, &Device::Cpu).unwrap();
        let delta = pair.forward(&x, None).unwrap();
        assert_eq!(delta.dims(), &[1, 3, 4]);
        assert_eq!(delta.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(pair.contribution_norm().unwrap(), 0.0);
        assert_eq!(set.parameter_count(), 20);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter.safetensors");
        let set = AdapterSet::materialize(&[adapter_group()], &config(), 7, &Device::Cpu).unwrap();
        set.save(&path).unwrap();

        let mut other = AdapterSet::materialize(&[adapter_group()], &config(), 99, &Device::Cpu).unwrap();
        other.load(&path).unwrap();
        let a = set.vars()[0].as_tensor().to_vec2::<f32>().unwrap();
        let b = other.vars()[0].as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
        println!("{}", set.summary());
    }
}
