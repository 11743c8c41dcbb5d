//! Objective selector: masked-token vs causal next-token training
//!
//! The engine's state machine is objective-agnostic. An `Objective` supplies
//! the two pieces that differ: turning rows into token batches (which
//! positions carry loss) and the attention pattern. Both objectives share
//! `token_nll`, a cross-entropy restricted to loss-carrying positions.

pub mod causal;
pub mod masked;

pub use causal::CausalObjective;
pub use masked::MaskedObjective;

use crate::config::{ObjectiveConfig, RunConfig};
use crate::data::{DataRow, PAD_ID};
use crate::error::{HarnessError, HarnessResult};
use crate::model::Attention;
use candle_core::{Device, Tensor, D};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// One tokenised example before batching
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedExample {
    pub input_ids: Vec<u32>,
    /// Token each position is trained to predict
    pub targets: Vec<u32>,
    /// 1.0 where the position carries loss; masked examples fill it at collate time
    pub loss_mask: Vec<f32>,
}

impl EncodedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// A padded, row-major batch
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub batch_size: usize,
    pub seq_len: usize,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<f32>,
    pub targets: Vec<u32>,
    pub loss_mask: Vec<f32>,
}

impl Batch {
    /// Pad examples to the longest one
    pub fn pad(examples: &[EncodedExample]) -> Self {
        let batch_size = examples.len();
        let seq_len = examples.iter().map(EncodedExample::len).max().unwrap_or(0);
        let mut batch = Batch {
            batch_size,
            seq_len,
            input_ids: Vec::with_capacity(batch_size * seq_len),
            attention_mask: Vec::with_capacity(batch_size * seq_len),
            targets: Vec::with_capacity(batch_size * seq_len),
            loss_mask: Vec::with_capacity(batch_size * seq_len),
        };
        for ex in examples {
            let pad = seq_len - ex.len();
            batch.input_ids.extend(ex.input_ids.iter().copied().chain(std::iter::repeat(PAD_ID).take(pad)));
            batch.attention_mask.extend(std::iter::repeat(1.0).take(ex.len()).chain(std::iter::repeat(0.0).take(pad)));
            batch.targets.extend(ex.targets.iter().copied().chain(std::iter::repeat(PAD_ID).take(pad)));
            batch.loss_mask.extend(ex.loss_mask.iter().copied().chain(std::iter::repeat(0.0).take(pad)));
        }
        batch
    }

    /// Number of positions that contribute to the loss
    pub fn loss_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|&&m| m > 0.0).count()
    }

    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<BatchTensors> {
        let shape = (self.batch_size, self.seq_len);
        Ok(BatchTensors {
            input_ids: Tensor::from_slice(&self.input_ids, shape, device)?,
            attention_mask: Tensor::from_slice(&self.attention_mask, shape, device)?,
            targets: Tensor::from_slice(&self.targets, shape, device)?,
            loss_mask: Tensor::from_slice(&self.loss_mask, shape, device)?,
            loss_tokens: self.loss_tokens(),
        })
    }
}

/// Device-resident form of a `Batch`
#[derive(Debug, Clone)]
pub struct BatchTensors {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub targets: Tensor,
    pub loss_mask: Tensor,
    pub loss_tokens: usize,
}

/// Summed negative log-likelihood over loss-carrying positions
pub fn token_nll(logits: &Tensor, batch: &BatchTensors) -> candle_core::Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((b * t, v))?, D::Minus1)?;
    let picked = log_probs
        .gather(&batch.targets.reshape((b * t, 1))?, 1)?
        .squeeze(1)?;
    picked.mul(&batch.loss_mask.reshape(b * t)?)?.sum_all()?.neg()
}

/// Mean NLL per loss token, the training loss
pub fn mean_token_nll(logits: &Tensor, batch: &BatchTensors) -> candle_core::Result<Tensor> {
    let count = batch.loss_tokens.max(1) as f64;
    token_nll(logits, batch)?.affine(1.0 / count, 0.0)
}

/// The configured training objective
#[derive(Debug, Clone)]
pub enum Objective {
    Masked(MaskedObjective),
    Causal(CausalObjective),
}

impl Objective {
    /// Select and validate the objective for a run
    pub fn from_config(config: &RunConfig) -> HarnessResult<Self> {
        let data = &config.data;
        match &config.objective {
            ObjectiveConfig::Masked { mask_probability } => Ok(Objective::Masked(MaskedObjective::new(
                data.text_fields.clone(),
                data.separator.clone(),
                *mask_probability,
                data.max_length,
            ))),
            ObjectiveConfig::Causal {
                system_prompt,
                template,
            } => Ok(Objective::Causal(CausalObjective::new(
                template,
                system_prompt.clone(),
                data.question_field.clone(),
                data.answer_field.clone(),
                data.max_length,
            )?)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Objective::Masked(_) => "masked",
            Objective::Causal(_) => "causal",
        }
    }

    pub fn attention(&self) -> Attention {
        match self {
            Objective::Masked(_) => Attention::Bidirectional,
            Objective::Causal(_) => Attention::Causal,
        }
    }

    pub fn encode(&self, row: &DataRow) -> HarnessResult<EncodedExample> {
        match self {
            Objective::Masked(m) => m.encode(row),
            Objective::Causal(c) => c.encode(row),
        }
    }

    /// Encode every row, naming the offending row on failure
    pub fn encode_all(&self, rows: &[DataRow], split: &str) -> HarnessResult<Vec<EncodedExample>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                self.encode(row).map_err(|e| match e {
                    HarnessError::Format(msg) => HarnessError::Format(format!("{split} row {i}: {msg}")),
                    HarnessError::Data(msg) => HarnessError::Data(format!("{split} row {i}: {msg}")),
                    other => other,
                })
            })
            .collect()
    }

    /// Pad a batch; the masked objective also draws its mask positions from `rng`
    pub fn collate(&self, examples: &[&EncodedExample], rng: &mut StdRng) -> Batch {
        match self {
            Objective::Masked(m) => {
                let masked: Vec<EncodedExample> = examples.iter().map(|ex| m.apply_mask(ex, rng)).collect();
                Batch::pad(&masked)
            }
            Objective::Causal(_) => {
                let owned: Vec<EncodedExample> = examples.iter().map(|&ex| ex.clone()).collect();
                Batch::pad(&owned)
            }
        }
    }

    /// Evaluation batches, masked once with a fixed seed so every evaluation sees the same targets
    pub fn eval_batches(&self, examples: &[EncodedExample], batch_size: usize, seed: u64) -> Vec<Batch> {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed_e7a1);
        examples
            .chunks(batch_size)
            .map(|chunk| {
                let refs: Vec<&EncodedExample> = chunk.iter().collect();
                self.collate(&refs, &mut rng)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ForwardMode, LanguageModel, TinyLm, TinyLmConfig};

    fn example(ids: &[u32], loss: &[f32]) -> EncodedExample {
        EncodedExample {
            input_ids: ids.to_vec(),
            targets: ids.to_vec(),
            loss_mask: loss.to_vec(),
        }
    }

    #[test]
    fn test_pad_batch() {
        let batch = Batch::pad(&[example(&[5, 6, 7], &[0., 1., 0.]), example(&[8], &[1.])]);
        assert_eq!(batch.seq_len, 3);
        assert_eq!(batch.input_ids, vec![5, 6, 7, 8, PAD_ID, PAD_ID]);
        assert_eq!(batch.attention_mask, vec![1., 1., 1., 1., 0., 0.]);
        assert_eq!(batch.loss_tokens(), 2);
    }

    #[test]
    fn test_token_nll_matches_uniform_logits() {
        let batch = Batch::pad(&[example(&[5, 6, 7], &[1., 1., 0.])]);
        let tensors = batch.to_tensors(&Device::Cpu).unwrap();
        let logits = Tensor::zeros((1, 3, 10), candle_core::DType::F32, &Device::Cpu).unwrap();
        let nll = token_nll(&logits, &tensors).unwrap().to_scalar::<f32>().unwrap();
        assert!((nll - 2.0 * (10f32).ln()).abs() < 1e-4);
        let mean = mean_token_nll(&logits, &tensors).unwrap().to_scalar::<f32>().unwrap();
        assert!((mean - (10f32).ln()).abs() < 1e-4);
    }

    #[test]
    fn test_loss_gradient_reaches_trainable_weights() {
        let model = TinyLm::new(
            TinyLmConfig {
                hidden_size: 8,
                num_layers: 1,
                mlp_size: 8,
                max_positions: 8,
                ..TinyLmConfig::default()
            },
            0,
            &Device::Cpu,
        )
        .unwrap();
        let batch = Batch::pad(&[example(&[1, 40, 41, 2], &[0., 1., 1., 0.])]);
        let tensors = batch.to_tensors(&Device::Cpu).unwrap();
        let logits = model
            .forward(&tensors.input_ids, &tensors.attention_mask, ForwardMode::eval(Attention::Bidirectional))
            .unwrap();
        let loss = mean_token_nll(&logits, &tensors).unwrap();
        let grads = loss.backward().unwrap();
        let vars = model.trainable_vars();
        assert!(vars.iter().any(|v| grads.get(v.as_tensor()).is_some()));
    }
}
