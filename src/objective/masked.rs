//! Masked-token objective
//!
//! Text columns are joined into one sequence. At collate time each content
//! token is replaced by `MASK` with `mask_probability`; loss is taken only at
//! replaced positions against the original token. Every example keeps at
//! least one masked position so no example contributes a 0/0 loss.

use super::EncodedExample;
use crate::data::{ByteTokenizer, DataRow, BOS_ID, EOS_ID, MASK_ID};
use crate::error::{HarnessError, HarnessResult};
use rand::rngs::StdRng;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct MaskedObjective {
    text_fields: Vec<String>,
    separator: String,
    mask_probability: f64,
    max_length: usize,
    tokenizer: ByteTokenizer,
}

impl MaskedObjective {
    pub fn new(text_fields: Vec<String>, separator: String, mask_probability: f64, max_length: usize) -> Self {
        Self {
            text_fields,
            separator,
            mask_probability,
            max_length,
            tokenizer: ByteTokenizer::new(),
        }
    }

    pub fn mask_probability(&self) -> f64 {
        self.mask_probability
    }

    /// Joined text of the configured columns
    pub fn text(&self, row: &DataRow) -> HarnessResult<String> {
        let parts = self
            .text_fields
            .iter()
            .map(|field| row.require(field))
            .collect::<HarnessResult<Vec<&str>>>()?;
        Ok(parts.join(&self.separator))
    }

    /// `BOS + text + EOS`, truncated to `max_length`; loss positions are chosen later
    pub fn encode(&self, row: &DataRow) -> HarnessResult<EncodedExample> {
        let text = self.text(row)?;
        if text.trim().is_empty() {
            return Err(HarnessError::Data("text is empty".into()));
        }
        let mut ids = Vec::with_capacity(text.len() + 2);
        ids.push(BOS_ID);
        ids.extend(self.tokenizer.encode(&text));
        ids.push(EOS_ID);
        ids.truncate(self.max_length);
        Ok(EncodedExample {
            targets: ids.clone(),
            loss_mask: vec![0.0; ids.len()],
            input_ids: ids,
        })
    }

    /// Replace a random subset of content tokens by `MASK` (never none)
    pub fn apply_mask(&self, example: &EncodedExample, rng: &mut StdRng) -> EncodedExample {
        let maskable: Vec<usize> = example
            .targets
            .iter()
            .enumerate()
            .filter(|(_, &id)| !ByteTokenizer::is_special(id))
            .map(|(i, _)| i)
            .collect();

        let mut input_ids = example.targets.clone();
        let mut loss_mask = vec![0.0; input_ids.len()];
        let mut chosen: Vec<usize> = maskable
            .iter()
            .copied()
            .filter(|_| rng.gen_bool(self.mask_probability))
            .collect();
        if chosen.is_empty() && !maskable.is_empty() {
            chosen.push(maskable[rng.gen_range(0..maskable.len())]);
        }
        for pos in chosen {
            input_ids[pos] = MASK_ID;
            loss_mask[pos] = 1.0;
        }

        EncodedExample {
            input_ids,
            targets: example.targets.clone(),
            loss_mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn objective(p: f64) -> MaskedObjective {
        MaskedObjective::new(vec!["question".into(), "answer".into()], "\n\n".into(), p, 64)
    }

    fn row() -> DataRow {
        DataRow::new([("question", "What is Rust?"), ("answer", "A language.")])
    }

    #[test]
    fn test_text_joins_fields() {
        assert_eq!(objective(0.15).text(&row()).unwrap(), "What is Rust?\n\nA language.");
        let missing = DataRow::new([("question", "q")]);
        assert!(matches!(objective(0.15).encode(&missing), Err(HarnessError::Data(_))));
    }

    #[test]
    fn test_masking_only_touches_content_tokens() {
        let obj = objective(0.5);
        let ex = obj.encode(&row()).unwrap();
        assert_eq!(ex.input_ids[0], BOS_ID);
        assert_eq!(*ex.input_ids.last().unwrap(), EOS_ID);

        let mut rng = StdRng::seed_from_u64(3);
        let masked = obj.apply_mask(&ex, &mut rng);
        assert_eq!(masked.targets, ex.targets);
        for (i, &m) in masked.loss_mask.iter().enumerate() {
            if m > 0.0 {
                assert_eq!(masked.input_ids[i], MASK_ID);
                assert!(!ByteTokenizer::is_special(masked.targets[i]));
            } else {
                assert_eq!(masked.input_ids[i], ex.input_ids[i]);
            }
        }
    }

    #[test]
    fn test_at_least_one_position_masked() {
        let obj = objective(0.001);
        let ex = obj.encode(&DataRow::new([("question", "a"), ("answer", "b")])).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            let masked = obj.apply_mask(&ex, &mut rng);
            assert!(masked.loss_mask.iter().any(|&m| m > 0.0));
        }
    }

    #[test]
    fn test_truncation() {
        let obj = MaskedObjective::new(vec!["question".into()], " ".into(), 0.15, 5);
        let ex = obj.encode(&DataRow::new([("question", "abcdefgh")])).unwrap();
        assert_eq!(ex.len(), 5);
    }
}
