//! Causal objective: next-token prediction on a templated prompt + answer
//!
//! The template is split at `{answer}`, so the answer's byte span in the
//! formatted text is known exactly. Inputs and targets are the sequence
//! shifted by one; only targets inside the answer span carry loss.

use super::EncodedExample;
use crate::config::validate_template;
use crate::data::{ByteTokenizer, DataRow, BOS_ID, EOS_ID};
use crate::error::{HarnessError, HarnessResult};
use std::ops::Range;

#[derive(Debug, Clone)]
pub struct CausalObjective {
    prefix: String,
    suffix: String,
    system_prompt: String,
    question_field: String,
    answer_field: String,
    max_length: usize,
    tokenizer: ByteTokenizer,
}

/// Formatted text with the answer's byte range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedExample {
    pub text: String,
    pub answer: Range<usize>,
}

impl CausalObjective {
    pub fn new(
        template: &str,
        system_prompt: String,
        question_field: String,
        answer_field: String,
        max_length: usize,
    ) -> HarnessResult<Self> {
        validate_template(template)?;
        let (prefix, suffix) = template
            .split_once("{answer}")
            .ok_or_else(|| HarnessError::Format("template is missing {answer}".into()))?;
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            system_prompt,
            question_field,
            answer_field,
            max_length,
            tokenizer: ByteTokenizer::new(),
        })
    }

    fn fill(&self, part: &str, question: &str) -> String {
        part.replace("{system_prompt}", &self.system_prompt)
            .replace("{question}", question)
    }

    /// Substitute a row into the template
    pub fn format(&self, row: &DataRow) -> HarnessResult<FormattedExample> {
        let question = row.require(&self.question_field)?;
        let answer = row.require(&self.answer_field)?;
        if answer.trim().is_empty() {
            return Err(HarnessError::Format("answer is empty".into()));
        }
        let prefix = self.fill(&self.prefix, question);
        let suffix = self.fill(&self.suffix, question);
        let start = prefix.len();
        let text = format!("{prefix}{answer}{suffix}");
        let span = start..start + answer.len();
        if text.get(span.clone()) != Some(answer) {
            return Err(HarnessError::Format(
                "formatted text does not contain the answer verbatim".into(),
            ));
        }
        Ok(FormattedExample { text, answer: span })
    }

    /// Shifted inputs/targets with loss on the answer span only
    pub fn encode(&self, row: &DataRow) -> HarnessResult<EncodedExample> {
        let formatted = self.format(row)?;
        let mut ids = Vec::with_capacity(formatted.text.len() + 2);
        ids.push(BOS_ID);
        ids.extend(self.tokenizer.encode(&formatted.text));
        ids.push(EOS_ID);

        // token positions are byte offsets shifted past BOS
        let answer = formatted.answer.start + 1..formatted.answer.end + 1;
        if answer.end > self.max_length {
            return Err(HarnessError::Format(format!(
                "answer ends at token {} but max_length is {}; the answer would be truncated",
                answer.end, self.max_length
            )));
        }
        ids.truncate(self.max_length);

        let input_ids = ids[..ids.len() - 1].to_vec();
        let targets = ids[1..].to_vec();
        let loss_mask = (1..ids.len())
            .map(|pos| if answer.contains(&pos) { 1.0 } else { 0.0 })
            .collect();
        Ok(EncodedExample {
            input_ids,
            targets,
            loss_mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CAUSAL_TEMPLATE;

    fn objective(template: &str, max_length: usize) -> HarnessResult<CausalObjective> {
        CausalObjective::new(
            template,
            "Be brief.".into(),
            "question".into(),
            "answer".into(),
            max_length,
        )
    }

    fn row(answer: &str) -> DataRow {
        DataRow::new([("question", "2+2?"), ("answer", answer)])
    }

    #[test]
    fn test_missing_placeholder_fails_before_encoding() {
        let err = objective("{system_prompt} {question}", 64).unwrap_err();
        assert!(matches!(err, HarnessError::Format(_)));
    }

    #[test]
    fn test_answer_span_located() {
        let obj = objective(DEFAULT_CAUSAL_TEMPLATE, 512).unwrap();
        let formatted = obj.format(&row("4")).unwrap();
        assert_eq!(&formatted.text[formatted.answer.clone()], "4");
        assert!(formatted.text.starts_with("<|system|>\nBe brief."));
    }

    #[test]
    fn test_loss_only_on_answer_tokens() {
        let obj = objective("{system_prompt}|{question}|{answer}.", 64).unwrap();
        let ex = obj.encode(&row("four")).unwrap();
        let tok = ByteTokenizer::new();
        let trained: Vec<u32> = ex
            .targets
            .iter()
            .zip(&ex.loss_mask)
            .filter(|(_, &m)| m > 0.0)
            .map(|(&t, _)| t)
            .collect();
        assert_eq!(tok.decode(&trained), "four");
        assert_eq!(ex.input_ids.len(), ex.targets.len());
        assert_eq!(ex.input_ids[0], BOS_ID);
        assert_eq!(*ex.targets.last().unwrap(), EOS_ID);
    }

    #[test]
    fn test_question_with_braces_does_not_move_answer() {
        let obj = objective("{system_prompt}{question}:{answer}", 64).unwrap();
        let r = DataRow::new([("question", "say {answer}"), ("answer", "ok")]);
        let formatted = obj.format(&r).unwrap();
        assert_eq!(&formatted.text[formatted.answer], "ok");
    }

    #[test]
    fn test_truncated_or_empty_answer_is_format_error() {
        let obj = objective("{system_prompt}|{question}|{answer}", 12).unwrap();
        assert!(matches!(obj.encode(&row("a long answer")), Err(HarnessError::Format(_))));
        let obj = objective("{system_prompt}|{question}|{answer}", 64).unwrap();
        assert!(matches!(obj.encode(&row("  ")), Err(HarnessError::Format(_))));
    }
}
