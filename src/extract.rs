//! Hidden-state extraction
//!
//! For every (variant, choice) of an example: tokenize, run one forward pass,
//! score the answer, reduce each requested layer to a single vector and
//! store it quantized at `[variant, choice]`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, D};
use ndarray::{s, Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ResolvedExtraction, TokenLoc};
use crate::error::ExtractError;
use crate::model::{ForwardInput, LoadedModel, ModelCapability};
use crate::prompts::{PromptChoice, PromptExample, PromptRequest, PromptSource};
use crate::quant::quantize_tensor;
use crate::schema::hidden_column;

/// One extracted example, laid out as the dataset stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenRecord {
    pub label: i64,
    pub variant_ids: Vec<String>,
    /// Exact question text fed to the model, `[variant][choice]`
    pub text_questions: Vec<Vec<String>>,
    /// `hidden_<layer>` -> quantized `[variant, choice, hidden_size]`
    #[serde(flatten)]
    pub hiddens: BTreeMap<String, Array3<i16>>,
    /// Answer log-probabilities `[variant, choice]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_logits: Option<Array2<f32>>,
}

impl HiddenRecord {
    pub fn hidden(&self, layer: usize) -> Option<&Array3<i16>> {
        self.hiddens.get(&hidden_column(layer))
    }
}

/// Records of one worker's shard
pub type HiddenStream = Box<dyn Iterator<Item = Result<HiddenRecord>> + Send>;

/// Collapse `[1, seq_len, hidden]` (or `[seq_len, hidden]`) to `[hidden]`
pub fn reduce_tokens(hidden: &Tensor, token_loc: TokenLoc) -> Result<Tensor> {
    let hidden = match hidden.rank() {
        3 => hidden.squeeze(0)?,
        2 => hidden.clone(),
        rank => anyhow::bail!("expected a [batch, seq, hidden] activation, got rank {rank}"),
    };
    let seq_len = hidden.dim(0)?;
    anyhow::ensure!(seq_len > 0, "cannot reduce an empty sequence");

    Ok(match token_loc {
        TokenLoc::First => hidden.get(0)?,
        TokenLoc::Last => hidden.get(seq_len - 1)?,
        TokenLoc::Mean => hidden.to_dtype(DType::F32)?.mean(0)?,
    })
}

/// Append the answer to the question, keeping at most `max_len` trailing
/// tokens so the answer survives truncation
pub fn concat_truncate(question: &[u32], answer: &[u32], max_len: Option<usize>) -> Vec<u32> {
    let mut ids = Vec::with_capacity(question.len() + answer.len());
    ids.extend_from_slice(question);
    ids.extend_from_slice(answer);
    match max_len {
        Some(max_len) if ids.len() > max_len => ids.split_off(ids.len() - max_len),
        _ => ids,
    }
}

/// Sum of log-softmax at the answer ids over the trailing positions
///
/// `logits` is `[1, seq_len, vocab]`. When truncation left fewer positions
/// than answer tokens, only the trailing answer tokens are scored.
pub fn answer_log_prob(logits: &Tensor, answer_ids: &[u32]) -> Result<f32> {
    let (_, seq_len, _) = logits.dims3()?;
    let n = answer_ids.len().min(seq_len);
    if n == 0 {
        return Ok(0.0);
    }

    let logits = logits
        .squeeze(0)?
        .narrow(0, seq_len - n, n)?
        .to_dtype(DType::F32)?;
    let log_p = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let targets = Tensor::new(&answer_ids[answer_ids.len() - n..], logits.device())?.unsqueeze(1)?;
    Ok(log_p.gather(&targets, 1)?.sum_all()?.to_scalar::<f32>()?)
}

/// Total log-probability recovered from a mean cross-entropy
///
/// Approximate: padding inside the target would be counted in `target_len`.
pub fn seq2seq_log_prob(loss: &Tensor, target_len: usize) -> Result<f32> {
    let loss = loss.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    Ok(-loss * target_len as f32)
}

/// Per-choice result before it is written into the record buffers
struct ChoiceOutput {
    /// Quantized vector per requested layer
    hiddens: Vec<Vec<i16>>,
    log_prob: Option<f32>,
}

/// Turns prompt examples into [`HiddenRecord`]s with one model
pub struct HiddenStateExtractor {
    model: LoadedModel,
    layers: Vec<usize>,
    token_loc: TokenLoc,
}

impl HiddenStateExtractor {
    pub fn new(model: LoadedModel, layers: Vec<usize>, token_loc: TokenLoc) -> Result<Self> {
        let num_layers = model.metadata().num_hidden_layers;
        if let Some(&layer) = layers.iter().find(|&&l| l > num_layers) {
            return Err(ExtractError::LayerOutOfRange { layer, num_layers }.into());
        }
        Ok(Self {
            model,
            layers,
            token_loc,
        })
    }

    /// Extractor for a resolved config; "all layers" is expanded here
    pub fn from_resolved(resolved: &ResolvedExtraction, model: LoadedModel) -> Result<Self> {
        let layers = resolved
            .layers
            .indices(model.metadata().num_hidden_layers);
        Self::new(model, layers, resolved.config.token_loc)
    }

    pub fn layers(&self) -> &[usize] {
        &self.layers
    }

    pub fn extract_example(&self, example: &PromptExample) -> Result<HiddenRecord> {
        let num_variants = example.num_variants();
        let num_choices = example.num_choices()?;
        let hidden_size = self.model.metadata().hidden_size;
        let emits_log_probs = self.model.has_lm_preds;

        let mut buffers: Vec<Array3<i16>> = self
            .layers
            .iter()
            .map(|_| Array3::zeros((num_variants, num_choices, hidden_size)))
            .collect();
        let mut log_probs = Array2::<f32>::zeros((num_variants, num_choices));
        let mut text_questions = Vec::with_capacity(num_variants);

        for (i, variant) in example.prompts.iter().enumerate() {
            let mut variant_questions = Vec::with_capacity(num_choices);
            for (j, choice) in variant.iter().enumerate() {
                variant_questions.push(choice.question.clone());

                let out = self
                    .run_choice(choice)
                    .with_context(|| format!("variant {i}, choice {j}"))?;
                for (buffer, hidden) in buffers.iter_mut().zip(&out.hiddens) {
                    anyhow::ensure!(
                        hidden.len() == hidden_size,
                        "activation has {} dims, model reports hidden size {hidden_size}",
                        hidden.len()
                    );
                    buffer
                        .slice_mut(s![i, j, ..])
                        .assign(&ArrayView1::from(hidden.as_slice()));
                }
                if let Some(log_prob) = out.log_prob {
                    log_probs[[i, j]] = log_prob;
                }
            }
            text_questions.push(variant_questions);
        }

        Ok(HiddenRecord {
            label: example.label as i64,
            variant_ids: example.template_names.clone(),
            text_questions,
            hiddens: self
                .layers
                .iter()
                .map(|&layer| hidden_column(layer))
                .zip(buffers)
                .collect(),
            model_logits: emits_log_probs.then_some(log_probs),
        })
    }

    fn run_choice(&self, choice: &PromptChoice) -> Result<ChoiceOutput> {
        let tokenizer = self.model.tokenizer();
        let device = self.model.device();

        // Question keeps its boundary markers and is left-truncated
        let question_ids = tokenizer.encode(&choice.question, true, true)?;
        let (input_ids, answer_ids, labels) = if self.model.is_encoder_decoder {
            // Only the question goes to the encoder; the answer is the target
            let answer_ids = tokenizer.encode(&choice.answer, true, true)?;
            let labels = Tensor::new(answer_ids.as_slice(), device)?.unsqueeze(0)?;
            (question_ids, answer_ids, Some(labels))
        } else {
            let answer_ids = tokenizer.encode(&choice.answer, false, false)?;
            let ids = concat_truncate(&question_ids, &answer_ids, tokenizer.model_max_length());
            (ids, answer_ids, None)
        };
        anyhow::ensure!(!input_ids.is_empty(), "question tokenized to nothing");

        let input = Tensor::new(input_ids.as_slice(), device)?.unsqueeze(0)?;
        let outputs = self.model.backend().forward(ForwardInput {
            input_ids: &input,
            labels: labels.as_ref(),
        })?;

        let log_prob = match self.model.capability {
            ModelCapability::HasLogits => {
                let logits = outputs
                    .logits
                    .as_ref()
                    .context("backend returned no logits")?;
                Some(answer_log_prob(logits, &answer_ids)?)
            }
            ModelCapability::HasSeq2SeqLoss => {
                let loss = outputs.loss.as_ref().context("backend returned no loss")?;
                Some(seq2seq_log_prob(loss, answer_ids.len())?)
            }
            ModelCapability::EncoderOnly | ModelCapability::PlainEncoderDecoder => None,
        };

        let states = outputs.selected_hidden_states();
        let hiddens = self
            .layers
            .iter()
            .map(|&layer| {
                let state = states.get(layer).with_context(|| {
                    format!("backend returned {} hidden states, no layer {layer}", states.len())
                })?;
                quantize_tensor(&reduce_tokens(state, self.token_loc)?)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ChoiceOutput { hiddens, log_prob })
    }
}

/// Lazily extract every example of a worker's shard
pub fn extract_hiddens(
    resolved: &ResolvedExtraction,
    model: &LoadedModel,
    source: &dyn PromptSource,
    request: &PromptRequest,
) -> Result<HiddenStream> {
    let extractor = HiddenStateExtractor::from_resolved(resolved, model.clone())?;
    let examples = source.load(request)?;
    let rank = request.shard.rank;

    Ok(Box::new(examples.enumerate().map(move |(n, example)| {
        let record = extractor.extract_example(&example?)?;
        if (n + 1) % 50 == 0 {
            debug!("Rank {rank}: extracted {} examples", n + 1);
        }
        Ok(record)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn activation() -> Tensor {
        // [1, 3, 2]
        Tensor::new(&[[[1.0f32, 2.0], [3.0, 4.0], [5.0, 9.0]]], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_reduce_tokens() {
        let h = activation();
        let first: Vec<f32> = reduce_tokens(&h, TokenLoc::First).unwrap().to_vec1().unwrap();
        let last: Vec<f32> = reduce_tokens(&h, TokenLoc::Last).unwrap().to_vec1().unwrap();
        let mean: Vec<f32> = reduce_tokens(&h, TokenLoc::Mean).unwrap().to_vec1().unwrap();
        assert_eq!(first, vec![1.0, 2.0]);
        assert_eq!(last, vec![5.0, 9.0]);
        assert_eq!(mean, vec![3.0, 5.0]);
    }

    #[test]
    fn test_reduce_rejects_empty() {
        let h = Tensor::zeros((1, 0, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(reduce_tokens(&h, TokenLoc::Last).is_err());
    }

    #[test]
    fn test_concat_truncate_keeps_answer() {
        let q: Vec<u32> = (0..10).collect();
        let a = vec![100, 101, 102];
        let ids = concat_truncate(&q, &a, Some(5));
        assert_eq!(ids, vec![8, 9, 100, 101, 102]);
        assert_eq!(concat_truncate(&q, &a, None).len(), 13);
        assert_eq!(concat_truncate(&q, &a, Some(20)).len(), 13);
    }

    #[test]
    fn test_answer_log_prob_matches_reference() {
        let rows = [[0.5f32, -1.0, 2.0, 0.0], [1.5, 0.2, -0.3, 0.9], [0.0, 0.0, 3.0, -2.0]];
        let logits = Tensor::new(&[rows], &Device::Cpu).unwrap();
        let answer = [3u32, 2];

        let reference: f32 = rows[1..]
            .iter()
            .zip(answer.iter())
            .map(|(row, &tok)| {
                let lse = row.iter().map(|x| x.exp()).sum::<f32>().ln();
                row[tok as usize] - lse
            })
            .sum();

        let got = answer_log_prob(&logits, &answer).unwrap();
        assert!((got - reference).abs() < 1e-5, "got {got}, want {reference}");
    }

    #[test]
    fn test_answer_log_prob_longer_than_sequence() {
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let got = answer_log_prob(&logits, &[0, 1, 2]).unwrap();
        assert!((got - 2.0 * (0.25f32).ln()).abs() < 1e-5);
        assert_eq!(answer_log_prob(&logits, &[]).unwrap(), 0.0);
    }

    #[test]
    fn test_seq2seq_log_prob() {
        let loss = Tensor::new(0.5f32, &Device::Cpu).unwrap();
        assert!((seq2seq_log_prob(&loss, 4).unwrap() + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_record_serializes_hidden_columns() {
        let record = HiddenRecord {
            label: 0,
            variant_ids: vec!["t0".into()],
            text_questions: vec![vec!["q".into()]],
            hiddens: [(hidden_column(3), Array3::zeros((1, 1, 2)))]
                .into_iter()
                .collect(),
            model_logits: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("hidden_3").is_some());
        assert!(value.get("model_logits").is_none());
        let back: HiddenRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
