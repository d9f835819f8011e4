//! Autoregressive sampling driver.
//!
//! Supplies the outer generate loop around the incremental-decoding adapter:
//! greedy or seeded stochastic token selection, stopping criteria, and
//! throughput accounting. Only single-beam decoding is supported.

use crate::adapter::IncrementalDecoder;
use crate::backend::InferenceBackend;
use crate::config::GenerationConfig;
use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GenerateParams {
    /// Upper bound on the total sequence length, prompt included.
    pub max_length: usize,
    pub do_sample: bool,
    pub seed: u64,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_length: 20,
            do_sample: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndOfSequence,
    MaxLength,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub total_time_ms: f64,
    /// Sequence tokens per wall-clock second over the whole call.
    pub tokens_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutput {
    /// Prompt plus generated token ids.
    pub sequences: Vec<u32>,
    pub finish_reason: FinishReason,
    pub stats: GenerationStats,
}

pub struct TextGenerator {
    adapter: IncrementalDecoder,
    config: GenerationConfig,
}

impl TextGenerator {
    pub fn new(backend: Box<dyn InferenceBackend>, config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        ensure!(
            config.num_beams == 1 && config.num_beam_groups == 1,
            "beam search is not supported"
        );
        ensure!(
            config.num_return_sequences == 1,
            "only one return sequence is supported"
        );
        Ok(Self {
            adapter: IncrementalDecoder::new(backend),
            config,
        })
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate a continuation of `input_ids`, stopping at the eos token or
    /// at `params.max_length` total tokens. Deterministic for a fixed seed.
    pub fn generate(
        &mut self,
        input_ids: &[u32],
        params: &GenerateParams,
    ) -> Result<GenerationOutput> {
        ensure!(!input_ids.is_empty(), "prompt must not be empty");
        let start = Instant::now();
        let mut rng = fastrand::Rng::with_seed(params.seed);

        let mut sequences = input_ids.to_vec();
        let prompt_tokens = sequences.len();

        if sequences.len() >= params.max_length {
            let stats = finish_stats(prompt_tokens, 0, start);
            return Ok(GenerationOutput {
                sequences,
                finish_reason: FinishReason::MaxLength,
                stats,
            });
        }

        let prompt = Array2::from_shape_vec((1, sequences.len()), sequences.clone())?;
        let mut out = self.adapter.step(prompt.view(), None)?;

        let finish_reason = loop {
            let logits = out.logits.row(0).to_owned();
            let token = self.select_next(logits, &sequences, prompt_tokens, params, &mut rng);
            sequences.push(token);

            if token == self.config.eos_token_id {
                break FinishReason::EndOfSequence;
            }
            if sequences.len() >= params.max_length {
                break FinishReason::MaxLength;
            }

            let step = Array2::from_elem((1, 1), token);
            out = self.adapter.step(step.view(), Some(out.cache))?;
        };

        let stats = finish_stats(prompt_tokens, sequences.len() - prompt_tokens, start);
        debug!(
            generated = stats.generated_tokens,
            tokens_per_sec = stats.tokens_per_sec,
            "generation finished"
        );
        Ok(GenerationOutput {
            sequences,
            finish_reason,
            stats,
        })
    }

    fn select_next(
        &self,
        mut logits: Array1<f32>,
        sequences: &[u32],
        prompt_len: usize,
        params: &GenerateParams,
        rng: &mut fastrand::Rng,
    ) -> u32 {
        let config = &self.config;

        // Forced tokens short-circuit selection entirely.
        if let Some(forced_bos) = config.forced_bos_token_id {
            if sequences.len() == prompt_len {
                return forced_bos;
            }
        }
        if let Some(forced_eos) = config.forced_eos_token_id {
            if sequences.len() + 1 >= params.max_length {
                return forced_eos;
            }
        }

        // Repetition penalty over every token already in the sequence.
        if config.repetition_penalty != 1.0 && config.repetition_penalty > 0.0 {
            for &prev in sequences {
                let logit = &mut logits[prev as usize];
                if *logit > 0.0 {
                    *logit /= config.repetition_penalty;
                } else {
                    *logit *= config.repetition_penalty;
                }
            }
        }

        // Suppress eos until the sequence reaches min_length.
        if sequences.len() < config.min_length {
            logits[config.eos_token_id as usize] = f32::NEG_INFINITY;
        }

        // Ban completions of configured bad-word sequences.
        for bad in &config.bad_words_ids {
            if let Some((&last, prefix)) = bad.split_last() {
                if sequences.ends_with(prefix) {
                    logits[last as usize] = f32::NEG_INFINITY;
                }
            }
        }

        // Ban tokens that would repeat an n-gram.
        if config.no_repeat_ngram_size > 0 {
            for token in banned_ngram_tokens(sequences, config.no_repeat_ngram_size) {
                logits[token as usize] = f32::NEG_INFINITY;
            }
        }

        if !params.do_sample {
            return argmax(&logits);
        }

        // Temperature, then top-k / top-p filtering, then sample.
        if config.temperature != 1.0 {
            logits.mapv_inplace(|x| x / config.temperature);
        }

        let mut candidates: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, &l)| l > f32::NEG_INFINITY)
            .map(|(i, &l)| (i as u32, l))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if config.top_k > 0 {
            candidates.truncate(config.top_k);
        }

        // Softmax over the surviving candidates.
        let max_logit = candidates.first().map(|c| c.1).unwrap_or(0.0);
        let mut total = 0.0f32;
        let mut probs: Vec<(u32, f32)> = candidates
            .into_iter()
            .map(|(t, l)| {
                let p = (l - max_logit).exp();
                total += p;
                (t, p)
            })
            .collect();
        for entry in probs.iter_mut() {
            entry.1 /= total.max(f32::EPSILON);
        }

        // Nucleus filtering: keep the smallest prefix covering top_p mass.
        if config.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = 0;
            for (i, &(_, p)) in probs.iter().enumerate() {
                cumulative += p;
                keep = i + 1;
                if cumulative >= config.top_p {
                    break;
                }
            }
            probs.truncate(keep.max(1));
            let renorm: f32 = probs.iter().map(|&(_, p)| p).sum();
            for entry in probs.iter_mut() {
                entry.1 /= renorm.max(f32::EPSILON);
            }
        }

        let draw = rng.f32();
        let mut cumulative = 0.0;
        for &(token, p) in &probs {
            cumulative += p;
            if draw < cumulative {
                return token;
            }
        }
        probs.last().map(|&(t, _)| t).unwrap_or(0)
    }
}

fn finish_stats(prompt_tokens: usize, generated_tokens: usize, start: Instant) -> GenerationStats {
    let total_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    let total = prompt_tokens + generated_tokens;
    let tokens_per_sec = if total_time_ms > 0.0 {
        total as f64 / (total_time_ms / 1000.0)
    } else {
        f64::INFINITY
    };
    GenerationStats {
        prompt_tokens,
        generated_tokens,
        total_time_ms,
        tokens_per_sec,
    }
}

fn argmax(logits: &Array1<f32>) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx as u32)
        .unwrap_or(0)
}

/// Tokens that would complete an already-seen n-gram of the given size.
fn banned_ngram_tokens(sequence: &[u32], ngram_size: usize) -> Vec<u32> {
    if ngram_size == 0 || sequence.len() + 1 < ngram_size {
        return Vec::new();
    }
    let prefix_len = ngram_size - 1;
    let current_prefix = &sequence[sequence.len() - prefix_len..];
    let mut banned = Vec::new();
    for window in sequence.windows(ngram_size) {
        if &window[..prefix_len] == current_prefix {
            banned.push(window[prefix_len]);
        }
    }
    banned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_largest() {
        let logits = Array1::from_vec(vec![0.1, 3.0, -1.0, 2.9]);
        assert_eq!(argmax(&logits), 1);
    }

    #[test]
    fn ngram_ban_finds_repeats() {
        // sequence ...[7, 8] has previously been followed by 9
        let sequence = vec![7u32, 8, 9, 1, 7, 8];
        assert_eq!(banned_ngram_tokens(&sequence, 3), vec![9]);
        assert!(banned_ngram_tokens(&sequence, 5).is_empty());
    }

    #[test]
    fn ngram_ban_short_sequences() {
        assert!(banned_ngram_tokens(&[1, 2], 4).is_empty());
        assert!(banned_ngram_tokens(&[], 2).is_empty());
    }
}
