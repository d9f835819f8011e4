//! Decoding hyperparameters.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Flat record of decoding hyperparameters.
///
/// Defaults follow the OPT family conventions (bos=0, pad=1, eos=2). Beam
/// and group knobs are carried and validated so configs round-trip, but the
/// sampling driver only supports single-beam decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub bos_token_id: u32,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub num_beams: usize,
    pub num_beam_groups: usize,
    pub num_return_sequences: usize,
    pub length_penalty: f32,
    pub repetition_penalty: f32,
    pub diversity_penalty: f32,
    pub early_stopping: bool,
    pub min_length: usize,
    pub no_repeat_ngram_size: usize,
    pub bad_words_ids: Vec<Vec<u32>>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub typical_p: f32,
    pub output_scores: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            bos_token_id: 0,
            pad_token_id: 1,
            eos_token_id: 2,
            num_beams: 1,
            num_beam_groups: 1,
            num_return_sequences: 1,
            length_penalty: 1.0,
            repetition_penalty: 1.0,
            diversity_penalty: 0.0,
            early_stopping: false,
            min_length: 0,
            no_repeat_ngram_size: 0,
            bad_words_ids: Vec::new(),
            forced_bos_token_id: None,
            forced_eos_token_id: None,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            typical_p: 1.0,
            output_scores: false,
            output_attentions: false,
            output_hidden_states: false,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_beams >= 1, "num_beams must be at least 1");
        ensure!(self.num_beam_groups >= 1, "num_beam_groups must be at least 1");
        ensure!(
            self.num_return_sequences >= 1,
            "num_return_sequences must be at least 1"
        );
        ensure!(self.temperature > 0.0, "temperature must be positive");
        ensure!(
            self.repetition_penalty >= 0.0,
            "repetition_penalty must be non-negative"
        );
        ensure!(
            self.length_penalty >= 0.0,
            "length_penalty must be non-negative"
        );
        ensure!(
            self.diversity_penalty >= 0.0,
            "diversity_penalty must be non-negative"
        );
        ensure!(
            self.top_p > 0.0 && self.top_p <= 1.0,
            "top_p must be in (0, 1]"
        );
        ensure!(
            self.typical_p > 0.0 && self.typical_p <= 1.0,
            "typical_p must be in (0, 1]"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        GenerationConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_ranges_are_rejected() {
        let mut config = GenerationConfig::default();
        config.temperature = 0.0;
        assert!(config.validate().is_err());

        let mut config = GenerationConfig::default();
        config.top_p = 1.5;
        assert!(config.validate().is_err());

        let mut config = GenerationConfig::default();
        config.repetition_penalty = -0.1;
        assert!(config.validate().is_err());
    }
}
