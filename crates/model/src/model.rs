//! Full causal LM: embeddings, decoder stack, and LM head.

use crate::config::OptConfig;
use crate::decoder::DecoderLayer;
use crate::kv_cache::KvCache;
use crate::weights::ModelWeights;
use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1};
use optmesh_kernels::layernorm::layer_norm;
use optmesh_kernels::matmul::DynMatmulKernel;

const LN_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    pub output_hidden_states: bool,
    pub output_attentions: bool,
}

pub struct ForwardOutput {
    /// Logits for the last processed position: (vocab_size,)
    pub logits: Array1<f32>,
    /// Final-layernorm hidden states for all new positions: (seq_len, hidden)
    pub hidden_states: Option<Array2<f32>>,
    /// Per-layer attention probabilities: (n_heads, seq_len, total_len)
    pub attentions: Option<Vec<Array3<f32>>>,
}

pub struct CausalTransformer {
    config: OptConfig,
    weights: ModelWeights,
    decoder: DecoderLayer,
}

impl CausalTransformer {
    pub fn new(config: OptConfig, weights: ModelWeights) -> Self {
        let decoder = DecoderLayer::new(config.clone());
        Self {
            config,
            weights,
            decoder,
        }
    }

    pub fn with_kernel(config: OptConfig, weights: ModelWeights, kernel: DynMatmulKernel) -> Self {
        let decoder = DecoderLayer::with_kernel(config.clone(), kernel);
        Self {
            config,
            weights,
            decoder,
        }
    }

    pub fn config(&self) -> &OptConfig {
        &self.config
    }

    pub fn new_cache(&self) -> KvCache {
        KvCache::new(
            self.config.n_layers,
            self.config.max_seq_len,
            self.config.hidden_size,
        )
    }

    /// Forward pass for one incremental step: embed the new token ids, run
    /// the decoder stack against the cache, and project the last position.
    ///
    /// `positions` overrides the position ids (one per token); by default
    /// they continue from the cache length, offset past the padding id.
    pub fn forward(
        &self,
        token_ids: &[u32],
        cache: &mut KvCache,
        positions: Option<&[usize]>,
        padding_mask: Option<ArrayView1<'_, f32>>,
        opts: ForwardOptions,
    ) -> Result<ForwardOutput> {
        let seq_len = token_ids.len();
        ensure!(seq_len > 0, "forward requires at least one token");

        let offset = self.config.position_offset();
        let default_positions: Vec<usize>;
        let positions = match positions {
            Some(p) => {
                ensure!(
                    p.len() == seq_len,
                    "got {} position ids for {} tokens",
                    p.len(),
                    seq_len
                );
                p
            }
            None => {
                default_positions = (0..seq_len).map(|i| offset + cache.len() + i).collect();
                &default_positions
            }
        };

        // Embedding lookup: token + learned position embedding
        let mut hidden = Array2::<f32>::zeros((seq_len, self.config.hidden_size));
        for (i, (&token_id, &pos)) in token_ids.iter().zip(positions.iter()).enumerate() {
            ensure!(
                (token_id as usize) < self.config.vocab_size,
                "token id {} out of vocabulary",
                token_id
            );
            ensure!(
                pos < self.config.position_table_len(),
                "position id {} beyond embedding table",
                pos
            );
            let mut row = hidden.row_mut(i);
            row.assign(&self.weights.token_embeddings.row(token_id as usize));
            row += &self.weights.position_embeddings.row(pos);
        }

        // Decoder stack
        let mut attentions = opts.output_attentions.then(Vec::new);
        for (layer_idx, layer_weights) in self.weights.layers.iter().enumerate() {
            let (next, probs) = self.decoder.forward(
                &hidden,
                layer_weights,
                cache,
                layer_idx,
                padding_mask,
                opts.output_attentions,
            )?;
            hidden = next;
            if let (Some(all), Some(probs)) = (attentions.as_mut(), probs) {
                all.push(probs);
            }
        }

        // Final layernorm + LM head
        let normed = layer_norm(
            hidden.view(),
            self.weights.final_ln_weight.view(),
            self.weights.final_ln_bias.view(),
            LN_EPSILON,
        )?;
        let logits = normed.row(seq_len - 1).dot(&self.weights.lm_head);

        Ok(ForwardOutput {
            logits,
            hidden_states: opts.output_hidden_states.then_some(normed),
            attentions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_model() -> CausalTransformer {
        let config = OptConfig::tiny();
        let weights = ModelWeights::dummy(&config, 3);
        CausalTransformer::new(config, weights)
    }

    #[test]
    fn forward_returns_vocab_logits() {
        let model = tiny_model();
        let mut cache = model.new_cache();
        let out = model
            .forward(&[5, 6, 7], &mut cache, None, None, ForwardOptions::default())
            .expect("forward");
        assert_eq!(out.logits.len(), model.config().vocab_size);
        assert_eq!(cache.len(), 3);
        assert!(out.hidden_states.is_none());
        assert!(out.attentions.is_none());
    }

    #[test]
    fn incremental_matches_prefill() {
        let model = tiny_model();

        // Whole prompt in one call
        let mut cache_a = model.new_cache();
        let out_a = model
            .forward(&[5, 6, 7], &mut cache_a, None, None, ForwardOptions::default())
            .unwrap();

        // Same prompt one token at a time
        let mut cache_b = model.new_cache();
        let mut out_b = None;
        for &t in &[5u32, 6, 7] {
            out_b = Some(
                model
                    .forward(&[t], &mut cache_b, None, None, ForwardOptions::default())
                    .unwrap(),
            );
        }
        let out_b = out_b.unwrap();

        assert_eq!(cache_a.len(), cache_b.len());
        for (a, b) in out_a.logits.iter().zip(out_b.logits.iter()) {
            assert!((a - b).abs() < 1e-4, "prefill/incremental mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn optional_outputs_are_populated() {
        let model = tiny_model();
        let mut cache = model.new_cache();
        let opts = ForwardOptions {
            output_hidden_states: true,
            output_attentions: true,
        };
        let out = model.forward(&[1, 2], &mut cache, None, None, opts).unwrap();
        let hidden = out.hidden_states.expect("hidden states");
        assert_eq!(hidden.dim(), (2, model.config().hidden_size));
        let attentions = out.attentions.expect("attentions");
        assert_eq!(attentions.len(), model.config().n_layers);
        assert_eq!(attentions[0].dim(), (model.config().n_heads, 2, 2));
    }

    #[test]
    fn rejects_out_of_vocab_token() {
        let model = tiny_model();
        let mut cache = model.new_cache();
        let vocab = model.config().vocab_size as u32;
        assert!(model
            .forward(&[vocab], &mut cache, None, None, ForwardOptions::default())
            .is_err());
    }
}
