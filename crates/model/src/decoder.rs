//! Decoder layer: pre-LN self-attention + GELU MLP with KV-cache support.

use crate::config::OptConfig;
use crate::kv_cache::KvCache;
use crate::weights::DecoderWeights;
use anyhow::Result;
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2};
use optmesh_kernels::attention::scaled_dot_product_attention_with_probs;
use optmesh_kernels::config::{ActivationKind, MatmulProblem};
use optmesh_kernels::layernorm::layer_norm;
use optmesh_kernels::matmul::{DynMatmulKernel, MatmulInputs, ReferenceMatmul};
use std::sync::Arc;

const LN_EPSILON: f32 = 1e-5;
const PADDING_MASK_BIAS: f32 = -1e9;

pub struct DecoderLayer {
    config: OptConfig,
    kernel: DynMatmulKernel,
}

impl DecoderLayer {
    pub fn new(config: OptConfig) -> Self {
        Self::with_kernel(config, Arc::new(ReferenceMatmul::new()))
    }

    pub fn with_kernel(config: OptConfig, kernel: DynMatmulKernel) -> Self {
        Self { config, kernel }
    }

    /// Forward pass for a single decoder layer.
    ///
    /// Inputs:
    /// - x: (seq_len, hidden) hidden states for the new positions
    /// - weights: layer weights
    /// - kv_cache: cache shared across layers; this layer's slot is extended
    /// - padding_mask: optional 0/1 validity over all cached + new positions
    ///
    /// Returns the (seq_len, hidden) output and, when requested, the
    /// attention probabilities with shape (n_heads, seq_len, total_len).
    pub fn forward(
        &self,
        x: &Array2<f32>,
        weights: &DecoderWeights,
        kv_cache: &mut KvCache,
        layer_idx: usize,
        padding_mask: Option<ArrayView1<'_, f32>>,
        collect_attention: bool,
    ) -> Result<(Array2<f32>, Option<Array3<f32>>)> {
        let (seq_len, hidden) = x.dim();
        assert_eq!(hidden, self.config.hidden_size);

        let past_len = kv_cache.get(layer_idx).0.nrows();

        // 1. Pre-attention layernorm
        let x_norm = layer_norm(
            x.view(),
            weights.ln1_weight.view(),
            weights.ln1_bias.view(),
            LN_EPSILON,
        )?;

        // 2. QKV projection
        let q = self.matmul(x_norm.view(), weights.q_proj.view(), ActivationKind::None)?;
        let k_new = self.matmul(x_norm.view(), weights.k_proj.view(), ActivationKind::None)?;
        let v_new = self.matmul(x_norm.view(), weights.v_proj.view(), ActivationKind::None)?;

        kv_cache.append(layer_idx, k_new, v_new);
        let (k_full, v_full) = kv_cache.get(layer_idx);
        let total_len = k_full.nrows();

        let mask = build_attention_mask(seq_len, past_len, total_len, padding_mask.as_ref())?;

        // 3. Per-head attention over the full cached history
        let n_heads = self.config.n_heads;
        let head_dim = self.config.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let mut context = Array2::<f32>::zeros((seq_len, hidden));
        let mut probs = collect_attention
            .then(|| Array3::<f32>::zeros((n_heads, seq_len, total_len)));

        for h in 0..n_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            let q_h = q.slice(s![.., cols.clone()]);
            let k_h = k_full.slice(s![.., cols.clone()]);
            let v_h = v_full.slice(s![.., cols.clone()]);

            let (ctx_h, probs_h) = scaled_dot_product_attention_with_probs(
                q_h,
                k_h,
                v_h,
                Some(mask.view()),
                scale,
            )?;
            context.slice_mut(s![.., cols]).assign(&ctx_h);
            if let Some(probs) = probs.as_mut() {
                probs.slice_mut(s![h, .., ..]).assign(&probs_h);
            }
        }

        // 4. Output projection + residual
        let attn_out = self.matmul(context.view(), weights.out_proj.view(), ActivationKind::None)?;
        let x = x + &attn_out;

        // 5. Pre-MLP layernorm
        let x_norm = layer_norm(
            x.view(),
            weights.ln2_weight.view(),
            weights.ln2_bias.view(),
            LN_EPSILON,
        )?;

        // 6. MLP (GELU fused into the up-projection kernel) + residual
        let mlp_hidden = self.matmul(x_norm.view(), weights.mlp_up.view(), ActivationKind::Gelu)?;
        let mlp_out = self.matmul(mlp_hidden.view(), weights.mlp_down.view(), ActivationKind::None)?;
        let x = x + &mlp_out;

        Ok((x, probs))
    }

    fn matmul<'a>(
        &self,
        lhs: ArrayView2<'a, f32>,
        rhs: ArrayView2<'a, f32>,
        activation: ActivationKind,
    ) -> Result<Array2<f32>> {
        let problem = MatmulProblem::new(lhs.nrows(), rhs.ncols(), lhs.ncols());
        let inputs = MatmulInputs::new(lhs, rhs, None, activation);
        self.kernel.run(&problem, &inputs)
    }
}

/// Additive attention mask: causal over the new positions, plus an optional
/// padding mask over all cached + new positions.
fn build_attention_mask(
    seq_len: usize,
    past_len: usize,
    total_len: usize,
    padding_mask: Option<&ArrayView1<'_, f32>>,
) -> Result<Array2<f32>> {
    if let Some(mask) = padding_mask {
        anyhow::ensure!(
            mask.len() == total_len,
            "padding mask length {} does not cover {} positions",
            mask.len(),
            total_len
        );
    }

    let mut out = Array2::<f32>::zeros((seq_len, total_len));
    for i in 0..seq_len {
        for j in 0..total_len {
            if j > past_len + i {
                out[(i, j)] = f32::NEG_INFINITY;
            } else if let Some(mask) = padding_mask {
                if mask[j] == 0.0 {
                    out[(i, j)] = PADDING_MASK_BIAS;
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::ModelWeights;

    #[test]
    fn causal_mask_blocks_future_positions() {
        let mask = build_attention_mask(3, 2, 5, None).unwrap();
        // row 0 sees cached 0..2 plus itself
        assert_eq!(mask[(0, 2)], 0.0);
        assert_eq!(mask[(0, 3)], f32::NEG_INFINITY);
        // last row sees everything
        assert!(mask.row(2).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn padding_mask_is_applied() {
        let padding = ndarray::Array1::from_vec(vec![0.0, 1.0, 1.0]);
        let mask = build_attention_mask(1, 2, 3, Some(&padding.view())).unwrap();
        assert_eq!(mask[(0, 0)], PADDING_MASK_BIAS);
        assert_eq!(mask[(0, 1)], 0.0);
    }

    #[test]
    fn forward_extends_cache_and_keeps_shape() {
        let config = OptConfig::tiny();
        let weights = ModelWeights::dummy(&config, 1);
        let layer = DecoderLayer::new(config.clone());
        let mut cache = KvCache::new(config.n_layers, config.max_seq_len, config.hidden_size);

        let x = Array2::<f32>::ones((4, config.hidden_size));
        let (out, probs) = layer
            .forward(&x, &weights.layers[0], &mut cache, 0, None, true)
            .expect("decoder forward");

        assert_eq!(out.dim(), (4, config.hidden_size));
        assert_eq!(cache.get(0).0.nrows(), 4);
        let probs = probs.expect("attention probabilities");
        assert_eq!(probs.dim(), (config.n_heads, 4, 4));
    }
}
