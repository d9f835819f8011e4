//! Weight structures, safetensors loader, and seeded dummy init.

use crate::config::OptConfig;
use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct DecoderWeights {
    // Attention
    pub q_proj: Array2<f32>,
    pub k_proj: Array2<f32>,
    pub v_proj: Array2<f32>,
    pub out_proj: Array2<f32>,

    // LayerNorm (pre-attention)
    pub ln1_weight: Array1<f32>,
    pub ln1_bias: Array1<f32>,

    // MLP
    pub mlp_up: Array2<f32>,
    pub mlp_down: Array2<f32>,

    // LayerNorm (pre-MLP)
    pub ln2_weight: Array1<f32>,
    pub ln2_bias: Array1<f32>,
}

#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub token_embeddings: Array2<f32>,    // (vocab_size, hidden)
    pub position_embeddings: Array2<f32>, // (max_seq_len + offset, hidden)
    pub layers: Vec<DecoderWeights>,
    pub final_ln_weight: Array1<f32>,
    pub final_ln_bias: Array1<f32>,
    pub lm_head: Array2<f32>, // (hidden, vocab_size)
}

impl ModelWeights {
    /// Load weights from safetensors format.
    /// Expected tensor naming: layers.{i}.{component}
    pub fn load_safetensors(path: impl AsRef<Path>, config: &OptConfig) -> Result<Self> {
        let data = fs::read(path).context("failed to read safetensors file")?;
        let tensors = SafeTensors::deserialize(&data).context("failed to parse safetensors")?;

        let token_embeddings = load_tensor_2d(&tensors, "token_embeddings")?;
        let position_embeddings = load_tensor_2d(&tensors, "position_embeddings")?;
        let lm_head = load_tensor_2d(&tensors, "lm_head")?;
        let final_ln_weight = load_tensor_1d(&tensors, "final_ln.weight")?;
        let final_ln_bias = load_tensor_1d(&tensors, "final_ln.bias")?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let prefix = format!("layers.{}", i);
            layers.push(DecoderWeights {
                q_proj: load_tensor_2d(&tensors, &format!("{}.q_proj", prefix))?,
                k_proj: load_tensor_2d(&tensors, &format!("{}.k_proj", prefix))?,
                v_proj: load_tensor_2d(&tensors, &format!("{}.v_proj", prefix))?,
                out_proj: load_tensor_2d(&tensors, &format!("{}.out_proj", prefix))?,
                ln1_weight: load_tensor_1d(&tensors, &format!("{}.ln1.weight", prefix))?,
                ln1_bias: load_tensor_1d(&tensors, &format!("{}.ln1.bias", prefix))?,
                mlp_up: load_tensor_2d(&tensors, &format!("{}.mlp_up", prefix))?,
                mlp_down: load_tensor_2d(&tensors, &format!("{}.mlp_down", prefix))?,
                ln2_weight: load_tensor_1d(&tensors, &format!("{}.ln2.weight", prefix))?,
                ln2_bias: load_tensor_1d(&tensors, &format!("{}.ln2.bias", prefix))?,
            });
        }

        Ok(Self {
            token_embeddings,
            position_embeddings,
            layers,
            final_ln_weight,
            final_ln_bias,
            lm_head,
        })
    }

    /// Seeded dummy weights. Deterministic for a given seed so benchmark
    /// runs with `--dummy` are reproducible.
    pub fn dummy(config: &OptConfig, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut random_array =
            |shape: (usize, usize)| Array2::from_shape_simple_fn(shape, || (rng.f32() - 0.5) * 0.04);

        let token_embeddings = random_array((config.vocab_size, config.hidden_size));
        let position_embeddings = random_array((config.position_table_len(), config.hidden_size));
        let lm_head = random_array((config.hidden_size, config.vocab_size));

        let mut layers = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            layers.push(DecoderWeights {
                q_proj: random_array((config.hidden_size, config.hidden_size)),
                k_proj: random_array((config.hidden_size, config.hidden_size)),
                v_proj: random_array((config.hidden_size, config.hidden_size)),
                out_proj: random_array((config.hidden_size, config.hidden_size)),
                ln1_weight: Array1::ones(config.hidden_size),
                ln1_bias: Array1::zeros(config.hidden_size),
                mlp_up: random_array((config.hidden_size, config.d_ff)),
                mlp_down: random_array((config.d_ff, config.hidden_size)),
                ln2_weight: Array1::ones(config.hidden_size),
                ln2_bias: Array1::zeros(config.hidden_size),
            });
        }

        Self {
            token_embeddings,
            position_embeddings,
            layers,
            final_ln_weight: Array1::ones(config.hidden_size),
            final_ln_bias: Array1::zeros(config.hidden_size),
            lm_head,
        }
    }

    /// Shape-only description of the full parameter set.
    pub fn shapes(config: &OptConfig) -> WeightShapes {
        let h = config.hidden_size;
        let mut entries = vec![
            ("token_embeddings".to_string(), vec![config.vocab_size, h]),
            (
                "position_embeddings".to_string(),
                vec![config.position_table_len(), h],
            ),
        ];
        for i in 0..config.n_layers {
            let prefix = format!("layers.{}", i);
            entries.push((format!("{}.q_proj", prefix), vec![h, h]));
            entries.push((format!("{}.k_proj", prefix), vec![h, h]));
            entries.push((format!("{}.v_proj", prefix), vec![h, h]));
            entries.push((format!("{}.out_proj", prefix), vec![h, h]));
            entries.push((format!("{}.ln1.weight", prefix), vec![h]));
            entries.push((format!("{}.ln1.bias", prefix), vec![h]));
            entries.push((format!("{}.mlp_up", prefix), vec![h, config.d_ff]));
            entries.push((format!("{}.mlp_down", prefix), vec![config.d_ff, h]));
            entries.push((format!("{}.ln2.weight", prefix), vec![h]));
            entries.push((format!("{}.ln2.bias", prefix), vec![h]));
        }
        entries.push(("final_ln.weight".to_string(), vec![h]));
        entries.push(("final_ln.bias".to_string(), vec![h]));
        entries.push(("lm_head".to_string(), vec![h, config.vocab_size]));
        WeightShapes { entries }
    }

    pub fn num_params(&self) -> usize {
        let layer_params: usize = self
            .layers
            .iter()
            .map(|l| {
                l.q_proj.len()
                    + l.k_proj.len()
                    + l.v_proj.len()
                    + l.out_proj.len()
                    + l.ln1_weight.len()
                    + l.ln1_bias.len()
                    + l.mlp_up.len()
                    + l.mlp_down.len()
                    + l.ln2_weight.len()
                    + l.ln2_bias.len()
            })
            .sum();
        self.token_embeddings.len()
            + self.position_embeddings.len()
            + layer_params
            + self.final_ln_weight.len()
            + self.final_ln_bias.len()
            + self.lm_head.len()
    }
}

/// Shape-only view of the parameter set, for states that never materialize.
#[derive(Debug, Clone)]
pub struct WeightShapes {
    pub entries: Vec<(String, Vec<usize>)>,
}

impl WeightShapes {
    pub fn num_params(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, dims)| dims.iter().product::<usize>())
            .sum()
    }

    pub fn num_bytes_f32(&self) -> usize {
        self.num_params() * 4
    }
}

fn load_tensor_2d(tensors: &SafeTensors, name: &str) -> Result<Array2<f32>> {
    let (shape, floats) = load_tensor_raw(tensors, name)?;
    anyhow::ensure!(shape.len() == 2, "expected 2D tensor for {}", name);
    Array2::from_shape_vec((shape[0], shape[1]), floats).context("failed to reshape tensor")
}

fn load_tensor_1d(tensors: &SafeTensors, name: &str) -> Result<Array1<f32>> {
    let (shape, floats) = load_tensor_raw(tensors, name)?;
    anyhow::ensure!(shape.len() == 1, "expected 1D tensor for {}", name);
    Ok(Array1::from_vec(floats))
}

fn load_tensor_raw(tensors: &SafeTensors, name: &str) -> Result<(Vec<usize>, Vec<f32>)> {
    let view = tensors
        .tensor(name)
        .with_context(|| format!("tensor '{}' not found", name))?;

    let shape = view.shape().to_vec();
    let data = view.data();
    let floats: Vec<f32> = data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((shape, floats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_weights_are_deterministic() {
        let config = OptConfig::tiny();
        let a = ModelWeights::dummy(&config, 7);
        let b = ModelWeights::dummy(&config, 7);
        assert_eq!(a.token_embeddings, b.token_embeddings);
        assert_eq!(a.layers[0].q_proj, b.layers[0].q_proj);

        let c = ModelWeights::dummy(&config, 8);
        assert_ne!(a.token_embeddings, c.token_embeddings);
    }

    #[test]
    fn shapes_match_materialized_count() {
        let config = OptConfig::tiny();
        let weights = ModelWeights::dummy(&config, 0);
        let shapes = ModelWeights::shapes(&config);
        assert_eq!(shapes.num_params(), weights.num_params());
    }
}
