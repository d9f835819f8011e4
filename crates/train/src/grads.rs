//! Gradient accumulators mirroring the model parameter layout.

use ndarray::{Array1, Array2};
use optmesh_model::OptConfig;

pub struct LayerGrads {
    pub q_proj: Array2<f32>,
    pub k_proj: Array2<f32>,
    pub v_proj: Array2<f32>,
    pub out_proj: Array2<f32>,
    pub ln1_weight: Array1<f32>,
    pub ln1_bias: Array1<f32>,
    pub mlp_up: Array2<f32>,
    pub mlp_down: Array2<f32>,
    pub ln2_weight: Array1<f32>,
    pub ln2_bias: Array1<f32>,
}

pub struct WeightGrads {
    pub token_embeddings: Array2<f32>,
    pub position_embeddings: Array2<f32>,
    pub layers: Vec<LayerGrads>,
    pub final_ln_weight: Array1<f32>,
    pub final_ln_bias: Array1<f32>,
    pub lm_head: Array2<f32>,
}

impl WeightGrads {
    pub fn zeros(config: &OptConfig) -> Self {
        let h = config.hidden_size;
        let layers = (0..config.n_layers)
            .map(|_| LayerGrads {
                q_proj: Array2::zeros((h, h)),
                k_proj: Array2::zeros((h, h)),
                v_proj: Array2::zeros((h, h)),
                out_proj: Array2::zeros((h, h)),
                ln1_weight: Array1::zeros(h),
                ln1_bias: Array1::zeros(h),
                mlp_up: Array2::zeros((h, config.d_ff)),
                mlp_down: Array2::zeros((config.d_ff, h)),
                ln2_weight: Array1::zeros(h),
                ln2_bias: Array1::zeros(h),
            })
            .collect();

        Self {
            token_embeddings: Array2::zeros((config.vocab_size, h)),
            position_embeddings: Array2::zeros((config.position_table_len(), h)),
            layers,
            final_ln_weight: Array1::zeros(h),
            final_ln_bias: Array1::zeros(h),
            lm_head: Array2::zeros((h, config.vocab_size)),
        }
    }
}
