//! Sharded parameter sets: per-stage shards of the model weights.

use crate::partition::StagePartition;
use anyhow::{ensure, Context, Result};
use ndarray::{Array1, Array2};
use optmesh_model::weights::{DecoderWeights, ModelWeights, WeightShapes};
use optmesh_model::OptConfig;
use std::path::Path;
use tracing::info;

pub struct StageEmbeddings {
    pub token: Array2<f32>,
    pub position: Array2<f32>,
}

pub struct StageHead {
    pub ln_weight: Array1<f32>,
    pub ln_bias: Array1<f32>,
    pub lm_head: Array2<f32>,
}

/// Parameters resident on one pipeline stage.
pub struct StageParams {
    /// Input embeddings, only on the first stage.
    pub embeddings: Option<StageEmbeddings>,
    pub layers: Vec<DecoderWeights>,
    /// Final layernorm + LM head, only on the last stage.
    pub head: Option<StageHead>,
}

pub struct ShardedParams {
    stages: Vec<StageParams>,
}

impl ShardedParams {
    /// Shard a full weight set across the stage partition.
    pub fn from_weights(weights: ModelWeights, partition: &StagePartition) -> Result<Self> {
        ensure!(
            weights.layers.len() == partition.iter().map(|r| r.len()).sum::<usize>(),
            "weight layer count does not match partition"
        );

        let mut layer_iter = weights.layers.into_iter();
        let num_stages = partition.num_stages();
        let mut stages = Vec::with_capacity(num_stages);

        for stage in 0..num_stages {
            let range = partition.stage_layers(stage);
            let layers: Vec<DecoderWeights> = layer_iter.by_ref().take(range.len()).collect();

            let embeddings = (stage == 0).then(|| StageEmbeddings {
                token: weights.token_embeddings.clone(),
                position: weights.position_embeddings.clone(),
            });
            let head = (stage == num_stages - 1).then(|| StageHead {
                ln_weight: weights.final_ln_weight.clone(),
                ln_bias: weights.final_ln_bias.clone(),
                lm_head: weights.lm_head.clone(),
            });

            stages.push(StageParams {
                embeddings,
                layers,
                head,
            });
        }

        Ok(Self { stages })
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, idx: usize) -> &StageParams {
        &self.stages[idx]
    }
}

/// Shape-only parameter description, for states that never materialize.
pub fn params_aval(config: &OptConfig) -> WeightShapes {
    ModelWeights::shapes(config)
}

/// Load the sharded parameter set from storage, or fill it with seeded
/// dummy values when `dummy` is set.
pub fn load_sharded_params(
    path: Option<&Path>,
    config: &OptConfig,
    partition: &StagePartition,
    dummy: bool,
    seed: u64,
) -> Result<ShardedParams> {
    let weights = if dummy {
        info!(seed, "filling sharded params with dummy values");
        ModelWeights::dummy(config, seed)
    } else {
        let path = path.context("weights path required unless dummy weights are requested")?;
        info!(path = %path.display(), "loading sharded params from safetensors");
        ModelWeights::load_safetensors(path, config)?
    };
    ShardedParams::from_weights(weights, partition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharding_places_embeddings_and_head() {
        let config = OptConfig::tiny();
        let partition = StagePartition::contiguous(config.n_layers, 2).unwrap();
        let weights = ModelWeights::dummy(&config, 0);
        let params = ShardedParams::from_weights(weights, &partition).unwrap();

        assert_eq!(params.num_stages(), 2);
        assert!(params.stage(0).embeddings.is_some());
        assert!(params.stage(0).head.is_none());
        assert!(params.stage(1).embeddings.is_none());
        assert!(params.stage(1).head.is_some());

        let total_layers: usize = (0..2).map(|s| params.stage(s).layers.len()).sum();
        assert_eq!(total_layers, config.n_layers);
    }

    #[test]
    fn missing_path_without_dummy_is_an_error() {
        let config = OptConfig::tiny();
        let partition = StagePartition::contiguous(config.n_layers, 2).unwrap();
        assert!(load_sharded_params(None, &config, &partition, false, 0).is_err());
    }
}
