//! Compiled decode-step executables.
//!
//! A `PipeshardExecutable` is compiled for a FIXED batch-of-one, single-token
//! step so the execution shape never changes between calls. Multi-token
//! prompts must therefore be fed one position at a time by the caller. The
//! reference engine runs the stages sequentially on the local host; a real
//! deployment would place each stage on its own mesh.

use crate::array::DeviceArray;
use crate::cluster::Cluster;
use crate::params::ShardedParams;
use crate::partition::StagePartition;
use anyhow::{ensure, Context, Result};
use ndarray::{Array2, Axis};
use optmesh_kernels::layernorm::layer_norm;
use optmesh_kernels::registry::KernelRegistry;
use optmesh_model::decoder::DecoderLayer;
use optmesh_model::{KvCache, OptConfig, WeightShapes};
use tracing::{debug, info};

const LN_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct ExecutableOptions {
    pub support_output_attentions: bool,
    pub support_output_hidden_states: bool,
    /// Matmul kernel name resolved through the kernel registry.
    pub matmul_kernel: String,
}

impl Default for ExecutableOptions {
    fn default() -> Self {
        Self {
            support_output_attentions: false,
            support_output_hidden_states: false,
            matmul_kernel: "reference".to_string(),
        }
    }
}

/// Opaque per-stage KV cache owned by the runtime.
pub struct DeviceKvCache {
    stages: Vec<KvCache>,
}

impl DeviceKvCache {
    /// Build an empty cache with one slot group per stage.
    pub fn new(stage_layer_counts: &[usize], max_len: usize, hidden: usize) -> Self {
        let stages = stage_layer_counts
            .iter()
            .map(|&n| KvCache::new(n, max_len, hidden))
            .collect();
        Self { stages }
    }

    /// Logical number of decode steps this cache has absorbed.
    pub fn step_count(&self) -> usize {
        self.stages.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }
}

/// Inputs for one compiled decode step. The cache moves in and the updated
/// cache moves back out through `StepOutputs`; it is never shared.
pub struct StepInputs {
    pub input_ids: DeviceArray,
    pub position_ids: DeviceArray,
    pub cache: DeviceKvCache,
}

pub struct StepOutputs {
    /// Logits for the processed position: (1, vocab_size)
    pub logits: DeviceArray,
    pub attention_cache: DeviceKvCache,
    pub hidden_states: Option<DeviceArray>,
    pub attentions: Option<Vec<DeviceArray>>,
}

/// A compiled "params + inputs -> outputs" decode step.
pub trait DecodeStepExecutable: Send + Sync {
    fn execute(&self, params: &ShardedParams, inputs: StepInputs) -> Result<StepOutputs>;

    /// Build the empty cache this executable expects.
    fn init_cache(&self) -> DeviceKvCache;

    /// Wait for all in-flight device work. The reference engine is
    /// synchronous, so this is immediate.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

pub struct PipeshardExecutable {
    config: OptConfig,
    partition: StagePartition,
    options: ExecutableOptions,
    decoder: DecoderLayer,
}

/// Compile a decode-step executable for the cluster topology and return it
/// together with the shape-only parameter description.
pub fn compile_decode_step(
    config: &OptConfig,
    cluster: &Cluster,
    options: ExecutableOptions,
) -> Result<(PipeshardExecutable, WeightShapes)> {
    let num_stages = cluster.num_pp_stages();
    let partition = StagePartition::contiguous(config.n_layers, num_stages)?;

    let registry = KernelRegistry::with_default_matmul_kernels();
    let kernel = registry
        .find_matmul_kernel(&options.matmul_kernel)
        .with_context(|| format!("unknown matmul kernel '{}'", options.matmul_kernel))?;

    info!(
        stages = num_stages,
        layers = config.n_layers,
        kernel = %options.matmul_kernel,
        "compiled decode-step executable"
    );

    let executable = PipeshardExecutable {
        config: config.clone(),
        partition,
        options,
        decoder: DecoderLayer::with_kernel(config.clone(), kernel),
    };
    let aval = crate::params::params_aval(config);
    Ok((executable, aval))
}

impl PipeshardExecutable {
    pub fn config(&self) -> &OptConfig {
        &self.config
    }

    pub fn partition(&self) -> &StagePartition {
        &self.partition
    }
}

impl DecodeStepExecutable for PipeshardExecutable {
    fn init_cache(&self) -> DeviceKvCache {
        let counts: Vec<usize> = self.partition.iter().map(|range| range.len()).collect();
        DeviceKvCache::new(&counts, self.config.max_seq_len, self.config.hidden_size)
    }

    fn execute(&self, params: &ShardedParams, inputs: StepInputs) -> Result<StepOutputs> {
        let input_ids = inputs.input_ids.to_host_u32_2d()?;
        let position_ids = inputs.position_ids.to_host_u32_2d()?;
        let mut cache = inputs.cache;

        ensure!(
            input_ids.dim() == (1, 1),
            "executable is compiled for a fixed 1x1 input, got {:?}",
            input_ids.dim()
        );
        ensure!(
            position_ids.dim() == (1, 1),
            "position ids must match the compiled 1x1 input shape"
        );
        ensure!(
            params.num_stages() == self.partition.num_stages()
                && cache.num_stages() == self.partition.num_stages(),
            "params/cache stage count does not match the executable"
        );

        let token = input_ids[(0, 0)] as usize;
        let position = position_ids[(0, 0)] as usize;
        ensure!(token < self.config.vocab_size, "token id {} out of vocabulary", token);
        ensure!(
            position < self.config.position_table_len(),
            "position id {} beyond embedding table",
            position
        );

        // Stage 0 holds the embeddings.
        let embeddings = params
            .stage(0)
            .embeddings
            .as_ref()
            .context("first stage is missing embeddings")?;
        let mut hidden = Array2::<f32>::zeros((1, self.config.hidden_size));
        {
            let mut row = hidden.row_mut(0);
            row.assign(&embeddings.token.row(token));
            row += &embeddings.position.row(position);
        }

        let collect_attention = self.options.support_output_attentions;
        let mut attentions = collect_attention.then(Vec::new);

        for stage in 0..self.partition.num_stages() {
            let stage_params = params.stage(stage);
            let stage_cache = &mut cache.stages[stage];
            for (local_idx, layer_weights) in stage_params.layers.iter().enumerate() {
                let (next, probs) = self.decoder.forward(
                    &hidden,
                    layer_weights,
                    stage_cache,
                    local_idx,
                    None,
                    collect_attention,
                )?;
                hidden = next;
                if let (Some(all), Some(probs)) = (attentions.as_mut(), probs) {
                    all.push(DeviceArray::from_f32(probs));
                }
            }
        }

        // Last stage projects to the vocabulary.
        let head = params
            .stage(self.partition.num_stages() - 1)
            .head
            .as_ref()
            .context("last stage is missing the LM head")?;
        let normed = layer_norm(
            hidden.view(),
            head.ln_weight.view(),
            head.ln_bias.view(),
            LN_EPSILON,
        )?;
        let logits = normed.row(0).dot(&head.lm_head).insert_axis(Axis(0));

        debug!(step = cache.step_count(), position, "executed decode step");

        Ok(StepOutputs {
            logits: DeviceArray::from_f32(logits),
            hidden_states: self
                .options
                .support_output_hidden_states
                .then(|| DeviceArray::from_f32(normed)),
            attentions,
            attention_cache: cache,
        })
    }
}
