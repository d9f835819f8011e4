//! Backend variants behind the single-step inference interface.
//!
//! All variants share one contract: feed the new token ids plus the cache so
//! far, get back last-position logits and the grown cache. Which variant to
//! build is decided once, from an explicit `EngineKind`, at construction.

use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use optmesh_kernels::registry::KernelRegistry;
use optmesh_model::model::{CausalTransformer, ForwardOptions};
use optmesh_model::{KvCache, ModelWeights, OptConfig};
use optmesh_runtime::{
    compile_decode_step, Cluster, ClusterConfig, DecodeStepExecutable, DeviceArray,
    DeviceKvCache, ExecutableOptions, ShardedParams, StepInputs,
};
use std::path::PathBuf;
use tracing::info;

/// Opaque per-sequence decoding cache, threaded between steps by the caller.
pub enum StepCache {
    Host(KvCache),
    Device(DeviceKvCache),
}

impl StepCache {
    /// Logical number of positions the cache has absorbed.
    pub fn step_count(&self) -> usize {
        match self {
            StepCache::Host(cache) => cache.len(),
            StepCache::Device(cache) => cache.step_count(),
        }
    }
}

/// Output of one backend step.
pub struct StepOutput {
    /// Logits for the last processed position: (batch, vocab_size)
    pub logits: Array2<f32>,
    pub cache: StepCache,
    pub hidden_states: Option<Array2<f32>>,
    pub attentions: Option<Vec<Array3<f32>>>,
}

/// Single-step "token ids + cache -> logits" calling convention.
pub trait InferenceBackend {
    fn step(&mut self, input_ids: ArrayView2<'_, u32>, cache: Option<StepCache>)
        -> Result<StepOutput>;
}

/// Which backend variant to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// In-process decoder, native cache passthrough.
    Local,
    /// In-process decoder that rebuilds a full attention mask from the cache
    /// length on every step.
    MaskedLocal,
    /// Pipeline-sharded decode-step executable behind the runtime interface.
    Pipeshard,
}

/// Everything needed to build a backend, resolved once up front.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub engine: EngineKind,
    pub config: OptConfig,
    pub weights: Option<PathBuf>,
    pub dummy: bool,
    pub seed: u64,
    pub matmul_kernel: String,
    pub cluster: ClusterConfig,
    pub output_hidden_states: bool,
    pub output_attentions: bool,
}

impl BackendSpec {
    pub fn new(engine: EngineKind, config: OptConfig) -> Self {
        Self {
            engine,
            config,
            weights: None,
            dummy: true,
            seed: 0,
            matmul_kernel: "reference".to_string(),
            cluster: ClusterConfig::default(),
            output_hidden_states: false,
            output_attentions: false,
        }
    }

    fn forward_options(&self) -> ForwardOptions {
        ForwardOptions {
            output_hidden_states: self.output_hidden_states,
            output_attentions: self.output_attentions,
        }
    }

    fn load_weights(&self) -> Result<ModelWeights> {
        if self.dummy {
            info!(seed = self.seed, "using dummy weights (not pretrained)");
            Ok(ModelWeights::dummy(&self.config, self.seed))
        } else {
            let path = self
                .weights
                .as_deref()
                .context("weights path required unless dummy weights are requested")?;
            info!(path = %path.display(), "loading weights from safetensors");
            ModelWeights::load_safetensors(path, &self.config)
        }
    }
}

/// Construct the backend a spec describes.
pub fn build_backend(spec: &BackendSpec) -> Result<Box<dyn InferenceBackend>> {
    let registry = KernelRegistry::with_default_matmul_kernels();
    let kernel = registry
        .find_matmul_kernel(&spec.matmul_kernel)
        .with_context(|| format!("unknown matmul kernel '{}'", spec.matmul_kernel))?;

    match spec.engine {
        EngineKind::Local => {
            let model =
                CausalTransformer::with_kernel(spec.config.clone(), spec.load_weights()?, kernel);
            Ok(Box::new(LocalDecoder::new(model, spec.forward_options())))
        }
        EngineKind::MaskedLocal => {
            let model =
                CausalTransformer::with_kernel(spec.config.clone(), spec.load_weights()?, kernel);
            Ok(Box::new(MaskedLocalDecoder::new(
                model,
                spec.forward_options(),
            )))
        }
        EngineKind::Pipeshard => {
            let cluster = Cluster::init(spec.cluster.clone())?;
            let options = ExecutableOptions {
                support_output_attentions: spec.output_attentions,
                support_output_hidden_states: spec.output_hidden_states,
                matmul_kernel: spec.matmul_kernel.clone(),
            };
            let (executable, _aval) = compile_decode_step(&spec.config, &cluster, options)?;
            let params = optmesh_runtime::load_sharded_params(
                spec.weights.as_deref(),
                &spec.config,
                executable.partition(),
                spec.dummy,
                spec.seed,
            )?;
            executable.sync()?;
            Ok(Box::new(PipeshardBackend::new(
                Box::new(executable),
                params,
                spec.config.clone(),
            )))
        }
    }
}

fn single_row(input_ids: ArrayView2<'_, u32>) -> Result<Vec<u32>> {
    ensure!(
        input_ids.nrows() == 1,
        "only batch size 1 is supported, got {}",
        input_ids.nrows()
    );
    ensure!(input_ids.ncols() > 0, "step requires at least one token");
    Ok(input_ids.row(0).to_vec())
}

fn logits_to_batch(logits: Array1<f32>) -> Array2<f32> {
    logits.insert_axis(Axis(0))
}

/// Plain in-process decoder backend.
pub struct LocalDecoder {
    model: CausalTransformer,
    opts: ForwardOptions,
}

impl LocalDecoder {
    pub fn new(model: CausalTransformer, opts: ForwardOptions) -> Self {
        Self { model, opts }
    }
}

impl InferenceBackend for LocalDecoder {
    fn step(
        &mut self,
        input_ids: ArrayView2<'_, u32>,
        cache: Option<StepCache>,
    ) -> Result<StepOutput> {
        let tokens = single_row(input_ids)?;
        let mut cache = match cache {
            None => self.model.new_cache(),
            Some(StepCache::Host(cache)) => cache,
            Some(StepCache::Device(_)) => bail!("local backend got a device cache"),
        };

        let out = self.model.forward(&tokens, &mut cache, None, None, self.opts)?;
        Ok(StepOutput {
            logits: logits_to_batch(out.logits),
            cache: StepCache::Host(cache),
            hidden_states: out.hidden_states,
            attentions: out.attentions,
        })
    }
}

/// In-process decoder that feeds an explicit attention mask, rebuilt from
/// the cache length on every step.
pub struct MaskedLocalDecoder {
    model: CausalTransformer,
    opts: ForwardOptions,
}

impl MaskedLocalDecoder {
    pub fn new(model: CausalTransformer, opts: ForwardOptions) -> Self {
        Self { model, opts }
    }
}

impl InferenceBackend for MaskedLocalDecoder {
    fn step(
        &mut self,
        input_ids: ArrayView2<'_, u32>,
        cache: Option<StepCache>,
    ) -> Result<StepOutput> {
        let tokens = single_row(input_ids)?;
        let mut cache = match cache {
            None => self.model.new_cache(),
            Some(StepCache::Host(cache)) => cache,
            Some(StepCache::Device(_)) => bail!("local backend got a device cache"),
        };

        // Every cached position plus the new ones is attendable.
        let mask = Array1::<f32>::ones(cache.len() + tokens.len());
        let out = self
            .model
            .forward(&tokens, &mut cache, None, Some(mask.view()), self.opts)?;
        Ok(StepOutput {
            logits: logits_to_batch(out.logits),
            cache: StepCache::Host(cache),
            hidden_states: out.hidden_states,
            attentions: out.attentions,
        })
    }
}

/// Backend that drives a compiled pipeline-sharded decode-step executable.
pub struct PipeshardBackend {
    executable: Box<dyn DecodeStepExecutable>,
    params: ShardedParams,
    config: OptConfig,
    /// Decode step counter, used to derive position ids. Reset whenever the
    /// cache is re-initialized.
    step: usize,
}

impl PipeshardBackend {
    pub fn new(
        executable: Box<dyn DecodeStepExecutable>,
        params: ShardedParams,
        config: OptConfig,
    ) -> Self {
        Self {
            executable,
            params,
            config,
            step: 0,
        }
    }

    pub fn step_counter(&self) -> usize {
        self.step
    }
}

impl InferenceBackend for PipeshardBackend {
    fn step(
        &mut self,
        input_ids: ArrayView2<'_, u32>,
        cache: Option<StepCache>,
    ) -> Result<StepOutput> {
        let tokens = single_row(input_ids)?;
        ensure!(
            tokens.len() == 1,
            "the executable is compiled for single-token steps"
        );

        let cache = match cache {
            None => {
                self.step = 0;
                self.executable.init_cache()
            }
            Some(StepCache::Device(cache)) => cache,
            Some(StepCache::Host(_)) => bail!("pipeshard backend got a host cache"),
        };

        let position = (self.step + self.config.position_offset()) as u32;
        let inputs = StepInputs {
            input_ids: DeviceArray::from_u32(Array2::from_elem((1, 1), tokens[0])),
            position_ids: DeviceArray::from_u32(Array2::from_elem((1, 1), position)),
            cache,
        };

        let out = self.executable.execute(&self.params, inputs)?;
        self.step += 1;

        let hidden_states = out
            .hidden_states
            .map(|h| h.to_host_f32_2d())
            .transpose()?;
        let attentions = out
            .attentions
            .map(|all| {
                all.into_iter()
                    .map(|a| a.to_host_f32_3d())
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        Ok(StepOutput {
            logits: out.logits.to_host_f32_2d()?,
            cache: StepCache::Device(out.attention_cache),
            hidden_states,
            attentions,
        })
    }
}
