//! Incremental autoregressive generation for optmesh.
//!
//! - `GenerationConfig`: flat decoding-hyperparameter record
//! - `InferenceBackend`: single-step backends (local, masked-local,
//!   pipeline-sharded executable) selected once via `EngineKind`
//! - `IncrementalDecoder`: adapter that unrolls the prompt into
//!   single-token backend calls and threads the opaque cache
//! - `TextGenerator`: the outer sampling loop

pub mod adapter;
pub mod backend;
pub mod config;
pub mod sampler;

pub use adapter::IncrementalDecoder;
pub use backend::{
    build_backend, BackendSpec, EngineKind, InferenceBackend, LocalDecoder, MaskedLocalDecoder,
    PipeshardBackend, StepCache, StepOutput,
};
pub use config::GenerationConfig;
pub use sampler::{
    FinishReason, GenerateParams, GenerationOutput, GenerationStats, TextGenerator,
};
