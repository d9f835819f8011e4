//! OPT-style decoder-only causal LM with KV-cache incremental decoding.
//!
//! This crate implements the host-side reference model:
//! - learned position embeddings offset past the padding id
//! - KV-cache for incremental decoding
//! - pre-LN decoder blocks with optional attention masking
//! - safetensors weight loading and seeded dummy weights

pub mod config;
pub mod decoder;
pub mod kv_cache;
pub mod model;
pub mod tokenizer;
pub mod weights;

pub use config::OptConfig;
pub use kv_cache::KvCache;
pub use model::{CausalTransformer, ForwardOptions, ForwardOutput};
pub use tokenizer::WordTokenizer;
pub use weights::{DecoderWeights, ModelWeights, WeightShapes};
