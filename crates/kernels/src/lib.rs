//! Kernel primitives for optmesh.
//!
//! Reference and rayon-parallel matmul kernels behind a common trait,
//! plus layer norm, softmax, GELU, and scaled-dot-product attention used
//! by both the inference decoder and the training step.

pub mod attention;
pub mod config;
pub mod layernorm;
pub mod matmul;
pub mod registry;
pub mod utils;

pub use attention::*;
pub use config::*;
pub use layernorm::*;
pub use matmul::*;
pub use registry::*;
pub use utils::*;
