//! Training-step benchmark for the OPT decoder family.
//!
//! Builds a model state, an AdamW optimizer whose weight decay skips rank-1
//! parameters, and a gradient-descent step (forward, masked cross-entropy
//! over valid label positions, manual backward, update), then times repeated
//! steps and derives teraflops and parameter-count figures.

pub mod batch;
pub mod benchmark;
pub mod grads;
pub mod metrics;
pub mod optimizer;
pub mod step;
pub mod suite;

pub use batch::TrainBatch;
pub use benchmark::{run_train_benchmark, TrainBenchOptions, TrainBenchReport};
pub use grads::WeightGrads;
pub use metrics::{gpt_parameter_count, gpt_tflops};
pub use optimizer::{weight_decay_mask, AdamW};
pub use step::{apply_updates, batch_gradients, batch_loss, train_step, TrainState};
pub use suite::{opt_spec, TrainSpec};
