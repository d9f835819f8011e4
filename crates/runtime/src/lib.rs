//! Runtime surface for pipeline-sharded decode execution.
//!
//! Models the cluster/executable interface the benchmark drives: cluster
//! bring-up, opaque device arrays, contiguous layer-to-stage partitioning,
//! sharded parameter sets, and a decode-step executable compiled for a fixed
//! single-token shape. The engine behind the interface here is a synchronous
//! single-host reference implementation.

pub mod array;
pub mod cluster;
pub mod executable;
pub mod params;
pub mod partition;

pub use array::{DeviceArray, DeviceDtype};
pub use cluster::{Cluster, ClusterConfig};
pub use executable::{
    compile_decode_step, DecodeStepExecutable, DeviceKvCache, ExecutableOptions,
    PipeshardExecutable, StepInputs, StepOutputs,
};
pub use params::{load_sharded_params, params_aval, ShardedParams, StageParams};
pub use partition::StagePartition;
