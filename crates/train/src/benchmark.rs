//! Timed training benchmark loop and its report.

use crate::batch::TrainBatch;
use crate::metrics::{gpt_parameter_count, gpt_tflops};
use crate::step::{train_step, TrainState};
use crate::suite::TrainSpec;
use anyhow::{ensure, Result};
use optmesh_model::ModelWeights;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone)]
pub struct TrainBenchOptions {
    pub niter: usize,
    pub batch_size: usize,
    /// Override the suite's sequence length.
    pub seq_len: Option<usize>,
    /// Build a shape-only state: report static metrics, skip execution.
    pub shape_only: bool,
    pub learning_rate: f32,
    pub seed: u64,
}

impl Default for TrainBenchOptions {
    fn default() -> Self {
        Self {
            niter: 5,
            batch_size: 4,
            seq_len: None,
            shape_only: false,
            learning_rate: 1e-2,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainBenchReport {
    pub spec: String,
    pub batch_size: usize,
    pub seq_len: usize,
    pub niter: usize,
    /// Parameter-count estimate from the model shape.
    pub parameter_count: u64,
    /// Exact count of materialized parameters, absent for shape-only runs.
    pub materialized_parameter_count: Option<usize>,
    pub parameter_bytes_f32: usize,
    pub latencies_s: Vec<f64>,
    pub mean_latency_s: Option<f64>,
    pub losses: Vec<f32>,
    pub tflops: Option<f64>,
    /// Throughput as if activations were recomputed in the backward pass.
    pub tflops_with_remat: Option<f64>,
}

/// Build a state, run `niter` timed training steps, and derive throughput.
pub fn run_train_benchmark(spec: &TrainSpec, opts: &TrainBenchOptions) -> Result<TrainBenchReport> {
    let mut config = spec.to_model_config();
    if let Some(seq_len) = opts.seq_len {
        ensure!(seq_len > 0, "sequence length must be positive");
        config.max_seq_len = seq_len;
    }
    let seq_len = config.max_seq_len;

    let shapes = ModelWeights::shapes(&config);
    let parameter_count = gpt_parameter_count(config.n_layers, config.hidden_size, config.vocab_size);

    let mut report = TrainBenchReport {
        spec: spec.name.clone(),
        batch_size: opts.batch_size,
        seq_len,
        niter: opts.niter,
        parameter_count,
        materialized_parameter_count: None,
        parameter_bytes_f32: shapes.num_bytes_f32(),
        latencies_s: Vec::new(),
        mean_latency_s: None,
        losses: Vec::new(),
        tflops: None,
        tflops_with_remat: None,
    };

    if opts.shape_only {
        // A shape-only state has nothing to execute locally; report the
        // static metrics and stop.
        info!(
            spec = %spec.name,
            params = parameter_count,
            bytes = report.parameter_bytes_f32,
            "shape-only train state; skipping the timed loop"
        );
        return Ok(report);
    }

    ensure!(opts.niter > 0, "niter must be positive");
    ensure!(opts.batch_size > 0, "batch size must be positive");

    let mut state = TrainState::new(config.clone(), opts.learning_rate, opts.seed);
    report.materialized_parameter_count = Some(state.weights.num_params());
    let batch = TrainBatch::ones(&config, opts.batch_size, seq_len);

    for iter in 0..opts.niter {
        info!(iteration = iter, "running train step");
        let tic = Instant::now();
        let loss = train_step(&mut state, &batch)?;
        let latency = tic.elapsed().as_secs_f64();
        report.latencies_s.push(latency);
        report.losses.push(loss);
    }

    let mean_latency = report.latencies_s.iter().sum::<f64>() / report.latencies_s.len() as f64;
    report.mean_latency_s = Some(mean_latency);
    report.tflops = Some(gpt_tflops(
        opts.batch_size,
        seq_len,
        config.n_layers,
        config.hidden_size,
        config.vocab_size,
        1,
        mean_latency,
        false,
    ));
    report.tflops_with_remat = Some(gpt_tflops(
        opts.batch_size,
        seq_len,
        config.n_layers,
        config.hidden_size,
        config.vocab_size,
        1,
        mean_latency,
        true,
    ));

    info!(
        spec = %spec.name,
        mean_latency_s = mean_latency,
        tflops = report.tflops,
        "train benchmark finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::opt_spec;

    #[test]
    fn shape_only_reports_static_metrics() {
        let spec = opt_spec("350M").unwrap();
        let opts = TrainBenchOptions {
            shape_only: true,
            ..Default::default()
        };
        let report = run_train_benchmark(&spec, &opts).unwrap();
        assert!(report.parameter_count > 300_000_000);
        assert!(report.latencies_s.is_empty());
        assert!(report.tflops.is_none());
        assert!(report.materialized_parameter_count.is_none());
    }

    #[test]
    fn tiny_benchmark_produces_throughput() {
        let spec = opt_spec("tiny").unwrap();
        let opts = TrainBenchOptions {
            niter: 2,
            batch_size: 2,
            seq_len: Some(8),
            ..Default::default()
        };
        let report = run_train_benchmark(&spec, &opts).unwrap();
        assert_eq!(report.latencies_s.len(), 2);
        assert!(report.tflops.unwrap() > 0.0);
        assert!(report.tflops_with_remat.unwrap() > report.tflops.unwrap());
        assert!(report.losses.iter().all(|l| l.is_finite()));

        let json = serde_json::to_string_pretty(&report).unwrap();
        assert!(json.contains("tflops"));
    }
}
