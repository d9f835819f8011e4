//! CLI wiring for the optmesh benchmark harness.

use crate::tsv::write_tsv;
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use optmesh_generate::{
    build_backend, BackendSpec, EngineKind, GenerateParams, GenerationConfig, TextGenerator,
};
use optmesh_model::{OptConfig, WordTokenizer};
use optmesh_runtime::ClusterConfig;
use optmesh_train::{opt_spec, run_train_benchmark, TrainBenchOptions};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "optmesh", about = "optmesh inference and training benchmarks")]
pub struct Cli {
    #[arg(long, value_enum, default_value = "cpu")]
    pub device: DeviceArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DeviceArg {
    Cpu,
    CpuParallel,
}

impl DeviceArg {
    fn kernel_name(&self) -> &'static str {
        match self {
            DeviceArg::Cpu => "reference",
            DeviceArg::CpuParallel => "parallel",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DeviceArg::Cpu => "cpu",
            DeviceArg::CpuParallel => "cpu-parallel",
        }
    }
}

/// Model backend, picked explicitly rather than inferred from a name string.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ModelArg {
    /// In-process decoder without attention-mask reconstruction.
    GptLocal,
    /// In-process decoder that rebuilds the attention mask every step.
    OptLocal,
    /// Pipeline-sharded decode-step executable.
    OptPipeshard,
}

impl ModelArg {
    fn engine(&self) -> EngineKind {
        match self {
            ModelArg::GptLocal => EngineKind::Local,
            ModelArg::OptLocal => EngineKind::MaskedLocal,
            ModelArg::OptPipeshard => EngineKind::Pipeshard,
        }
    }

    fn label(&self, size: &str) -> String {
        let base = match self {
            ModelArg::GptLocal => "gpt-local",
            ModelArg::OptLocal => "opt-local",
            ModelArg::OptPipeshard => "opt-pipeshard",
        };
        format!("{base}-{size}")
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate continuations for benchmark prompts and report speed.
    Generate {
        #[arg(long, value_enum, default_value = "opt-pipeshard")]
        model: ModelArg,
        #[arg(long, default_value = "tiny")]
        size: String,
        /// Fill parameters with seeded dummy values instead of loading.
        #[arg(long, default_value_t = false)]
        dummy: bool,
        #[arg(long)]
        weights: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        max_length: usize,
        #[arg(long, default_value_t = 8)]
        seed: u64,
        /// Disable sampling and decode greedily.
        #[arg(long, default_value_t = false)]
        greedy: bool,
        /// Prompt(s) to continue; may be repeated. Defaults to the built-in
        /// benchmark prompts.
        #[arg(long)]
        prompt: Vec<String>,
        #[arg(long, default_value = "results.tsv")]
        output: PathBuf,
        #[arg(long, default_value_t = 1)]
        num_hosts: usize,
        #[arg(long, default_value_t = 1)]
        devices_per_host: usize,
    },
    /// Time repeated training steps and derive throughput metrics.
    TrainBench {
        #[arg(long, default_value = "tiny")]
        spec: String,
        #[arg(long, default_value_t = 5)]
        niter: usize,
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
        #[arg(long)]
        seq_len: Option<usize>,
        /// Build a shape-only state: report static metrics, skip execution.
        #[arg(long, default_value_t = false)]
        shape_only: bool,
        /// Write the full report as JSON.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

const DEFAULT_PROMPTS: &[&str] = &[
    "Computer science is the study of computation and",
    "Ion Stoica is a Romanian-American computer scientist specializing in",
    "The University of California, Berkeley is a public",
];

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli { device, command } = cli;

    match command {
        Command::Generate {
            model,
            size,
            dummy,
            weights,
            max_length,
            seed,
            greedy,
            prompt,
            output,
            num_hosts,
            devices_per_host,
        } => {
            let config = OptConfig::from_size_name(&size)?;
            let tokenizer = WordTokenizer::new(config.vocab_size);
            let model_label = model.label(&size);

            let spec = BackendSpec {
                weights,
                dummy,
                matmul_kernel: device.kernel_name().to_string(),
                cluster: ClusterConfig {
                    num_hosts,
                    devices_per_host,
                },
                ..BackendSpec::new(model.engine(), config)
            };

            info!(model = %model_label, device = device.label(), dummy, "loading model");
            let tic = Instant::now();
            let backend = build_backend(&spec)?;
            let load_time = tic.elapsed().as_secs_f64();

            let mut generator = TextGenerator::new(backend, GenerationConfig::default())?;
            let params = GenerateParams {
                max_length,
                do_sample: !greedy,
                seed,
            };

            let prompts: Vec<String> = if prompt.is_empty() {
                DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect()
            } else {
                prompt
            };

            let mut speed = 0.0f64;
            for text in &prompts {
                let input_ids = tokenizer.encode(text);
                let generated = generator.generate(&input_ids, &params)?;
                let generated_string = tokenizer.decode(&generated.sequences);
                speed = generated.stats.tokens_per_sec;
                println!("{generated_string:?}, speed: {speed:.2} token/s");
            }

            let heads = ["Model", "Device", "Dummy", "Load (s)", "Speed (token/s)"];
            let values = vec![
                model_label,
                device.label().to_string(),
                dummy.to_string(),
                format!("{load_time:.2}"),
                format!("{speed:.2}"),
            ];
            write_tsv(&heads, &values, &output)?;
        }
        Command::TrainBench {
            spec,
            niter,
            batch_size,
            seq_len,
            shape_only,
            output,
        } => {
            let spec = opt_spec(&spec)?;
            let opts = TrainBenchOptions {
                niter,
                batch_size,
                seq_len,
                shape_only,
                ..Default::default()
            };
            let report = run_train_benchmark(&spec, &opts)?;

            println!(
                "spec={}, batch_size={}, seq_len={}, params={}",
                report.spec, report.batch_size, report.seq_len, report.parameter_count
            );
            for (i, latency) in report.latencies_s.iter().enumerate() {
                println!("- iteration {}: {:.4} s (loss {:.4})", i, latency, report.losses[i]);
            }
            if let (Some(mean), Some(tflops), Some(tflops_remat)) =
                (report.mean_latency_s, report.tflops, report.tflops_with_remat)
            {
                println!(
                    "mean latency: {:.4} s, tflops: {:.4}, tflops (remat): {:.4}",
                    mean, tflops, tflops_remat
                );
            }

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                fs::write(path, json)?;
            }
        }
    }
    Ok(())
}
