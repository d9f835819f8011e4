//! Benchmark harness executable for optmesh.

use anyhow::Result;
use clap::Parser;
use optmesh_bench::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
