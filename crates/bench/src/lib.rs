//! Library surface of the benchmark harness: CLI wiring and TSV reporting.

pub mod cli;
pub mod tsv;
