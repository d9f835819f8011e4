//! Benchmark suite: OPT model shapes.

use anyhow::{bail, Result};
use optmesh_model::OptConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSpec {
    pub name: String,
    pub seq_len: usize,
    pub hidden_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub vocab_size: usize,
}

impl TrainSpec {
    pub fn new(
        name: &str,
        seq_len: usize,
        hidden_size: usize,
        n_layers: usize,
        n_heads: usize,
        vocab_size: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            seq_len,
            hidden_size,
            n_layers,
            n_heads,
            vocab_size,
        }
    }

    pub fn to_model_config(&self) -> OptConfig {
        OptConfig {
            vocab_size: self.vocab_size,
            hidden_size: self.hidden_size,
            n_layers: self.n_layers,
            n_heads: self.n_heads,
            d_ff: self.hidden_size * 4,
            max_seq_len: self.seq_len,
            pad: 1,
        }
    }
}

/// Named model shapes for the training benchmark.
pub fn opt_spec(name: &str) -> Result<TrainSpec> {
    let spec = match name.to_ascii_lowercase().as_str() {
        "tiny" => TrainSpec::new("tiny", 64, 64, 2, 4, 512),
        "125m" => TrainSpec::new("125M", 1024, 768, 12, 12, 50272),
        "350m" => TrainSpec::new("350M", 1024, 1024, 24, 16, 50272),
        "1.3b" => TrainSpec::new("1.3B", 1024, 2048, 24, 32, 50272),
        other => bail!("unknown benchmark spec: {other}"),
    };
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_resolve() {
        assert_eq!(opt_spec("125M").unwrap().hidden_size, 768);
        assert_eq!(opt_spec("350m").unwrap().n_layers, 24);
        assert!(opt_spec("6.7B").is_err());
    }

    #[test]
    fn model_config_uses_4x_ff() {
        let config = opt_spec("tiny").unwrap().to_model_config();
        assert_eq!(config.d_ff, config.hidden_size * 4);
    }
}
