//! Model configuration for the OPT decoder family.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub max_seq_len: usize,
    /// Padding token id. Learned position embeddings are offset past it.
    pub pad: u32,
}

impl OptConfig {
    /// OPT-125M shape.
    pub fn opt_125m() -> Self {
        Self {
            vocab_size: 50272,
            hidden_size: 768,
            n_layers: 12,
            n_heads: 12,
            d_ff: 3072,
            max_seq_len: 2048,
            pad: 1,
        }
    }

    /// OPT-350M shape.
    pub fn opt_350m() -> Self {
        Self {
            vocab_size: 50272,
            hidden_size: 1024,
            n_layers: 24,
            n_heads: 16,
            d_ff: 4096,
            max_seq_len: 2048,
            pad: 1,
        }
    }

    /// Tiny test config for quick iteration.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 512,
            hidden_size: 64,
            n_layers: 2,
            n_heads: 4,
            d_ff: 256,
            max_seq_len: 256,
            pad: 1,
        }
    }

    pub fn from_size_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tiny" => Ok(Self::tiny()),
            "125m" => Ok(Self::opt_125m()),
            "350m" => Ok(Self::opt_350m()),
            other => bail!("unknown model size: {other}"),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads
    }

    /// First valid position id: positions start right after the padding id.
    pub fn position_offset(&self) -> usize {
        self.pad as usize + 1
    }

    /// Rows in the learned position embedding table.
    pub fn position_table_len(&self) -> usize {
        self.max_seq_len + self.position_offset()
    }
}
