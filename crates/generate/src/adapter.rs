//! Incremental-decoding adapter.
//!
//! Presents a backend as a token-by-token callable. The first call carries
//! the whole prompt; because the decode-step executables are compiled for a
//! fixed single-token shape, the prompt is not forwarded in one batch but
//! unrolled into one backend invocation per position, each feeding the cache
//! produced by the previous position. Only the last position's logits and
//! cache are returned; earlier logits are discarded.

use crate::backend::{InferenceBackend, StepCache, StepOutput};
use anyhow::{ensure, Context, Result};
use ndarray::{s, ArrayView2};

pub struct IncrementalDecoder {
    backend: Box<dyn InferenceBackend>,
}

impl IncrementalDecoder {
    pub fn new(backend: Box<dyn InferenceBackend>) -> Self {
        Self { backend }
    }

    /// Process one step of generation.
    ///
    /// With no cache, `input_ids` is the full prompt (batch x prompt_len)
    /// and every position is fed to the backend individually. With a cache,
    /// `input_ids` must hold exactly the one new token (batch x 1).
    ///
    /// Backend failures propagate unmodified.
    pub fn step(
        &mut self,
        input_ids: ArrayView2<'_, u32>,
        cache: Option<StepCache>,
    ) -> Result<StepOutput> {
        let prompt_len = input_ids.ncols();
        ensure!(prompt_len > 0, "step requires at least one token");

        if let Some(cache) = cache {
            ensure!(
                prompt_len == 1,
                "incremental step takes exactly one new token, got {}",
                prompt_len
            );
            return self.backend.step(input_ids, Some(cache));
        }

        let mut carried: Option<StepCache> = None;
        let mut last: Option<StepOutput> = None;
        for i in 0..prompt_len {
            let out = self
                .backend
                .step(input_ids.slice(s![.., i..i + 1]), carried.take())?;
            if i + 1 == prompt_len {
                last = Some(out);
            } else {
                carried = Some(out.cache);
            }
        }
        last.context("prompt produced no output")
    }
}
