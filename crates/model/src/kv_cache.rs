//! KV-cache for incremental decoding.
//!
//! The first append for a sequence fills the cache with the prefix keys and
//! values; every later append extends it by the new positions. Attention for
//! a step always reads the full cached history.

use ndarray::{concatenate, Array2, Axis};

pub struct KvCache {
    /// Cached keys per layer: (current_len, hidden)
    keys: Vec<Array2<f32>>,
    /// Cached values per layer: (current_len, hidden)
    values: Vec<Array2<f32>>,
    /// Logical number of positions processed so far.
    current_len: usize,
    max_len: usize,
}

impl KvCache {
    pub fn new(n_layers: usize, max_len: usize, hidden: usize) -> Self {
        let keys = (0..n_layers)
            .map(|_| Array2::<f32>::zeros((0, hidden)))
            .collect();
        let values = (0..n_layers)
            .map(|_| Array2::<f32>::zeros((0, hidden)))
            .collect();

        Self {
            keys,
            values,
            current_len: 0,
            max_len,
        }
    }

    /// Append new keys/values for a given layer.
    /// new_k, new_v: (new_seq_len, hidden)
    pub fn append(&mut self, layer: usize, new_k: Array2<f32>, new_v: Array2<f32>) {
        let new_len = new_k.nrows();
        debug_assert_eq!(new_len, new_v.nrows());

        if self.keys[layer].nrows() == 0 {
            self.keys[layer] = new_k;
            self.values[layer] = new_v;
        } else {
            self.keys[layer] =
                concatenate(Axis(0), &[self.keys[layer].view(), new_k.view()]).unwrap();
            self.values[layer] =
                concatenate(Axis(0), &[self.values[layer].view(), new_v.view()]).unwrap();
        }

        // The logical length advances once per step, tracked on layer 0.
        if layer == 0 {
            self.current_len += new_len;
            assert!(
                self.current_len <= self.max_len,
                "exceeded max sequence length {}",
                self.max_len
            );
        }
    }

    /// Get cached K/V for a layer: (current_len, hidden) each.
    pub fn get(&self, layer: usize) -> (&Array2<f32>, &Array2<f32>) {
        (&self.keys[layer], &self.values[layer])
    }

    /// Logical number of positions the cache has seen.
    pub fn len(&self) -> usize {
        self.current_len
    }

    pub fn is_empty(&self) -> bool {
        self.current_len == 0
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    pub fn reset(&mut self) {
        self.current_len = 0;
        for layer in 0..self.keys.len() {
            let hidden = self.keys[layer].ncols();
            self.keys[layer] = Array2::zeros((0, hidden));
            self.values[layer] = Array2::zeros((0, hidden));
        }
    }

    /// Bytes per cached token: K and V per layer, f32 elements.
    pub fn bytes_per_token(&self) -> usize {
        let hidden = self.keys.first().map(|k| k.ncols()).unwrap_or(0);
        2 * self.keys.len() * hidden * 4
    }
}
