//! Training batches.

use ndarray::Array2;
use optmesh_model::OptConfig;

/// One training batch. Positions with label 0 are excluded from the loss.
pub struct TrainBatch {
    pub input_ids: Array2<u32>,
    /// 1.0 = attendable, 0.0 = padding.
    pub attention_mask: Array2<f32>,
    pub position_ids: Array2<u32>,
    pub labels: Array2<u32>,
}

impl TrainBatch {
    /// All-ones benchmark batch, the same filler the throughput benchmark
    /// has always used: token and label ids of 1 with a full attention mask.
    /// Position ids are real so the embedding lookups stay in range.
    pub fn ones(config: &OptConfig, batch_size: usize, seq_len: usize) -> Self {
        let offset = config.position_offset() as u32;
        Self {
            input_ids: Array2::from_elem((batch_size, seq_len), 1),
            attention_mask: Array2::from_elem((batch_size, seq_len), 1.0),
            position_ids: Array2::from_shape_fn((batch_size, seq_len), |(_, t)| {
                offset + t as u32
            }),
            labels: Array2::from_elem((batch_size, seq_len), 1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ones_batch_shapes() {
        let config = OptConfig::tiny();
        let batch = TrainBatch::ones(&config, 4, 16);
        assert_eq!(batch.batch_size(), 4);
        assert_eq!(batch.seq_len(), 16);
        assert_eq!(batch.position_ids[(0, 0)], 2);
        assert_eq!(batch.position_ids[(3, 15)], 17);
    }
}
