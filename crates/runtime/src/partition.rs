//! Layer-to-stage assignment for pipeline execution.

use anyhow::{ensure, Result};
use std::ops::Range;

/// Contiguous split of the decoder stack across pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePartition {
    ranges: Vec<Range<usize>>,
}

impl StagePartition {
    /// Split `n_layers` into `n_stages` contiguous ranges whose sizes differ
    /// by at most one, earlier stages taking the remainder.
    pub fn contiguous(n_layers: usize, n_stages: usize) -> Result<Self> {
        ensure!(n_stages > 0, "need at least one stage");
        ensure!(
            n_layers >= n_stages,
            "cannot split {} layers across {} stages",
            n_layers,
            n_stages
        );

        let base = n_layers / n_stages;
        let remainder = n_layers % n_stages;
        let mut ranges = Vec::with_capacity(n_stages);
        let mut start = 0;
        for stage in 0..n_stages {
            let len = base + usize::from(stage < remainder);
            ranges.push(start..start + len);
            start += len;
        }
        Ok(Self { ranges })
    }

    pub fn num_stages(&self) -> usize {
        self.ranges.len()
    }

    pub fn stage_layers(&self, stage: usize) -> Range<usize> {
        self.ranges[stage].clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<usize>> {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_all_layers_exactly() {
        for (layers, stages) in [(12, 2), (12, 4), (13, 4), (24, 5), (2, 2)] {
            let partition = StagePartition::contiguous(layers, stages).unwrap();
            assert_eq!(partition.num_stages(), stages);

            let mut next = 0;
            for range in partition.iter() {
                assert_eq!(range.start, next, "ranges must be contiguous");
                next = range.end;
            }
            assert_eq!(next, layers);

            let sizes: Vec<usize> = partition.iter().map(|r| r.len()).collect();
            let min = *sizes.iter().min().unwrap();
            let max = *sizes.iter().max().unwrap();
            assert!(max - min <= 1, "stage sizes must differ by at most one");
        }
    }

    #[test]
    fn too_many_stages_rejected() {
        assert!(StagePartition::contiguous(2, 3).is_err());
    }
}
