//! Matrix multiplication kernels.

use crate::config::{ActivationKind, MatmulProblem};
use crate::utils::{apply_bias_activation, validate_matmul_inputs};
use anyhow::Result;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::sync::Arc;

pub struct MatmulInputs<'a> {
    pub lhs: ArrayView2<'a, f32>,
    pub rhs: ArrayView2<'a, f32>,
    pub bias: Option<ArrayView2<'a, f32>>,
    pub activation: ActivationKind,
}

impl<'a> MatmulInputs<'a> {
    pub fn new(
        lhs: ArrayView2<'a, f32>,
        rhs: ArrayView2<'a, f32>,
        bias: Option<ArrayView2<'a, f32>>,
        activation: ActivationKind,
    ) -> Self {
        Self {
            lhs,
            rhs,
            bias,
            activation,
        }
    }
}

pub trait MatmulKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports(&self, problem: &MatmulProblem) -> bool;
    fn run(&self, problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>>;
}

pub type DynMatmulKernel = Arc<dyn MatmulKernel>;

#[derive(Default)]
pub struct ReferenceMatmul;

impl ReferenceMatmul {
    pub fn new() -> Self {
        Self
    }
}

impl MatmulKernel for ReferenceMatmul {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn supports(&self, _problem: &MatmulProblem) -> bool {
        true
    }

    fn run(&self, _problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>> {
        validate_matmul_inputs(&inputs.lhs, &inputs.rhs)?;

        let result = inputs.lhs.dot(&inputs.rhs);
        let result = apply_bias_activation(result, inputs.bias.as_ref(), inputs.activation)?;
        Ok(result)
    }
}

pub struct ParallelMatmul;

impl ParallelMatmul {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ParallelMatmul {
    fn default() -> Self {
        Self::new()
    }
}

impl MatmulKernel for ParallelMatmul {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn supports(&self, _problem: &MatmulProblem) -> bool {
        true
    }

    fn run(&self, problem: &MatmulProblem, inputs: &MatmulInputs<'_>) -> Result<Array2<f32>> {
        validate_matmul_inputs(&inputs.lhs, &inputs.rhs)?;

        let lhs = inputs.lhs;
        let rhs = inputs.rhs;
        let mut output = Array2::<f32>::zeros((problem.m, problem.n));

        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row_idx, mut row)| {
                let lhs_row = lhs.row(row_idx);
                for (col_idx, value) in row.iter_mut().enumerate() {
                    let rhs_col = rhs.column(col_idx);
                    *value = lhs_row.dot(&rhs_col);
                }
            });

        let output = apply_bias_activation(output, inputs.bias.as_ref(), inputs.activation)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn parallel_matmul_matches_reference() {
        let problem = MatmulProblem::new(32, 24, 16);
        let lhs = Array2::from_shape_fn((problem.m, problem.k), |(i, j)| (i + j) as f32 * 0.1);
        let rhs = Array2::from_shape_fn((problem.k, problem.n), |(i, j)| (i * j + 1) as f32 * 0.05);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), None, ActivationKind::None);

        let reference = ReferenceMatmul::new()
            .run(&problem, &inputs)
            .expect("reference matmul");
        let parallel = ParallelMatmul::new()
            .run(&problem, &inputs)
            .expect("parallel matmul");

        for i in 0..problem.m {
            for j in 0..problem.n {
                assert_abs_diff_eq!(reference[(i, j)], parallel[(i, j)], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn gelu_activation_applied() {
        let problem = MatmulProblem::new(2, 2, 2);
        let lhs = Array2::from_elem((2, 2), -1.0f32);
        let rhs = Array2::from_elem((2, 2), 1.0f32);
        let inputs = MatmulInputs::new(lhs.view(), rhs.view(), None, ActivationKind::Gelu);

        let out = ReferenceMatmul::new().run(&problem, &inputs).unwrap();
        // gelu(-2) is small but nonzero and negative
        assert!(out[(0, 0)] < 0.0 && out[(0, 0)] > -0.1);
    }
}
