//! Shared helpers for kernel implementations.

use crate::config::ActivationKind;
use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

pub fn apply_bias_activation(
    mut output: Array2<f32>,
    bias: Option<&ArrayView2<'_, f32>>,
    activation: ActivationKind,
) -> Result<Array2<f32>> {
    if let Some(bias) = bias {
        if bias.shape() != output.shape() {
            bail!(
                "bias shape {:?} incompatible with output {:?}",
                bias.shape(),
                output.shape()
            );
        }
        output += bias;
    }

    match activation {
        ActivationKind::None => Ok(output),
        ActivationKind::Relu => {
            output.mapv_inplace(|x| x.max(0.0));
            Ok(output)
        }
        ActivationKind::Gelu => {
            output.mapv_inplace(gelu);
            Ok(output)
        }
    }
}

pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            row -= max;
            row.mapv_inplace(|x| x.exp());
            let sum = row.sum();
            row /= sum.max(f32::EPSILON);
        });
}

/// Approximate GELU (tanh formulation).
pub fn gelu(x: f32) -> f32 {
    let c = (2.0 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (c * (x + 0.044715 * x.powi(3))).tanh())
}

/// Derivative of the tanh-approximated GELU with respect to its input.
pub fn gelu_grad(x: f32) -> f32 {
    let c = (2.0 / std::f32::consts::PI).sqrt();
    let u = c * (x + 0.044715 * x.powi(3));
    let t = u.tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * c * (1.0 + 3.0 * 0.044715 * x.powi(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut scores = Array2::from_shape_fn((3, 5), |(i, j)| (i * j) as f32 * 0.3 - 0.5);
        softmax_inplace(scores.view_mut());
        for row in scores.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn gelu_grad_matches_finite_difference() {
        let h = 1e-3f32;
        for &x in &[-2.5f32, -0.7, 0.0, 0.3, 1.9] {
            let numeric = (gelu(x + h) - gelu(x - h)) / (2.0 * h);
            assert_abs_diff_eq!(gelu_grad(x), numeric, epsilon = 1e-3);
        }
    }
}
