//! Attention mechanism kernels.

use crate::utils::softmax_inplace;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2};

pub fn scaled_dot_product_attention(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
    scale: f32,
) -> Result<Array2<f32>> {
    let (output, _probs) = scaled_dot_product_attention_with_probs(query, key, value, mask, scale)?;
    Ok(output)
}

/// Attention that also returns the post-softmax probabilities,
/// shape (query_len, key_len).
pub fn scaled_dot_product_attention_with_probs(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    value: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
    scale: f32,
) -> Result<(Array2<f32>, Array2<f32>)> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    let mut scores = query.dot(&key.t());
    scores *= scale;

    if let Some(mask) = mask {
        ensure!(
            mask.dim() == scores.dim(),
            "mask shape {:?} incompatible with attention scores {:?}",
            mask.dim(),
            scores.dim()
        );
        scores += &mask;
    }

    softmax_inplace(scores.view_mut());
    ensure!(
        scores.ncols() == value.nrows(),
        "scores column count {} differs from value rows {}",
        scores.ncols(),
        value.nrows()
    );
    let output = scores.dot(&value);
    Ok((output, scores))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Axis};

    #[test]
    fn attention_probs_are_row_stochastic() {
        let q = Array2::from_shape_fn((3, 4), |(i, j)| (i + j) as f32 * 0.2);
        let k = Array2::from_shape_fn((5, 4), |(i, j)| (i * j) as f32 * 0.1);
        let v = Array2::from_shape_fn((5, 4), |(i, j)| (i + 2 * j) as f32 * 0.05);

        let (out, probs) =
            scaled_dot_product_attention_with_probs(q.view(), k.view(), v.view(), None, 0.5)
                .expect("attention");

        assert_eq!(out.dim(), (3, 4));
        assert_eq!(probs.dim(), (3, 5));
        for row in probs.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn masked_positions_get_zero_weight() {
        let q = Array2::from_elem((1, 2), 1.0f32);
        let k = Array2::from_elem((3, 2), 1.0f32);
        let v = Array2::from_shape_fn((3, 2), |(i, _)| i as f32);
        let mut mask = Array2::zeros((1, 3));
        mask[(0, 2)] = f32::NEG_INFINITY;

        let (_, probs) = scaled_dot_product_attention_with_probs(
            q.view(),
            k.view(),
            v.view(),
            Some(mask.view()),
            1.0,
        )
        .expect("attention");

        assert_abs_diff_eq!(probs[(0, 2)], 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(probs[(0, 0)], 0.5, epsilon = 1e-5);
    }
}
