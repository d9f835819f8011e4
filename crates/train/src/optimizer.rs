//! AdamW with a rank-based weight-decay mask.

use anyhow::{ensure, Result};
use ndarray::{Array, ArrayD, Dimension, Zip};
use std::collections::HashMap;

/// Weight decay applies only to tensors of rank > 1; biases and norm
/// parameters (rank 1) are excluded.
pub fn weight_decay_mask(ndim: usize) -> bool {
    ndim > 1
}

struct Moments {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
}

pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    step: i32,
    moments: HashMap<String, Moments>,
}

impl AdamW {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-4,
            step: 0,
            moments: HashMap::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Advance the step counter; call once before the per-tensor updates of
    /// a training step so bias correction sees a consistent step.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    /// Apply one AdamW update to a named parameter tensor.
    pub fn update<D: Dimension>(
        &mut self,
        name: &str,
        param: &mut Array<f32, D>,
        grad: &Array<f32, D>,
    ) -> Result<()> {
        ensure!(self.step > 0, "begin_step must be called before update");
        ensure!(
            param.shape() == grad.shape(),
            "gradient shape {:?} does not match parameter '{}' {:?}",
            grad.shape(),
            name,
            param.shape()
        );

        let (beta1, beta2) = (self.beta1, self.beta2);
        let (lr, eps) = (self.lr, self.eps);
        let bias1 = 1.0 - beta1.powi(self.step);
        let bias2 = 1.0 - beta2.powi(self.step);
        let decay = if weight_decay_mask(param.ndim()) {
            self.weight_decay
        } else {
            0.0
        };

        let entry = self.moments.entry(name.to_string()).or_insert_with(|| Moments {
            m: ArrayD::zeros(param.shape().to_vec()),
            v: ArrayD::zeros(param.shape().to_vec()),
        });

        let grad_dyn = grad.view().into_dyn();
        let mut param_dyn = param.view_mut().into_dyn();

        Zip::from(&mut entry.m)
            .and(&grad_dyn)
            .for_each(|m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        Zip::from(&mut entry.v)
            .and(&grad_dyn)
            .for_each(|v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        Zip::from(&mut param_dyn)
            .and(&entry.m)
            .and(&entry.v)
            .for_each(|p, &m, &v| {
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                let mut update = m_hat / (v_hat.sqrt() + eps);
                update += decay * *p;
                *p -= lr * update;
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    #[test]
    fn mask_excludes_rank_one_tensors() {
        assert!(!weight_decay_mask(1));
        assert!(weight_decay_mask(2));
        assert!(weight_decay_mask(3));
    }

    #[test]
    fn update_moves_against_gradient() {
        let mut opt = AdamW::new(0.1).with_weight_decay(0.0);
        let mut param = Array2::from_elem((1, 2), 1.0f32);
        let grad = Array2::from_elem((1, 2), 0.5f32);

        opt.begin_step();
        opt.update("w", &mut param, &grad).unwrap();
        assert!(param[(0, 0)] < 1.0);
    }

    #[test]
    fn decay_applies_to_matrices_but_not_vectors() {
        let mut opt = AdamW::new(0.1).with_weight_decay(0.5);
        let mut matrix = Array2::from_elem((2, 2), 1.0f32);
        let mut vector = Array1::from_elem(2, 1.0f32);
        let zero_matrix_grad = Array2::zeros((2, 2));
        let zero_vector_grad = Array1::zeros(2);

        opt.begin_step();
        opt.update("w", &mut matrix, &zero_matrix_grad).unwrap();
        opt.update("b", &mut vector, &zero_vector_grad).unwrap();

        // With zero gradients, only decoupled weight decay moves the params.
        assert!(matrix[(0, 0)] < 1.0);
        assert_abs_diff_eq!(vector[0], 1.0, epsilon = 1e-7);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut opt = AdamW::new(0.1);
        let mut param = Array2::<f32>::zeros((2, 2));
        let grad = Array2::<f32>::zeros((2, 3));
        opt.begin_step();
        assert!(opt.update("w", &mut param, &grad).is_err());
    }
}
