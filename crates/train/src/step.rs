//! The gradient-descent training step: forward, masked cross-entropy,
//! manual backward, and the AdamW parameter update.

use crate::batch::TrainBatch;
use crate::grads::WeightGrads;
use crate::optimizer::AdamW;
use anyhow::{ensure, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use optmesh_kernels::utils::{gelu, gelu_grad};
use optmesh_model::{ModelWeights, OptConfig};

const LN_EPSILON: f32 = 1e-5;
const PADDING_MASK_BIAS: f32 = -1e9;

pub struct TrainState {
    pub config: OptConfig,
    pub weights: ModelWeights,
    pub optimizer: AdamW,
}

impl TrainState {
    /// Materialize a train state with seeded dummy parameters.
    pub fn new(config: OptConfig, learning_rate: f32, seed: u64) -> Self {
        let weights = ModelWeights::dummy(&config, seed);
        Self {
            config,
            weights,
            optimizer: AdamW::new(learning_rate),
        }
    }
}

/// Run one training step over the batch and update the parameters in place.
/// Returns the masked cross-entropy loss before the update.
pub fn train_step(state: &mut TrainState, batch: &TrainBatch) -> Result<f32> {
    let (loss, grads) = batch_gradients(&state.config, &state.weights, batch)?;
    apply_updates(&mut state.optimizer, &mut state.weights, &grads)?;
    Ok(loss)
}

/// Forward-only loss over the batch; used by the gradient checks.
pub fn batch_loss(config: &OptConfig, weights: &ModelWeights, batch: &TrainBatch) -> Result<f32> {
    let mut loss_sum = 0.0f64;
    let mut total_valid = 0usize;
    for item in 0..batch.batch_size() {
        let (_, logits) = forward_item(config, weights, batch, item)?;
        let probs = softmax_rows(&logits);
        accumulate_loss(&probs, batch, item, &mut loss_sum, &mut total_valid);
    }
    ensure!(total_valid > 0, "batch has no valid label positions");
    Ok((loss_sum / total_valid as f64) as f32)
}

/// Forward + backward over the batch. Returns the loss and the summed
/// gradients of the loss with respect to every parameter.
pub fn batch_gradients(
    config: &OptConfig,
    weights: &ModelWeights,
    batch: &TrainBatch,
) -> Result<(f32, WeightGrads)> {
    let batch_size = batch.batch_size();
    ensure!(batch_size > 0, "empty batch");
    ensure!(
        batch.seq_len() <= config.max_seq_len,
        "sequence length {} exceeds model maximum {}",
        batch.seq_len(),
        config.max_seq_len
    );

    // Forward pass for every item, keeping activations for backward.
    let mut caches = Vec::with_capacity(batch_size);
    let mut all_probs = Vec::with_capacity(batch_size);
    let mut loss_sum = 0.0f64;
    let mut total_valid = 0usize;

    for item in 0..batch_size {
        let (cache, logits) = forward_item(config, weights, batch, item)?;
        let probs = softmax_rows(&logits);
        accumulate_loss(&probs, batch, item, &mut loss_sum, &mut total_valid);
        caches.push(cache);
        all_probs.push(probs);
    }
    ensure!(total_valid > 0, "batch has no valid label positions");
    let loss = (loss_sum / total_valid as f64) as f32;

    // Backward pass: d(loss)/d(logits) for the masked mean cross-entropy is
    // (softmax - onehot) / total_valid on valid positions, zero elsewhere.
    let mut grads = WeightGrads::zeros(config);
    let scale = 1.0 / total_valid as f32;
    for (item, (cache, mut dlogits)) in caches.into_iter().zip(all_probs).enumerate() {
        for i in 0..batch.seq_len() {
            let label = batch.labels[(item, i)];
            if label > 0 {
                dlogits[(i, label as usize)] -= 1.0;
                dlogits.row_mut(i).mapv_inplace(|x| x * scale);
            } else {
                dlogits.row_mut(i).fill(0.0);
            }
        }
        backward_item(config, weights, &cache, &dlogits, &mut grads)?;
    }

    Ok((loss, grads))
}

/// Push the accumulated gradients through the optimizer.
pub fn apply_updates(
    optimizer: &mut AdamW,
    weights: &mut ModelWeights,
    grads: &WeightGrads,
) -> Result<()> {
    optimizer.begin_step();
    optimizer.update(
        "token_embeddings",
        &mut weights.token_embeddings,
        &grads.token_embeddings,
    )?;
    optimizer.update(
        "position_embeddings",
        &mut weights.position_embeddings,
        &grads.position_embeddings,
    )?;
    for (idx, (layer, grad)) in weights.layers.iter_mut().zip(&grads.layers).enumerate() {
        let name = |part: &str| format!("layers.{idx}.{part}");
        optimizer.update(&name("q_proj"), &mut layer.q_proj, &grad.q_proj)?;
        optimizer.update(&name("k_proj"), &mut layer.k_proj, &grad.k_proj)?;
        optimizer.update(&name("v_proj"), &mut layer.v_proj, &grad.v_proj)?;
        optimizer.update(&name("out_proj"), &mut layer.out_proj, &grad.out_proj)?;
        optimizer.update(&name("ln1.weight"), &mut layer.ln1_weight, &grad.ln1_weight)?;
        optimizer.update(&name("ln1.bias"), &mut layer.ln1_bias, &grad.ln1_bias)?;
        optimizer.update(&name("mlp_up"), &mut layer.mlp_up, &grad.mlp_up)?;
        optimizer.update(&name("mlp_down"), &mut layer.mlp_down, &grad.mlp_down)?;
        optimizer.update(&name("ln2.weight"), &mut layer.ln2_weight, &grad.ln2_weight)?;
        optimizer.update(&name("ln2.bias"), &mut layer.ln2_bias, &grad.ln2_bias)?;
    }
    optimizer.update(
        "final_ln.weight",
        &mut weights.final_ln_weight,
        &grads.final_ln_weight,
    )?;
    optimizer.update(
        "final_ln.bias",
        &mut weights.final_ln_bias,
        &grads.final_ln_bias,
    )?;
    optimizer.update("lm_head", &mut weights.lm_head, &grads.lm_head)?;
    Ok(())
}

struct LayerCache {
    x_in: Array2<f32>,
    n1: Array2<f32>,
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    /// Post-softmax attention probabilities, (n_heads, seq, seq).
    probs: Array3<f32>,
    ctx: Array2<f32>,
    x_mid: Array2<f32>,
    n2: Array2<f32>,
    h_pre: Array2<f32>,
    h_act: Array2<f32>,
}

struct ItemCache {
    tokens: Vec<u32>,
    positions: Vec<usize>,
    layers: Vec<LayerCache>,
    x_final: Array2<f32>,
    normed: Array2<f32>,
}

fn forward_item(
    config: &OptConfig,
    weights: &ModelWeights,
    batch: &TrainBatch,
    item: usize,
) -> Result<(ItemCache, Array2<f32>)> {
    let seq = batch.seq_len();
    let hidden = config.hidden_size;
    let n_heads = config.n_heads;
    let head_dim = config.head_dim();
    let scale = 1.0 / (head_dim as f32).sqrt();

    let tokens: Vec<u32> = batch.input_ids.row(item).to_vec();
    let positions: Vec<usize> = batch
        .position_ids
        .row(item)
        .iter()
        .map(|&p| p as usize)
        .collect();

    // Token + position embeddings
    let mut x = Array2::<f32>::zeros((seq, hidden));
    for i in 0..seq {
        let token = tokens[i] as usize;
        ensure!(token < config.vocab_size, "token id {} out of vocabulary", token);
        ensure!(
            positions[i] < config.position_table_len(),
            "position id {} beyond embedding table",
            positions[i]
        );
        let mut row = x.row_mut(i);
        row.assign(&weights.token_embeddings.row(token));
        row += &weights.position_embeddings.row(positions[i]);
    }

    // Additive attention bias: causal plus padding.
    let attn_row = batch.attention_mask.row(item);
    let mut bias = Array2::<f32>::zeros((seq, seq));
    for i in 0..seq {
        for j in 0..seq {
            if j > i {
                bias[(i, j)] = f32::NEG_INFINITY;
            } else if attn_row[j] == 0.0 {
                bias[(i, j)] = PADDING_MASK_BIAS;
            }
        }
    }

    let mut layers = Vec::with_capacity(config.n_layers);
    for lw in &weights.layers {
        let x_in = x;
        let n1 = ln_forward(&x_in, &lw.ln1_weight, &lw.ln1_bias);

        let q = n1.dot(&lw.q_proj);
        let k = n1.dot(&lw.k_proj);
        let v = n1.dot(&lw.v_proj);

        let mut probs = Array3::<f32>::zeros((n_heads, seq, seq));
        let mut ctx = Array2::<f32>::zeros((seq, hidden));
        for h in 0..n_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            let q_h = q.slice(s![.., cols.clone()]);
            let k_h = k.slice(s![.., cols.clone()]);
            let v_h = v.slice(s![.., cols.clone()]);

            let mut scores = q_h.dot(&k_h.t());
            scores *= scale;
            scores += &bias;
            softmax_rows_inplace(&mut scores);

            ctx.slice_mut(s![.., cols]).assign(&scores.dot(&v_h));
            probs.slice_mut(s![h, .., ..]).assign(&scores);
        }

        let attn_out = ctx.dot(&lw.out_proj);
        let x_mid = &x_in + &attn_out;

        let n2 = ln_forward(&x_mid, &lw.ln2_weight, &lw.ln2_bias);
        let h_pre = n2.dot(&lw.mlp_up);
        let h_act = h_pre.mapv(gelu);
        let mlp_out = h_act.dot(&lw.mlp_down);
        x = &x_mid + &mlp_out;

        layers.push(LayerCache {
            x_in,
            n1,
            q,
            k,
            v,
            probs,
            ctx,
            x_mid,
            n2,
            h_pre,
            h_act,
        });
    }

    let x_final = x;
    let normed = ln_forward(&x_final, &weights.final_ln_weight, &weights.final_ln_bias);
    let logits = normed.dot(&weights.lm_head);

    Ok((
        ItemCache {
            tokens,
            positions,
            layers,
            x_final,
            normed,
        },
        logits,
    ))
}

fn backward_item(
    config: &OptConfig,
    weights: &ModelWeights,
    cache: &ItemCache,
    dlogits: &Array2<f32>,
    grads: &mut WeightGrads,
) -> Result<()> {
    let seq = cache.tokens.len();
    let hidden = config.hidden_size;
    let n_heads = config.n_heads;
    let head_dim = config.head_dim();
    let scale = 1.0 / (head_dim as f32).sqrt();

    // LM head
    grads.lm_head += &cache.normed.t().dot(dlogits);
    let dnormed = dlogits.dot(&weights.lm_head.t());

    // Final layernorm
    let (mut dx, dgamma, dbeta) = layer_norm_backward(
        &cache.x_final,
        weights.final_ln_weight.view(),
        &dnormed,
        LN_EPSILON,
    );
    grads.final_ln_weight += &dgamma;
    grads.final_ln_bias += &dbeta;

    for (layer_idx, (lw, lc)) in weights.layers.iter().zip(&cache.layers).enumerate().rev() {
        let lg = &mut grads.layers[layer_idx];

        // MLP branch: x_next = x_mid + gelu(n2 @ W_up) @ W_down
        let dmlp_out = &dx;
        lg.mlp_down += &lc.h_act.t().dot(dmlp_out);
        let dh_act = dmlp_out.dot(&lw.mlp_down.t());
        let dh_pre = &dh_act * &lc.h_pre.mapv(gelu_grad);
        lg.mlp_up += &lc.n2.t().dot(&dh_pre);
        let dn2 = dh_pre.dot(&lw.mlp_up.t());

        let (dx_mid_ln, dg2, db2) =
            layer_norm_backward(&lc.x_mid, lw.ln2_weight.view(), &dn2, LN_EPSILON);
        lg.ln2_weight += &dg2;
        lg.ln2_bias += &db2;
        let dx_mid = &dx + &dx_mid_ln;

        // Attention branch: x_mid = x_in + (heads(n1) concat) @ W_o
        let dattn_out = &dx_mid;
        lg.out_proj += &lc.ctx.t().dot(dattn_out);
        let dctx = dattn_out.dot(&lw.out_proj.t());

        let mut dq = Array2::<f32>::zeros((seq, hidden));
        let mut dk = Array2::<f32>::zeros((seq, hidden));
        let mut dv = Array2::<f32>::zeros((seq, hidden));
        for h in 0..n_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            let dctx_h = dctx.slice(s![.., cols.clone()]);
            let probs_h = lc.probs.index_axis(Axis(0), h);
            let q_h = lc.q.slice(s![.., cols.clone()]);
            let k_h = lc.k.slice(s![.., cols.clone()]);
            let v_h = lc.v.slice(s![.., cols.clone()]);

            let dprobs = dctx_h.dot(&v_h.t());
            dv.slice_mut(s![.., cols.clone()])
                .assign(&probs_h.t().dot(&dctx_h));

            // Softmax backward, row by row. Masked entries have zero
            // probability, so their score gradient vanishes with them.
            let mut dscores = Array2::<f32>::zeros((seq, seq));
            for i in 0..seq {
                let p_row = probs_h.row(i);
                let dp_row = dprobs.row(i);
                let inner = p_row.dot(&dp_row);
                for j in 0..seq {
                    dscores[(i, j)] = p_row[j] * (dp_row[j] - inner);
                }
            }
            dscores *= scale;

            dq.slice_mut(s![.., cols.clone()]).assign(&dscores.dot(&k_h));
            dk.slice_mut(s![.., cols]).assign(&dscores.t().dot(&q_h));
        }

        lg.q_proj += &lc.n1.t().dot(&dq);
        lg.k_proj += &lc.n1.t().dot(&dk);
        lg.v_proj += &lc.n1.t().dot(&dv);
        let dn1 = dq.dot(&lw.q_proj.t()) + dk.dot(&lw.k_proj.t()) + dv.dot(&lw.v_proj.t());

        let (dx_in_ln, dg1, db1) =
            layer_norm_backward(&lc.x_in, lw.ln1_weight.view(), &dn1, LN_EPSILON);
        lg.ln1_weight += &dg1;
        lg.ln1_bias += &db1;
        dx = &dx_mid + &dx_in_ln;
    }

    // Embedding scatter
    for i in 0..seq {
        let mut tok_row = grads.token_embeddings.row_mut(cache.tokens[i] as usize);
        tok_row += &dx.row(i);
        let mut pos_row = grads.position_embeddings.row_mut(cache.positions[i]);
        pos_row += &dx.row(i);
    }

    Ok(())
}

fn ln_forward(x: &Array2<f32>, gamma: &Array1<f32>, beta: &Array1<f32>) -> Array2<f32> {
    let n = x.ncols() as f32;
    let mut out = x.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let mean = row.sum() / n;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + LN_EPSILON).sqrt();
        for (j, v) in row.iter_mut().enumerate() {
            *v = (*v - mean) * inv_std * gamma[j] + beta[j];
        }
    }
    out
}

/// Backward pass of layer norm. Returns (dx, dgamma, dbeta).
fn layer_norm_backward(
    x: &Array2<f32>,
    gamma: ArrayView1<'_, f32>,
    d_out: &Array2<f32>,
    eps: f32,
) -> (Array2<f32>, Array1<f32>, Array1<f32>) {
    let (rows, cols) = x.dim();
    let n = cols as f32;
    let mut dx = Array2::<f32>::zeros((rows, cols));
    let mut dgamma = Array1::<f32>::zeros(cols);
    let mut dbeta = Array1::<f32>::zeros(cols);

    for i in 0..rows {
        let row = x.row(i);
        let dout = d_out.row(i);

        let mean = row.sum() / n;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + eps).sqrt();

        let mut m1 = 0.0f32; // mean of dxhat
        let mut m2 = 0.0f32; // mean of dxhat * xhat
        for j in 0..cols {
            let xhat = (row[j] - mean) * inv_std;
            let dxhat = dout[j] * gamma[j];
            dgamma[j] += dout[j] * xhat;
            dbeta[j] += dout[j];
            m1 += dxhat;
            m2 += dxhat * xhat;
        }
        m1 /= n;
        m2 /= n;

        for j in 0..cols {
            let xhat = (row[j] - mean) * inv_std;
            let dxhat = dout[j] * gamma[j];
            dx[(i, j)] = inv_std * (dxhat - m1 - xhat * m2);
        }
    }

    (dx, dgamma, dbeta)
}

fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    softmax_rows_inplace(&mut out);
    out
}

fn softmax_rows_inplace(data: &mut Array2<f32>) {
    for mut row in data.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum.max(f32::EPSILON));
    }
}

fn accumulate_loss(
    probs: &Array2<f32>,
    batch: &TrainBatch,
    item: usize,
    loss_sum: &mut f64,
    total_valid: &mut usize,
) {
    for i in 0..batch.seq_len() {
        let label = batch.labels[(item, i)];
        if label > 0 {
            let p = probs[(i, label as usize)].max(f32::MIN_POSITIVE);
            *loss_sum += -(p.ln() as f64);
            *total_valid += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn layer_norm_backward_matches_finite_difference() {
        let x = Array2::from_shape_fn((3, 6), |(i, j)| (i as f32 * 0.7 - j as f32 * 0.3).sin());
        let gamma = Array1::from_shape_fn(6, |j| 1.0 + 0.1 * j as f32);
        let beta = Array1::from_shape_fn(6, |j| 0.05 * j as f32);
        // Loss = weighted sum of outputs so d_out is just the weights.
        let d_out = Array2::from_shape_fn((3, 6), |(i, j)| ((i + 2 * j) as f32 * 0.13).cos());

        let loss = |x: &Array2<f32>| -> f32 {
            let y = ln_forward(x, &gamma, &beta);
            (&y * &d_out).sum()
        };

        let (dx, dgamma, dbeta) = layer_norm_backward(&x, gamma.view(), &d_out, LN_EPSILON);

        let h = 1e-3f32;
        for &(i, j) in &[(0usize, 0usize), (1, 3), (2, 5)] {
            let mut xp = x.clone();
            xp[(i, j)] += h;
            let mut xm = x.clone();
            xm[(i, j)] -= h;
            let numeric = (loss(&xp) - loss(&xm)) / (2.0 * h);
            assert_relative_eq!(dx[(i, j)], numeric, epsilon = 1e-3, max_relative = 0.02);
        }

        // dbeta is exactly the column sums of d_out.
        for j in 0..6 {
            let col_sum: f32 = d_out.column(j).sum();
            assert_relative_eq!(dbeta[j], col_sum, epsilon = 1e-5);
        }
        assert_eq!(dgamma.len(), 6);
    }

    #[test]
    fn softmax_cross_entropy_gradient_shape() {
        let logits = Array2::from_shape_fn((2, 5), |(i, j)| (i * j) as f32 * 0.4);
        let probs = softmax_rows(&logits);
        for row in probs.axis_iter(Axis(0)) {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
    }
}
