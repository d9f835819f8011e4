//! Derived throughput metrics for GPT-family training.

/// Model FLOPs per second, in teraflops, for one training step.
///
/// Uses the standard 72x factor (forward + backward over the 12 H^2
/// matmuls per layer, attention, and the LM head); activation
/// recomputation adds another forward pass, giving 96x.
#[allow(clippy::too_many_arguments)]
pub fn gpt_tflops(
    batch_size: usize,
    seq_len: usize,
    num_layers: usize,
    hidden_size: usize,
    vocab_size: usize,
    num_devices: usize,
    latency_s: f64,
    checkpoint_activations: bool,
) -> f64 {
    let factor = if checkpoint_activations { 96.0 } else { 72.0 };
    let b = batch_size as f64;
    let s = seq_len as f64;
    let l = num_layers as f64;
    let h = hidden_size as f64;
    let v = vocab_size as f64;

    let total_flop =
        factor * b * s * l * h * h * (1.0 + s / (6.0 * h) + v / (16.0 * l * h));
    total_flop / latency_s / num_devices as f64 / 1e12
}

/// Estimated parameter count of a GPT stack with biases and a tied-free
/// LM head, per layer: QKV + output projection, 4x MLP, and layer norms.
pub fn gpt_parameter_count(num_layers: usize, hidden_size: usize, vocab_size: usize) -> u64 {
    let h = hidden_size as u64;
    let v = vocab_size as u64;
    let l = num_layers as u64;
    l * (
        // self-attention: QKV projections + output projection
        h * (3 * h + 1) + h * (h + 1)
        // mlp: up and down projections
        + h * (4 * h + 1) + h * 4 * (h + 1)
        // two layer norms
        + h * 4
    ) + v * (h + 1)
}
