//! Round-trip of the safetensors weight loader.

use ndarray::{Array1, Array2};
use optmesh_model::{ModelWeights, OptConfig};
use safetensors::tensor::TensorView;
use safetensors::Dtype;

fn micro_config() -> OptConfig {
    OptConfig {
        vocab_size: 16,
        hidden_size: 8,
        n_layers: 2,
        n_heads: 2,
        d_ff: 16,
        max_seq_len: 8,
        pad: 1,
    }
}

fn le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn push_2d(out: &mut Vec<(String, Vec<usize>, Vec<u8>)>, name: &str, a: &Array2<f32>) {
    let (r, c) = a.dim();
    out.push((
        name.to_string(),
        vec![r, c],
        le_bytes(a.as_slice().expect("contiguous")),
    ));
}

fn push_1d(out: &mut Vec<(String, Vec<usize>, Vec<u8>)>, name: &str, a: &Array1<f32>) {
    out.push((
        name.to_string(),
        vec![a.len()],
        le_bytes(a.as_slice().expect("contiguous")),
    ));
}

#[test]
fn dummy_weights_survive_a_save_load_cycle() {
    let config = micro_config();
    let weights = ModelWeights::dummy(&config, 5);

    let mut raw: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    push_2d(&mut raw, "token_embeddings", &weights.token_embeddings);
    push_2d(&mut raw, "position_embeddings", &weights.position_embeddings);
    for (i, layer) in weights.layers.iter().enumerate() {
        let p = |part: &str| format!("layers.{i}.{part}");
        push_2d(&mut raw, &p("q_proj"), &layer.q_proj);
        push_2d(&mut raw, &p("k_proj"), &layer.k_proj);
        push_2d(&mut raw, &p("v_proj"), &layer.v_proj);
        push_2d(&mut raw, &p("out_proj"), &layer.out_proj);
        push_1d(&mut raw, &p("ln1.weight"), &layer.ln1_weight);
        push_1d(&mut raw, &p("ln1.bias"), &layer.ln1_bias);
        push_2d(&mut raw, &p("mlp_up"), &layer.mlp_up);
        push_2d(&mut raw, &p("mlp_down"), &layer.mlp_down);
        push_1d(&mut raw, &p("ln2.weight"), &layer.ln2_weight);
        push_1d(&mut raw, &p("ln2.bias"), &layer.ln2_bias);
    }
    push_1d(&mut raw, "final_ln.weight", &weights.final_ln_weight);
    push_1d(&mut raw, "final_ln.bias", &weights.final_ln_bias);
    push_2d(&mut raw, "lm_head", &weights.lm_head);

    let views: Vec<(String, TensorView<'_>)> = raw
        .iter()
        .map(|(name, shape, bytes)| {
            let view = TensorView::new(Dtype::F32, shape.clone(), bytes).expect("tensor view");
            (name.clone(), view)
        })
        .collect();
    let blob = safetensors::serialize(views, &None).expect("serialize");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    std::fs::write(&path, blob).unwrap();

    let loaded = ModelWeights::load_safetensors(&path, &config).expect("load");
    assert_eq!(loaded.token_embeddings, weights.token_embeddings);
    assert_eq!(loaded.layers.len(), config.n_layers);
    assert_eq!(loaded.layers[1].mlp_down, weights.layers[1].mlp_down);
    assert_eq!(loaded.final_ln_bias, weights.final_ln_bias);

    // A missing tensor is a hard error, not a silent default.
    let bad = OptConfig {
        n_layers: 3,
        ..config
    };
    assert!(ModelWeights::load_safetensors(&path, &bad).is_err());
}
