//! End-to-end generation: determinism and backend equivalence.

use optmesh_generate::{
    build_backend, BackendSpec, EngineKind, GenerateParams, GenerationConfig, GenerationOutput,
    TextGenerator,
};
use optmesh_model::{OptConfig, WordTokenizer};

const WEIGHT_SEED: u64 = 42;

fn run_generation(engine: EngineKind, prompt: &[u32], params: &GenerateParams) -> GenerationOutput {
    let spec = BackendSpec {
        seed: WEIGHT_SEED,
        ..BackendSpec::new(engine, OptConfig::tiny())
    };
    let backend = build_backend(&spec).expect("backend");
    let mut generator =
        TextGenerator::new(backend, GenerationConfig::default()).expect("generator");
    generator.generate(prompt, params).expect("generation")
}

#[test]
fn identical_seed_gives_identical_sequences() {
    let prompt = [17u32, 23, 31];
    let params = GenerateParams {
        max_length: 16,
        do_sample: true,
        seed: 8,
    };

    let a = run_generation(EngineKind::Local, &prompt, &params);
    let b = run_generation(EngineKind::Local, &prompt, &params);
    assert_eq!(a.sequences, b.sequences);

    // A different sampling seed is allowed to diverge; the prompt prefix
    // always survives.
    assert_eq!(&a.sequences[..3], &prompt);
}

#[test]
fn all_backends_agree_under_greedy_decoding() {
    let prompt = [17u32, 23, 31, 5];
    let params = GenerateParams {
        max_length: 12,
        do_sample: false,
        seed: 0,
    };

    let local = run_generation(EngineKind::Local, &prompt, &params);
    let masked = run_generation(EngineKind::MaskedLocal, &prompt, &params);
    let pipeshard = run_generation(EngineKind::Pipeshard, &prompt, &params);

    assert_eq!(local.sequences, masked.sequences);
    assert_eq!(local.sequences, pipeshard.sequences);
}

#[test]
fn berkeley_prompt_is_reproducible() {
    let config = OptConfig::tiny();
    let tokenizer = WordTokenizer::new(config.vocab_size);
    let prompt = tokenizer.encode("The University of California, Berkeley is a public");
    assert!(!prompt.is_empty());

    let params = GenerateParams {
        max_length: 20,
        do_sample: true,
        seed: 8,
    };

    let first = run_generation(EngineKind::Local, &prompt, &params);
    let second = run_generation(EngineKind::Local, &prompt, &params);

    assert_eq!(first.sequences, second.sequences);
    assert!(first.sequences.len() <= 20);
    assert!(first.sequences.len() > prompt.len());
    assert!(first.stats.tokens_per_sec > 0.0);

    // The continuation decodes without panicking (may be empty if only
    // special tokens were sampled).
    let _ = tokenizer.decode(&first.sequences);
}
