//! Integration tests across codec, embedder, fitter and ranking:
//! embed → encode → fit → rank → reconstruct → decode, with no persistence.

use remem_core::{
    CancelFlag, CellId, FitConfig, HashEmbedder, Signal, SignalEmbedder, decode, encode,
    fit_cell, rank,
};

fn config() -> FitConfig {
    FitConfig {
        seed: Some(42),
        ..FitConfig::default()
    }
}

/// Learn one text and rebuild it from the model alone.
#[test]
fn fit_then_reconstruct() {
    let embedder = HashEmbedder::new(32);
    let context = embedder
        .embed(&Signal::from(&["greeting", "short"][..]))
        .unwrap();
    // 6 bytes → 8 base-64 chars, exact round trip
    let text = "Hello!";
    let tokens = encode(text);

    let fitted = fit_cell(&context, &tokens, &config(), &CancelFlag::new()).unwrap();
    assert!(fitted.report.actual_epochs <= 2000);
    assert_eq!(fitted.model.architecture().output_dim, tokens.len());
    assert_eq!(fitted.model.architecture().input_dim, 32);

    assert!(fitted.report.reached_target);
    let rebuilt = fitted.model.reconstruct_tokens(&context).unwrap();
    assert_eq!(rebuilt, tokens);
    assert_eq!(decode(&rebuilt).unwrap(), text);
}

/// A query sharing all words with one signal ranks that signal first.
#[test]
fn ranking_prefers_shared_words() {
    let embedder = HashEmbedder::default();
    let signals = [
        Signal::from(&["summer", "paris", "friend"][..]),
        Signal::from(&["winter", "mountains"][..]),
        Signal::Keywords(vec![]),
    ];
    let vectors: Vec<Vec<f32>> = signals
        .iter()
        .map(|s| embedder.embed(s).unwrap())
        .collect();

    let query = embedder.embed(&Signal::from("friend, Paris summer")).unwrap();
    let ranked = rank(
        &query,
        vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (CellId::new(i as u32 + 1), v.as_slice())),
    );

    assert_eq!(ranked[0].cell_id, CellId::new(1));
    assert!((ranked[0].score - 1.0).abs() < 1e-9);
    // the empty signal embeds to zeros and ranks last at exactly -1
    assert_eq!(ranked[2].cell_id, CellId::new(3));
    assert_eq!(ranked[2].score, -1.0);
}

/// Odd-length encodings lose their final character by construction.
#[test]
fn odd_length_boundary_is_preserved() {
    let tokens = encode("Hi");
    assert_eq!(tokens, vec![1158]);
    assert_eq!(decode(&tokens).unwrap(), "H");
}
