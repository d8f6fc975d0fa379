use super::*;
use crate::store::cosine_similarity;
use proptest::prelude::*;

fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

#[test]
fn produces_configured_dimension() {
    let embedder = FallbackEmbedder::new(384);
    assert_eq!(embedder.embed("hello world").len(), 384);
    assert_eq!(embedder.dimension(), 384);
}

#[test]
fn zero_dimension_is_clamped() {
    let embedder = FallbackEmbedder::new(0);
    assert_eq!(embedder.embed("anything").len(), 1);
}

#[test]
fn empty_text_still_has_unit_length() {
    let embedder = FallbackEmbedder::new(64);
    let empty = embedder.embed("");
    assert!((norm(&empty) - 1.0).abs() < 1e-5);
    assert_eq!(empty, embedder.embed("   ?! "));
}

#[test]
fn different_texts_differ() {
    let embedder = FallbackEmbedder::new(256);
    assert_ne!(
        embedder.embed("grief after losing a parent"),
        embedder.embed("trouble sleeping before exams")
    );
}

#[test]
fn related_texts_score_higher_than_unrelated() {
    let embedder = FallbackEmbedder::new(384);
    let query = embedder.embed("I feel anxious about work deadlines");
    let related = embedder.embed("anxious about work and deadlines");
    let unrelated = embedder.embed("the bread recipe needs more flour");

    let related_score = cosine_similarity(&query, &related);
    let unrelated_score = cosine_similarity(&query, &unrelated);
    assert!(
        related_score > unrelated_score,
        "related {} should beat unrelated {}",
        related_score,
        unrelated_score
    );
    assert!(related_score > 0.5);
}

#[test]
fn case_and_punctuation_do_not_matter() {
    let embedder = FallbackEmbedder::new(128);
    assert_eq!(
        embedder.embed("Feeling LONELY tonight!"),
        embedder.embed("feeling lonely tonight")
    );
}

proptest! {
    #[test]
    fn fallback_is_deterministic(input in ".{0,200}", dimension in 1_usize..512) {
        let first = FallbackEmbedder::new(dimension).embed(&input);
        let second = FallbackEmbedder::new(dimension).embed(&input);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn fallback_has_unit_length(input in "[a-zA-Z ]{0,120}") {
        let vector = FallbackEmbedder::new(96).embed(&input);
        prop_assert!((norm(&vector) - 1.0).abs() < 1e-4);
    }
}
