use super::*;
use crate::embeddings::{EmbeddingConfig, FallbackEmbedder};
use crate::store::Record;
use proptest::prelude::*;
use serde_json::json;

const DIMENSION: usize = 64;
const NOW: u64 = 1_700_000_000_000;
const HOUR_MS: u64 = 3_600_000;

fn reranker(config: RerankConfig) -> Reranker {
    let embeddings = Arc::new(EmbeddingService::fallback_only(
        DIMENSION,
        EmbeddingConfig::default(),
    ));
    Reranker::new(embeddings, config)
}

fn candidate(id: &str, text: &str, timestamp: u64, importance: Option<f64>) -> RetrievalCandidate {
    let mut metadata = Metadata::new();
    if let Some(importance) = importance {
        metadata.insert("importance".to_string(), json!(importance));
    }
    let record = Record::new(id, FallbackEmbedder::new(DIMENSION).embed(text), text)
        .with_metadata(metadata)
        .with_timestamp(timestamp);
    RetrievalCandidate {
        record,
        semantic_score: 0.8,
        lexical_score: 0.4,
        retrieval_score: 0.68,
    }
}

fn ids(outcome: &RerankOutcome) -> Vec<&str> {
    outcome.results.iter().map(|r| r.id.as_str()).collect()
}

#[tokio::test]
async fn best_match_ranks_first_and_output_is_sorted() {
    let reranker = reranker(RerankConfig::default());
    let candidates = vec![
        candidate("bread", "the bread recipe needs flour", NOW, None),
        candidate("panic", "slow breathing helps during a panic attack", NOW, None),
        candidate("garden", "watering the garden in summer", NOW, None),
    ];

    let outcome = reranker
        .rerank_at("breathing during a panic attack", candidates, &[], NOW)
        .await;

    assert!(!outcome.used_fallback);
    assert_eq!(outcome.results[0].id, "panic");
    for pair in outcome.results.windows(2) {
        assert!(pair[0].final_score >= pair[1].final_score);
    }
    let top = &outcome.results[0];
    assert_eq!(top.content, "slow breathing helps during a panic attack");
    assert!(top.feature_scores.lexical > 0.9);
}

#[tokio::test]
async fn newer_records_rank_higher() {
    let reranker = reranker(RerankConfig::default());
    let candidates = vec![
        candidate("old", "journaling before bed", NOW - 48 * HOUR_MS, None),
        candidate("new", "journaling before bed", NOW, None),
    ];

    let outcome = reranker.rerank_at("journaling", candidates, &[], NOW).await;

    assert_eq!(ids(&outcome), vec!["new", "old"]);
    assert!((outcome.results[0].feature_scores.recency - 1.0).abs() < 1e-6);
    assert!((outcome.results[1].feature_scores.recency - 0.25).abs() < 1e-6);
}

#[tokio::test]
async fn future_timestamps_count_as_fresh() {
    let reranker = reranker(RerankConfig::default());
    let outcome = reranker
        .rerank_at(
            "journaling",
            vec![candidate("future", "journaling", NOW + HOUR_MS, None)],
            &[],
            NOW,
        )
        .await;
    assert!((outcome.results[0].feature_scores.recency - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn importance_prior_breaks_otherwise_equal_candidates() {
    let reranker = reranker(RerankConfig::default());
    let candidates = vec![
        candidate("minor", "grounding with five senses", NOW, Some(0.0)),
        candidate("default", "grounding with five senses", NOW, None),
        candidate("key", "grounding with five senses", NOW, Some(1.0)),
    ];

    let outcome = reranker
        .rerank_at("grounding senses", candidates, &[], NOW)
        .await;

    assert_eq!(ids(&outcome), vec!["key", "default", "minor"]);
    assert_eq!(outcome.results[1].feature_scores.importance, 0.5);
}

#[tokio::test]
async fn ties_keep_candidate_order() {
    let reranker = reranker(RerankConfig::default());
    let candidates = vec![
        candidate("first", "same text", NOW, None),
        candidate("second", "same text", NOW, None),
        candidate("third", "same text", NOW, None),
    ];

    let outcome = reranker.rerank_at("same text", candidates, &[], NOW).await;
    assert_eq!(ids(&outcome), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn threshold_and_top_k_apply() {
    let reranker = reranker(RerankConfig {
        top_k: 2,
        ..RerankConfig::default()
    });
    let candidates = (0..4)
        .map(|i| candidate(&format!("c{}", i), "mindful walking outdoors", NOW, None))
        .collect();
    let outcome = reranker
        .rerank_at("mindful walking", candidates, &[], NOW)
        .await;
    assert_eq!(outcome.results.len(), 2);

    let strict = reranker_with_threshold(1.5);
    let outcome = strict
        .rerank_at(
            "mindful walking",
            vec![candidate("c", "mindful walking outdoors", NOW, None)],
            &[],
            NOW,
        )
        .await;
    assert!(outcome.results.is_empty());
    assert!(!outcome.used_fallback);
}

fn reranker_with_threshold(score_threshold: f32) -> Reranker {
    reranker(RerankConfig {
        score_threshold,
        ..RerankConfig::default()
    })
}

#[tokio::test]
async fn passed_deadline_falls_back_to_importance_order() {
    let reranker = reranker(RerankConfig {
        timeout_ms: 0,
        score_threshold: 1.5,
        top_k: 2,
        ..RerankConfig::default()
    });
    let candidates = vec![
        candidate("low", "anything", NOW, Some(0.1)),
        candidate("high", "anything", NOW, Some(0.9)),
        candidate("mid", "anything", NOW, None),
    ];

    let outcome = reranker.rerank_at("anything", candidates, &[], NOW).await;

    assert!(outcome.used_fallback);
    assert_eq!(ids(&outcome), vec!["high", "mid"]);
    assert!((outcome.results[0].final_score - 0.9).abs() < 1e-6);
    assert_eq!(outcome.results[0].feature_scores.semantic, 0.8);
}

#[tokio::test]
async fn empty_candidates() {
    let outcome = reranker(RerankConfig::default())
        .rerank("query", Vec::new(), &[])
        .await;
    assert!(outcome.results.is_empty());
    assert!(!outcome.used_fallback);
}

#[tokio::test]
async fn recent_queries_boost_matching_candidates() {
    let reranker = reranker(RerankConfig::default());
    let text = "progressive muscle relaxation before sleep";
    let context = vec![text.to_string()];

    let boosted = reranker
        .rerank_at(
            "relaxation",
            vec![candidate("pmr", text, NOW, None)],
            &context,
            NOW,
        )
        .await;
    let plain = reranker
        .rerank_at("relaxation", vec![candidate("pmr", text, NOW, None)], &[], NOW)
        .await;

    let boosted = &boosted.results[0];
    let plain = &plain.results[0];
    assert!(boosted.feature_scores.contextual > 0.6);
    assert_eq!(plain.feature_scores.contextual, 0.0);
    let expected = plain.final_score * (1.0 + 0.2 * boosted.feature_scores.contextual);
    assert!((boosted.final_score - expected).abs() < 1e-5);
}

#[test]
fn lexical_overlap_favors_rare_long_terms() {
    let candidates = vec![
        candidate("a", "insomnia remedies", NOW, None),
        candidate("b", "tea tea", NOW, None),
        candidate("c", "tea time", NOW, None),
        candidate("d", "nothing relevant", NOW, None),
    ];
    let scorer = LexicalScorer::new("insomnia tea", &candidates);

    assert!(scorer.score(0) > scorer.score(1));
    assert_eq!(scorer.score(1), scorer.score(2));
    assert_eq!(scorer.score(3), 0.0);
    assert!((scorer.score(0) + scorer.score(1) - 1.0).abs() < 1e-5);
}

#[test]
fn final_score_boost_only_above_threshold() {
    let reranker = reranker(RerankConfig::default());
    let features = FeatureScores {
        semantic: 1.0,
        lexical: 1.0,
        recency: 1.0,
        importance: 1.0,
        contextual: 0.6,
    };
    assert!((reranker.final_score(&features) - 1.0).abs() < 1e-6);

    let boosted = FeatureScores {
        contextual: 1.0,
        ..features
    };
    assert!((reranker.final_score(&boosted) - 1.2).abs() < 1e-6);
}

proptest! {
    #[test]
    fn rerank_output_is_sorted_and_bounded(
        entries in proptest::collection::vec(
            ("[a-z ]{1,30}", 0_u64..200, proptest::option::of(0.0_f64..1.0)),
            0..12,
        ),
        top_k in 1_usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime should build");
        let reranker = reranker(RerankConfig { top_k, ..RerankConfig::default() });
        let candidates: Vec<RetrievalCandidate> = entries
            .iter()
            .enumerate()
            .map(|(i, (text, hours, importance))| {
                candidate(&format!("c{}", i), text, NOW - hours * HOUR_MS, *importance)
            })
            .collect();
        let count = candidates.len();

        let outcome = runtime.block_on(reranker.rerank_at("calm breathing", candidates, &[], NOW));

        prop_assert!(!outcome.used_fallback);
        prop_assert!(outcome.results.len() <= top_k.min(count));
        for pair in outcome.results.windows(2) {
            prop_assert!(pair[0].final_score >= pair[1].final_score);
        }
        for result in &outcome.results {
            prop_assert!(result.final_score >= 0.1);
        }
    }
}
