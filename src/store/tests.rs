use super::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn record(id: &str, vector: Vec<f32>, text: &str) -> Record {
    Record::new(id, vector, text).with_timestamp(1_700_000_000_000)
}

fn small_index_config() -> IndexConfig {
    IndexConfig {
        min_records: 100,
        rebuild_threshold: 8,
        ef_search: 256,
        ..IndexConfig::default()
    }
}

/// Deterministic pseudo-random unit vectors without pulling in an RNG crate.
fn spread_vector(seed: u64, dimension: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
    let mut vector = Vec::with_capacity(dimension);
    for _ in 0..dimension {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        vector.push(((state >> 33) as f32 / (u32::MAX >> 1) as f32).mul_add(2.0, -1.0));
    }
    similarity::l2_normalize(&mut vector);
    vector
}

#[test]
fn cosine_of_vector_with_itself_is_one() {
    let v = vec![0.3, -1.2, 4.5, 0.0];
    assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
}

#[test]
fn cosine_of_tiny_vector_with_itself_is_one() {
    let v = vec![1e-9_f32; 4];
    assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);

    let subnormal = vec![f32::MIN_POSITIVE / 4.0, 0.0, f32::MIN_POSITIVE / 4.0];
    assert!((cosine_similarity(&subnormal, &subnormal) - 1.0).abs() < 1e-6);
}

#[test]
fn cosine_with_zero_vector_is_zero() {
    let v = vec![0.3, -1.2, 4.5];
    let zero = vec![0.0; 3];
    assert_eq!(cosine_similarity(&v, &zero), 0.0);
    assert_eq!(cosine_similarity(&zero, &zero), 0.0);
}

#[test]
fn cosine_of_opposite_vectors_is_minus_one() {
    let v = vec![1.0, 2.0, 3.0];
    let w: Vec<f32> = v.iter().map(|x| -x).collect();
    assert!((cosine_similarity(&v, &w) + 1.0).abs() < 1e-6);
}

proptest! {
    #[test]
    fn cosine_is_bounded(
        a in prop::collection::vec(-1000.0f32..1000.0, 8),
        b in prop::collection::vec(-1000.0f32..1000.0, 8),
    ) {
        let s = cosine_similarity(&a, &b);
        prop_assert!((-1.0..=1.0).contains(&s), "similarity {} out of bounds", s);
    }

    #[test]
    fn cosine_self_similarity_is_one_for_nonzero(
        a in prop::collection::vec(0.01f32..100.0, 1..32),
        exponent in -30i32..6,
    ) {
        let scale = 10f32.powi(exponent);
        let a: Vec<f32> = a.iter().map(|x| x * scale).collect();
        prop_assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_inserts_never_change_the_collection(
        dimension in 1usize..16,
        wrong in 1usize..16,
    ) {
        prop_assume!(dimension != wrong);
        let store = VectorStore::new();
        store.create_collection("c", dimension).expect("create collection");
        store
            .insert("c", record("ok", vec![1.0; dimension], "fits"))
            .expect("insert matching vector");

        let result = store.insert("c", record("bad", vec![1.0; wrong], "does not fit"));
        let is_dimension_mismatch = matches!(result, Err(RecallError::DimensionMismatch { .. }));
        prop_assert!(is_dimension_mismatch);
        let stats = store.stats().expect("stats");
        prop_assert_eq!(stats.records_in("c"), 1);
    }
}

#[test]
fn insert_rejects_dimension_mismatch() {
    let store = VectorStore::new();
    store.create_collection("docs", 3).expect("create");
    store
        .insert("docs", record("a", vec![1.0, 0.0, 0.0], "alpha"))
        .expect("insert");

    let err = store
        .insert("docs", record("b", vec![1.0, 0.0], "bravo"))
        .expect_err("mismatched vector should be rejected");

    match err {
        RecallError::DimensionMismatch {
            collection,
            expected,
            actual,
        } => {
            assert_eq!(collection, "docs");
            assert_eq!(expected, 3);
            assert_eq!(actual, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.stats().expect("stats").records_in("docs"), 1);
}

#[test]
fn insert_creates_collection_lazily() {
    let store = VectorStore::new();
    store
        .insert("lazy", record("a", vec![0.5, 0.5], "text"))
        .expect("insert");

    assert_eq!(store.dimension("lazy").expect("dimension"), Some(2));
    assert_eq!(store.collection_names().expect("names"), vec!["lazy"]);
}

#[test]
fn create_collection_with_conflicting_dimension_fails() {
    let store = VectorStore::new();
    store.create_collection("c", 4).expect("create");
    assert!(store.create_collection("c", 4).is_ok());
    assert!(matches!(
        store.create_collection("c", 8),
        Err(RecallError::DimensionMismatch { .. })
    ));
    assert!(store.create_collection("zero", 0).is_err());
}

#[test]
fn duplicate_ids_are_rejected() {
    let store = VectorStore::new();
    store
        .insert("c", record("a", vec![1.0, 0.0], "first"))
        .expect("insert");
    let result = store.insert("c", record("a", vec![0.0, 1.0], "second"));
    assert!(matches!(result, Err(RecallError::DuplicateRecord { .. })));

    let stored = store.get("c", "a").expect("get").expect("record exists");
    assert_eq!(stored.text, "first");
}

#[test]
fn update_replaces_in_place() {
    let store = VectorStore::new();
    store
        .insert("c", record("a", vec![1.0, 0.0], "first"))
        .expect("insert");
    store
        .insert("c", record("b", vec![1.0, 0.0], "second"))
        .expect("insert");

    store
        .update("c", record("a", vec![1.0, 0.0], "first, revised"))
        .expect("update");

    // Equal scores: the updated record keeps its original insertion position.
    let hits = store.search("c", &[1.0, 0.0], 10, 0.0).expect("search");
    assert_eq!(hits[0].record.id, "a");
    assert_eq!(hits[0].record.text, "first, revised");

    let missing = store.update("c", record("zzz", vec![1.0, 0.0], "nope"));
    assert!(matches!(missing, Err(RecallError::RecordNotFound { .. })));
}

#[test]
fn delete_removes_records() {
    let store = VectorStore::new();
    store
        .insert("c", record("a", vec![1.0, 0.0], "first"))
        .expect("insert");

    assert!(store.delete("c", "a").expect("delete"));
    assert!(!store.delete("c", "a").expect("delete again"));
    assert!(!store.delete("missing", "a").expect("delete from missing"));
    assert_eq!(store.get("c", "a").expect("get"), None);
}

#[test]
fn search_orders_by_similarity_then_insertion() {
    let store = VectorStore::new();
    store
        .insert("c", record("far", vec![0.0, 1.0], "far"))
        .expect("insert");
    store
        .insert("c", record("tie-1", vec![1.0, 1.0], "tie one"))
        .expect("insert");
    store
        .insert("c", record("exact", vec![1.0, 0.0], "exact"))
        .expect("insert");
    store
        .insert("c", record("tie-2", vec![2.0, 2.0], "tie two"))
        .expect("insert");

    let hits = store.search("c", &[1.0, 0.0], 10, 0.0).expect("search");
    let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
    assert_eq!(ids, vec!["exact", "tie-1", "tie-2", "far"]);
}

#[test]
fn search_applies_threshold_and_limit() {
    let store = VectorStore::new();
    store
        .insert("c", record("a", vec![1.0, 0.0], "a"))
        .expect("insert");
    store
        .insert("c", record("b", vec![0.9, 0.1], "b"))
        .expect("insert");
    store
        .insert("c", record("c", vec![0.0, 1.0], "c"))
        .expect("insert");

    let hits = store.search("c", &[1.0, 0.0], 10, 0.5).expect("search");
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.score >= 0.5));

    let limited = store.search("c", &[1.0, 0.0], 1, 0.0).expect("search");
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].record.id, "a");
}

#[test]
fn search_missing_collection_is_empty() {
    let store = VectorStore::new();
    let hits = store.search("nothing", &[1.0], 5, 0.0).expect("search");
    assert!(hits.is_empty());
}

#[test]
fn search_rejects_wrong_query_dimension() {
    let store = VectorStore::new();
    store
        .insert("c", record("a", vec![1.0, 0.0], "a"))
        .expect("insert");
    assert!(matches!(
        store.search("c", &[1.0, 0.0, 0.0], 5, 0.0),
        Err(RecallError::DimensionMismatch { .. })
    ));
}

#[test]
fn keyword_search_scores_matched_fraction() {
    let store = VectorStore::new();
    store
        .insert("c", record("a", vec![1.0], "Breathing exercises help with Anxiety"))
        .expect("insert");
    store
        .insert("c", record("b", vec![1.0], "Sleep hygiene tips"))
        .expect("insert");
    store
        .insert("c", record("c", vec![1.0], "Anxiety and sleep are linked"))
        .expect("insert");

    let terms = vec![
        "anxiety".to_string(),
        "SLEEP".to_string(),
        "anxiety".to_string(),
    ];
    let hits = store.keyword_search("c", &terms, 10).expect("keyword search");

    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].record.id, "c");
    assert!((hits[0].score - 1.0).abs() < f32::EPSILON);
    // Equal half scores keep insertion order.
    assert_eq!(hits[1].record.id, "a");
    assert_eq!(hits[2].record.id, "b");
    assert!((hits[1].score - 0.5).abs() < f32::EPSILON);
}

#[test]
fn keyword_search_with_no_terms_is_empty() {
    let store = VectorStore::new();
    store
        .insert("c", record("a", vec![1.0], "text"))
        .expect("insert");
    let hits = store
        .keyword_search("c", &[" ".to_string()], 10)
        .expect("keyword search");
    assert!(hits.is_empty());
}

#[test]
fn stats_report_counts_per_collection() {
    let store = VectorStore::new();
    store
        .insert("a", record("1", vec![1.0], "x"))
        .expect("insert");
    store
        .insert("a", record("2", vec![1.0], "y"))
        .expect("insert");
    store
        .insert("b", record("1", vec![1.0, 1.0], "z"))
        .expect("insert");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.records_in("a"), 2);
    assert_eq!(stats.records_in("b"), 1);
    assert_eq!(stats.records_in("missing"), 0);
}

#[test]
fn small_collections_are_not_indexed() {
    let store = VectorStore::with_index_config(small_index_config());
    for i in 0..99 {
        store
            .insert("c", record(&i.to_string(), spread_vector(i, 16), "t"))
            .expect("insert");
    }
    let stats = store.stats().expect("stats");
    assert_eq!(stats.collections[0].indexed_records, 0);

    store
        .insert("c", record("99", spread_vector(99, 16), "t"))
        .expect("insert");
    let stats = store.stats().expect("stats");
    assert_eq!(stats.collections[0].indexed_records, 100);
}

#[test]
fn indexed_search_finds_exact_match_and_fresh_records() {
    let store = VectorStore::with_index_config(small_index_config());
    for i in 0..150 {
        store
            .insert("c", record(&format!("r{i}"), spread_vector(i, 32), "t"))
            .expect("insert");
    }

    let query = spread_vector(42, 32);
    let hits = store.search("c", &query, 5, 0.0).expect("search");
    assert_eq!(hits[0].record.id, "r42");
    assert!((hits[0].score - 1.0).abs() < 1e-5);

    // Written after the last rebuild, still visible through the dirty scan.
    let fresh = spread_vector(10_000, 32);
    store
        .insert("c", record("fresh", fresh.clone(), "t"))
        .expect("insert");
    let hits = store.search("c", &fresh, 1, 0.0).expect("search");
    assert_eq!(hits[0].record.id, "fresh");
}

#[test]
fn expired_deadline_falls_back_to_exact_search() {
    let store = VectorStore::with_index_config(small_index_config());
    for i in 0..120 {
        store
            .insert("c", record(&format!("r{i}"), spread_vector(i, 16), "t"))
            .expect("insert");
    }

    let query = spread_vector(7, 16);
    let expired = Instant::now()
        .checked_sub(Duration::from_millis(10))
        .unwrap_or_else(Instant::now);
    let timed_out = store
        .search_until("c", &query, 10, 0.0, Some(expired))
        .expect("search");
    let exact = store.search_exact("c", &query, 10, 0.0).expect("search");
    assert_eq!(timed_out, exact);
}

#[test]
fn deleted_records_never_surface_from_the_index() {
    let store = VectorStore::with_index_config(small_index_config());
    for i in 0..110 {
        store
            .insert("c", record(&format!("r{i}"), spread_vector(i, 16), "t"))
            .expect("insert");
    }
    store.rebuild_index("c").expect("rebuild");
    assert!(store.delete("c", "r5").expect("delete"));

    let hits = store
        .search("c", &spread_vector(5, 16), 10, 0.0)
        .expect("search");
    assert!(hits.iter().all(|h| h.record.id != "r5"));
}

#[test]
fn record_importance_is_clamped() {
    let mut metadata = Metadata::new();
    metadata.insert("importance".to_string(), serde_json::json!(3.5));
    let r = record("a", vec![1.0], "t").with_metadata(metadata);
    assert_eq!(r.importance(), Some(1.0));

    let plain = record("b", vec![1.0], "t");
    assert_eq!(plain.importance(), None);
}

#[test]
fn concurrent_writers_and_readers_see_whole_records() {
    let store = Arc::new(VectorStore::new());
    store.create_collection("c", 8).expect("create");

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    let id = format!("w{w}-{i}");
                    store
                        .insert("c", record(&id, vec![1.0; 8], &id))
                        .expect("insert");
                }
            })
        })
        .collect();

    let reader = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for _ in 0..50 {
                let hits = store.search("c", &[1.0; 8], 500, 0.0).expect("search");
                for hit in hits {
                    assert_eq!(hit.record.vector.len(), 8);
                    assert_eq!(hit.record.id, hit.record.text);
                }
            }
        })
    };

    for handle in writers {
        handle.join().expect("writer thread");
    }
    reader.join().expect("reader thread");

    assert_eq!(store.stats().expect("stats").records_in("c"), 200);
}
