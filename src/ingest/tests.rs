use super::*;
use crate::RecallError;
use crate::embeddings::EmbeddingConfig;

const DIMENSION: usize = 32;

fn ingestor(store: &Arc<VectorStore>) -> Ingestor {
    let embeddings = Arc::new(EmbeddingService::fallback_only(
        DIMENSION,
        EmbeddingConfig::default(),
    ));
    Ingestor::new(Arc::clone(store), embeddings, ChunkingConfig::default(), "knowledge")
        .with_batch_size(4)
}

fn long_text() -> String {
    (0..40)
        .map(|i| format!("Tip {} explains a grounding technique for hard moments.", i))
        .collect::<Vec<_>>()
        .join(" ")
}

#[tokio::test]
async fn ingest_chunks_embeds_and_stores() {
    let store = Arc::new(VectorStore::new());
    let ingestor = ingestor(&store);
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), json!("tips.md"));

    let report = ingestor
        .ingest(&long_text(), metadata)
        .await
        .expect("ingest should succeed");

    assert_eq!(report.collection, "knowledge");
    assert!(report.chunk_count > 1);
    assert_eq!(report.record_ids.len(), report.chunk_count);
    assert_eq!(store.stats().expect("stats").records_in("knowledge"), report.chunk_count);
    assert_eq!(
        store.dimension("knowledge").expect("dimension"),
        Some(DIMENSION)
    );

    for (index, id) in report.record_ids.iter().enumerate() {
        let record = store
            .get("knowledge", id)
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.vector.len(), DIMENSION);
        assert_eq!(record.metadata["source"], "tips.md");
        assert_eq!(record.metadata["chunk_index"], json!(index));
        assert_eq!(record.metadata["total_chunks"], json!(report.chunk_count));
    }
}

#[tokio::test]
async fn empty_text_stores_nothing() {
    let store = Arc::new(VectorStore::new());
    let report = ingestor(&store)
        .ingest("   \n\n  ", Metadata::new())
        .await
        .expect("ingest should succeed");

    assert_eq!(report.chunk_count, 0);
    assert!(report.record_ids.is_empty());
    assert!(store.collection_names().expect("names").is_empty());
}

#[tokio::test]
async fn ingest_into_named_collection() {
    let store = Arc::new(VectorStore::new());
    let report = ingestor(&store)
        .ingest_into("journal", "Walking outside helped today.", Metadata::new())
        .await
        .expect("ingest should succeed");

    assert_eq!(report.collection, "journal");
    assert_eq!(report.chunk_count, 1);
    assert_eq!(store.stats().expect("stats").records_in("knowledge"), 0);
    assert_eq!(store.stats().expect("stats").records_in("journal"), 1);
}

#[tokio::test]
async fn dimension_conflict_is_reported() {
    let store = Arc::new(VectorStore::new());
    store
        .create_collection("knowledge", DIMENSION * 2)
        .expect("collection should be created");

    let error = ingestor(&store)
        .ingest("Short note about rest.", Metadata::new())
        .await
        .expect_err("dimension conflict should fail");
    assert!(matches!(error, RecallError::DimensionMismatch { .. }));
}
