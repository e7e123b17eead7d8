use crate::chunking::{chunk_text, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::{IndexingError, Result};
use crate::models::{Document, DocumentStatus};
use crate::reindex::discard_indexed_state;
use crate::tokens::TokenCounter;
use crate::traits::{ChunkPayload, DocumentStore, TextExtractor, VectorIndex};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const EXTRACTED_PROGRESS: u8 = 20;
const CHUNKED_PROGRESS: u8 = 40;
const EMBEDDING_PROGRESS_SPAN: usize = 50;

/// Running element-wise mean of the chunk embeddings of one document.
#[derive(Debug, Default, Clone)]
pub struct MeanVector {
    sums: Vec<f64>,
    count: usize,
}

impl MeanVector {
    pub fn add(&mut self, vector: &[f32]) -> Result<()> {
        if self.count == 0 {
            self.sums = vec![0.0; vector.len()];
        } else if vector.len() != self.sums.len() {
            return Err(IndexingError::InconsistentDimension {
                expected: self.sums.len(),
                actual: vector.len(),
            });
        }

        for (sum, value) in self.sums.iter_mut().zip(vector) {
            *sum += f64::from(*value);
        }
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` until at least one vector has been added.
    pub fn finish(&self) -> Option<Vec<f32>> {
        if self.count == 0 {
            return None;
        }
        let count = self.count as f64;
        Some(self.sums.iter().map(|sum| (sum / count) as f32).collect())
    }
}

fn embedding_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return CHUNKED_PROGRESS;
    }
    let span = EMBEDDING_PROGRESS_SPAN * done.min(total) / total;
    CHUNKED_PROGRESS + span as u8
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Drives one document from `pending` (or `error`) to `ready`: extract, chunk, embed, upsert.
pub struct IndexingPipeline<S, V, E, X>
where
    S: DocumentStore + ?Sized,
    V: VectorIndex + ?Sized,
    E: Embedder + ?Sized,
    X: TextExtractor + ?Sized,
{
    store: Arc<S>,
    index: Arc<V>,
    embedder: Arc<E>,
    extractor: Arc<X>,
    chunking: ChunkingConfig,
}

impl<S, V, E, X> IndexingPipeline<S, V, E, X>
where
    S: DocumentStore + ?Sized,
    V: VectorIndex + ?Sized,
    E: Embedder + ?Sized,
    X: TextExtractor + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, index: Arc<V>, embedder: Arc<E>, extractor: Arc<X>) -> Self {
        Self {
            store,
            index,
            embedder,
            extractor,
            chunking: ChunkingConfig::default(),
        }
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Indexes the document. On failure the document is left in `error` with the message under
    /// `metadata.error`, partial chunks and points stay in place, and the error is returned.
    ///
    /// Retrying an `error` document first discards what the failed run left behind. Its last
    /// failure message moves to `metadata.previous_error`.
    pub async fn run(&self, document_id: u64) -> Result<Document> {
        let mut document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(IndexingError::NotFound(document_id))?;

        if !document.status.accepts_indexing() {
            warn!(document_id, status = %document.status, "refusing to index document");
            return Err(IndexingError::InvalidState {
                document_id,
                status: document.status.to_string(),
            });
        }

        info!(document_id, title = %document.title, "indexing started");
        match self.index_document(&mut document).await {
            Ok(()) => {
                info!(
                    document_id,
                    chunks = document.chunk_count,
                    tokens = document.token_count,
                    "indexing finished"
                );
                Ok(document)
            }
            Err(failure) => {
                error!(document_id, error = %failure, "indexing failed");
                document.status = DocumentStatus::Error;
                document
                    .metadata
                    .insert("error".to_string(), Value::String(failure.to_string()));
                if let Err(store_error) = self.store.save_document(&document).await {
                    warn!(document_id, error = %store_error, "could not record indexing failure");
                }
                Err(failure)
            }
        }
    }

    async fn index_document(&self, document: &mut Document) -> Result<()> {
        let document_id = document.id;
        let retry = document.status == DocumentStatus::Error;

        document.status = DocumentStatus::Indexing;
        document.progress = 0;
        document.embedding_model = self.embedder.model_name();
        if let Some(previous) = document.metadata.remove("error") {
            document
                .metadata
                .insert("previous_error".to_string(), previous);
        }
        self.store.save_document(document).await?;

        if retry {
            let removed =
                discard_indexed_state(self.store.as_ref(), self.index.as_ref(), document_id)
                    .await?;
            debug!(document_id, removed_chunks = removed, "discarded partial run");
        }

        let extractor = Arc::clone(&self.extractor);
        let path = document.file_path.clone();
        let text = tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|error| IndexingError::Task(error.to_string()))??;
        document.metadata.insert(
            "content_sha256".to_string(),
            Value::String(sha256_hex(&text)),
        );
        document.content_text = text;
        document.progress = EXTRACTED_PROGRESS;
        self.store.save_document(document).await?;

        let chunks = chunk_text(&document.content_text, self.chunking);
        let rows = self.store.insert_chunks(document_id, &chunks).await?;
        document.progress = CHUNKED_PROGRESS;
        self.store.save_document(document).await?;
        debug!(document_id, chunks = rows.len(), "chunks stored");

        self.index.ensure_collections().await?;

        let model = document.embedding_model.clone();
        let tokens = tokio::task::spawn_blocking(move || TokenCounter::for_model(&model))
            .await
            .map_err(|error| IndexingError::Task(error.to_string()))?;

        let total = rows.len();
        let mut mean = MeanVector::default();
        let mut token_count = 0u64;
        for (position, chunk) in rows.iter().enumerate() {
            let vector = self.embedder.embed(&chunk.text).await?;
            mean.add(&vector)?;
            token_count += tokens.count(&chunk.text);

            let payload = ChunkPayload {
                owner_id: document.owner_id,
                document_id,
                chunk_id: chunk.id,
                title: document.title.clone(),
            };
            let point_id = self
                .index
                .upsert_chunk_vector(chunk.id, &vector, &payload)
                .await?;
            self.store
                .set_chunk_vector_id(chunk.id, &point_id.to_string())
                .await?;

            document.progress = embedding_progress(position + 1, total);
            self.store.save_document(document).await?;
        }

        let mean_vector = mean
            .finish()
            .ok_or(IndexingError::EmptyDocument(document_id))?;
        self.index
            .upsert_document_vector(document_id, &document.title, &mean_vector)
            .await?;

        document.status = DocumentStatus::Ready;
        document.progress = 100;
        document.chunk_count = total as u64;
        document.token_count = token_count;
        document.last_indexed_at = Some(Utc::now());
        self.store.save_document(document).await?;

        Ok(())
    }

    /// Recomputes and upserts the mean vector from the chunk points already in the index.
    pub async fn backfill_document_vector(&self, document_id: u64) -> Result<Vec<f32>> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(IndexingError::NotFound(document_id))?;

        let vectors = self.index.scroll_vectors_for_document(document_id).await?;
        let mut mean = MeanVector::default();
        for vector in &vectors {
            mean.add(vector)?;
        }

        let mean_vector = mean
            .finish()
            .ok_or(IndexingError::EmptyDocument(document_id))?;
        self.index
            .upsert_document_vector(document_id, &document.title, &mean_vector)
            .await?;

        info!(document_id, vectors = vectors.len(), "document vector backfilled");
        Ok(mean_vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{EmbeddingError, ExtractError};
    use crate::models::NewDocument;
    use crate::stores::{MemoryStore, MemoryVectorIndex};
    use crate::traits::PayloadFilter;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIMENSIONS: usize = 32;

    struct FakeExtractor {
        text: String,
    }

    impl TextExtractor for FakeExtractor {
        fn extract(&self, path: &Path) -> std::result::Result<String, ExtractError> {
            if path.extension().is_some_and(|ext| ext == "bin") {
                return Err(ExtractError::UnsupportedFormat("bin".to_string()));
            }
            Ok(self.text.clone())
        }
    }

    /// Embeds normally until `fail_on` calls have been made.
    struct FlakyEmbedder {
        inner: CharacterNgramEmbedder,
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> String {
            "flaky".to_string()
        }

        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.fail_on {
                return Err(EmbeddingError::provider("flaky", "rate limited"));
            }
            Ok(self.inner.embed_text(text))
        }
    }

    type TestPipeline<E> = IndexingPipeline<MemoryStore, MemoryVectorIndex, E, FakeExtractor>;

    fn pipeline_with<E: Embedder>(
        text: &str,
        embedder: E,
    ) -> (Arc<MemoryStore>, Arc<MemoryVectorIndex>, TestPipeline<E>) {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryVectorIndex::new(DIMENSIONS));
        let pipeline = pipeline_on(&store, &index, text, embedder);
        (store, index, pipeline)
    }

    fn pipeline_on<E: Embedder>(
        store: &Arc<MemoryStore>,
        index: &Arc<MemoryVectorIndex>,
        text: &str,
        embedder: E,
    ) -> TestPipeline<E> {
        IndexingPipeline::new(
            Arc::clone(store),
            Arc::clone(index),
            Arc::new(embedder),
            Arc::new(FakeExtractor {
                text: text.to_string(),
            }),
        )
        .with_chunking(ChunkingConfig::new(40, 0))
    }

    fn flaky(fail_on: usize) -> FlakyEmbedder {
        FlakyEmbedder {
            inner: CharacterNgramEmbedder::new(DIMENSIONS),
            calls: AtomicUsize::new(0),
            fail_on,
        }
    }

    async fn create(store: &MemoryStore, file: &str) -> Document {
        store
            .create_document(NewDocument {
                owner_id: 9,
                title: "Pump manual".to_string(),
                file_path: PathBuf::from(file),
                metadata: Map::new(),
            })
            .await
            .expect("create document")
    }

    const MANUAL: &str = "Check the pump pressure daily. Replace worn seals promptly. \
                          Log every inspection in the book. Call support on failure.";

    #[test]
    fn mean_vector_averages_and_rejects_mixed_dimensions() {
        let mut mean = MeanVector::default();
        assert_eq!(mean.finish(), None);

        mean.add(&[1.0, 3.0]).expect("first");
        mean.add(&[3.0, 5.0]).expect("second");
        assert_eq!(mean.finish(), Some(vec![2.0, 4.0]));
        assert_eq!(mean.count(), 2);

        assert!(matches!(
            mean.add(&[1.0]),
            Err(IndexingError::InconsistentDimension { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn embedding_progress_stays_within_band() {
        assert_eq!(embedding_progress(0, 4), 40);
        assert_eq!(embedding_progress(1, 4), 52);
        assert_eq!(embedding_progress(4, 4), 90);
        assert_eq!(embedding_progress(0, 0), 40);
    }

    #[tokio::test]
    async fn run_indexes_document_to_ready() {
        let (store, index, pipeline) = pipeline_with(MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        let document = create(&store, "manual.txt").await;

        let indexed = pipeline.run(document.id).await.expect("pipeline run");

        assert_eq!(indexed.status, DocumentStatus::Ready);
        assert_eq!(indexed.progress, 100);
        assert_eq!(indexed.content_text, MANUAL);
        assert_eq!(indexed.embedding_model, format!("hashed:{DIMENSIONS}"));
        assert!(indexed.chunk_count >= 2);
        assert!(indexed.token_count > 0);
        assert!(indexed.last_indexed_at.is_some());
        assert!(indexed.metadata.contains_key("content_sha256"));
        assert_eq!(store.get_document(document.id).await.expect("get"), Some(indexed.clone()));

        let chunks = store.chunks_for_document(document.id).await.expect("chunks");
        assert_eq!(chunks.len() as u64, indexed.chunk_count);
        assert!(chunks.iter().all(|chunk| chunk.vector_id == chunk.id.to_string()));

        let filter = PayloadFilter::new().must_match("document_id", document.id);
        let probe = CharacterNgramEmbedder::new(DIMENSIONS).embed_text("pump pressure");
        let hits = index.search(&probe, 100, &filter).await.expect("search");
        assert_eq!(hits.len(), chunks.len());
        assert!(hits.iter().all(|hit| hit.payload_u64("owner_id") == Some(9)));
    }

    #[tokio::test]
    async fn empty_document_ends_in_error() {
        let (store, _index, pipeline) = pipeline_with("   \n ", CharacterNgramEmbedder::new(DIMENSIONS));
        let document = create(&store, "blank.txt").await;

        let result = pipeline.run(document.id).await;
        assert!(matches!(result, Err(IndexingError::EmptyDocument(id)) if id == document.id));

        let stored = store.get_document(document.id).await.expect("get").expect("document");
        assert_eq!(stored.status, DocumentStatus::Error);
        assert_eq!(stored.last_error(), Some(result.expect_err("error").to_string().as_str()));
    }

    #[tokio::test]
    async fn run_rejects_ready_and_indexing_documents() {
        let (store, _index, pipeline) = pipeline_with(MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        let mut document = create(&store, "manual.txt").await;

        for status in [DocumentStatus::Ready, DocumentStatus::Indexing] {
            document.status = status;
            store.save_document(&document).await.expect("save");

            let result = pipeline.run(document.id).await;
            assert!(matches!(result, Err(IndexingError::InvalidState { .. })));

            let stored = store.get_document(document.id).await.expect("get").expect("document");
            assert_eq!(stored.status, status);
            assert!(store.chunks_for_document(document.id).await.expect("chunks").is_empty());
        }
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let (_store, _index, pipeline) = pipeline_with(MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        assert!(matches!(pipeline.run(404).await, Err(IndexingError::NotFound(404))));
    }

    #[tokio::test]
    async fn unsupported_format_records_error() {
        let (store, _index, pipeline) = pipeline_with(MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        let document = create(&store, "firmware.bin").await;

        let result = pipeline.run(document.id).await;
        assert!(matches!(result, Err(IndexingError::Extract(ExtractError::UnsupportedFormat(_)))));

        let stored = store.get_document(document.id).await.expect("get").expect("document");
        assert_eq!(stored.status, DocumentStatus::Error);
        assert!(stored.last_error().is_some_and(|message| message.contains("unsupported")));
    }

    #[tokio::test]
    async fn mid_run_embedding_failure_keeps_partial_state() {
        let (store, index, pipeline) = pipeline_with(MANUAL, flaky(2));
        let document = create(&store, "manual.txt").await;

        let result = pipeline.run(document.id).await;
        assert!(matches!(result, Err(IndexingError::Embedding(_))));

        let stored = store.get_document(document.id).await.expect("get").expect("document");
        assert_eq!(stored.status, DocumentStatus::Error);
        assert!(stored.last_error().is_some_and(|message| message.contains("rate limited")));
        assert!(stored.progress > 40 && stored.progress < 90);
        assert!(!stored.content_text.is_empty());

        let chunks = store.chunks_for_document(document.id).await.expect("chunks");
        assert!(chunks.len() >= 2);
        assert_eq!(index.chunk_point_count(), 1);
    }

    #[tokio::test]
    async fn failed_document_can_be_retried() {
        let (store, index, failing) = pipeline_with(MANUAL, flaky(2));
        let document = create(&store, "manual.txt").await;
        assert!(failing.run(document.id).await.is_err());
        let partial_chunks = store.chunks_for_document(document.id).await.expect("chunks");
        assert!(!partial_chunks.is_empty());

        let healthy = pipeline_on(&store, &index, MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        let indexed = healthy.run(document.id).await.expect("retry succeeds");

        assert_eq!(indexed.status, DocumentStatus::Ready);
        assert_eq!(indexed.last_error(), None);
        assert!(indexed
            .metadata
            .get("previous_error")
            .and_then(Value::as_str)
            .is_some_and(|message| message.contains("rate limited")));

        let chunks = store.chunks_for_document(document.id).await.expect("chunks");
        assert_eq!(chunks.len(), partial_chunks.len());
        assert_eq!(chunks.len() as u64, indexed.chunk_count);
        let indices: Vec<_> = chunks.iter().map(|chunk| chunk.index).collect();
        assert_eq!(indices, (0..chunks.len()).collect::<Vec<_>>());
        assert!(chunks.iter().all(|chunk| !chunk.vector_id.is_empty()));
        assert_eq!(index.chunk_point_count(), chunks.len());
    }

    #[tokio::test]
    async fn failed_retry_keeps_the_first_failure() {
        let (store, index, failing) = pipeline_with(MANUAL, flaky(2));
        let document = create(&store, "manual.txt").await;
        assert!(failing.run(document.id).await.is_err());

        let mut moved = store.get_document(document.id).await.expect("get").expect("document");
        moved.file_path = PathBuf::from("manual.bin");
        store.save_document(&moved).await.expect("save");

        let retry = pipeline_on(&store, &index, MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        let result = retry.run(document.id).await;
        assert!(matches!(result, Err(IndexingError::Extract(_))));

        let stored = store.get_document(document.id).await.expect("get").expect("document");
        assert_eq!(stored.status, DocumentStatus::Error);
        assert!(stored.last_error().is_some_and(|message| message.contains("unsupported")));
        assert!(stored
            .metadata
            .get("previous_error")
            .and_then(Value::as_str)
            .is_some_and(|message| message.contains("rate limited")));
        assert!(store.chunks_for_document(document.id).await.expect("chunks").is_empty());
        assert_eq!(index.chunk_point_count(), 0);
    }

    #[tokio::test]
    async fn backfill_recomputes_mean_from_index() {
        let (store, index, pipeline) = pipeline_with(MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        let document = create(&store, "manual.txt").await;
        pipeline.run(document.id).await.expect("pipeline run");

        let vectors = index
            .scroll_vectors_for_document(document.id)
            .await
            .expect("scroll");
        let mut expected = MeanVector::default();
        for vector in &vectors {
            expected.add(vector).expect("add");
        }

        let mean = pipeline
            .backfill_document_vector(document.id)
            .await
            .expect("backfill");
        assert_eq!(Some(mean), expected.finish());
    }

    #[tokio::test]
    async fn backfill_without_vectors_is_empty_document() {
        let (store, index, pipeline) = pipeline_with(MANUAL, CharacterNgramEmbedder::new(DIMENSIONS));
        index.ensure_collections().await.expect("ensure");
        let document = create(&store, "manual.txt").await;

        let result = pipeline.backfill_document_vector(document.id).await;
        assert!(matches!(result, Err(IndexingError::EmptyDocument(_))));
    }
}
