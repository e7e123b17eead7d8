use crate::error::{ExtractError, IndexError, StoreError};
use crate::models::{Chunk, ChunkRecord, Document, NewDocument, SearchEvent, TextChunk};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

pub type PointId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: PointId,
    pub score: f64,
    pub payload: Map<String, Value>,
}

impl ScoredPoint {
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

/// Exact-match conditions on payload fields, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadFilter {
    pub must: Vec<(String, Value)>,
}

impl PayloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must_match(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        self.must
            .iter()
            .all(|(key, value)| payload.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub owner_id: u64,
    pub document_id: u64,
    pub chunk_id: u64,
    pub title: String,
}

impl ChunkPayload {
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("owner_id".to_string(), Value::from(self.owner_id));
        map.insert("document_id".to_string(), Value::from(self.document_id));
        map.insert("chunk_id".to_string(), Value::from(self.chunk_id));
        map.insert("title".to_string(), Value::from(self.title.clone()));
        map
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Creates the chunk and document collections when absent. Never drops existing data.
    async fn ensure_collections(&self) -> Result<(), IndexError>;

    async fn upsert_chunk_vector(
        &self,
        chunk_id: u64,
        vector: &[f32],
        payload: &ChunkPayload,
    ) -> Result<PointId, IndexError>;

    async fn upsert_document_vector(
        &self,
        document_id: u64,
        title: &str,
        mean_vector: &[f32],
    ) -> Result<PointId, IndexError>;

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ScoredPoint>, IndexError>;

    /// Removes every chunk point tagged with `document_id`. Succeeds when there is nothing to remove.
    async fn delete_by_document(&self, document_id: u64) -> Result<(), IndexError>;

    async fn delete_document_vector(&self, document_id: u64) -> Result<(), IndexError>;

    async fn scroll_vectors_for_document(&self, document_id: u64)
        -> Result<Vec<Vec<f32>>, IndexError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, document: NewDocument) -> Result<Document, StoreError>;

    async fn get_document(&self, document_id: u64) -> Result<Option<Document>, StoreError>;

    async fn save_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn delete_document(&self, document_id: u64) -> Result<(), StoreError>;

    async fn documents_for_owner(&self, owner_id: u64) -> Result<Vec<Document>, StoreError>;

    /// Inserts one row per chunk. Fails with `Conflict` when `(document, index)` already exists.
    async fn insert_chunks(
        &self,
        document_id: u64,
        chunks: &[TextChunk],
    ) -> Result<Vec<Chunk>, StoreError>;

    async fn set_chunk_vector_id(&self, chunk_id: u64, vector_id: &str) -> Result<(), StoreError>;

    async fn delete_chunks(&self, document_id: u64) -> Result<usize, StoreError>;

    async fn chunks_for_document(&self, document_id: u64) -> Result<Vec<Chunk>, StoreError>;

    async fn chunk_with_document(&self, chunk_id: u64) -> Result<Option<ChunkRecord>, StoreError>;

    /// Case-insensitive substring scan over the owner's chunks, in storage order.
    async fn keyword_search(
        &self,
        owner_id: u64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError>;

    async fn record_search_event(&self, event: SearchEvent) -> Result<(), StoreError>;

    async fn search_events(&self, user_id: Option<u64>) -> Result<Vec<SearchEvent>, StoreError>;
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<String, ExtractError>;
}
