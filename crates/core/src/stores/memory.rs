//! In-memory implementations of [`DocumentStore`] and [`VectorIndex`].
//!
//! State lives behind `std::sync::RwLock` and can be snapshotted to a JSON file, which is how
//! the CLI keeps documents (and, in offline mode, vectors) between invocations.
//! Vector search is brute-force cosine similarity.

use crate::error::{IndexError, StoreError};
use crate::models::{Chunk, ChunkRecord, Document, NewDocument, SearchEvent, TextChunk};
use crate::traits::{ChunkPayload, DocumentStore, PayloadFilter, PointId, ScoredPoint, VectorIndex};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn load_snapshot<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_snapshot<T: Serialize>(path: &Path, state: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state)?;
    let staging = path.with_extension("tmp");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)?;
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_document_id: u64,
    next_chunk_id: u64,
    documents: BTreeMap<u64, Document>,
    chunks: BTreeMap<u64, Chunk>,
    #[serde(default)]
    search_events: Vec<SearchEvent>,
}

impl StoreState {
    fn record(&self, chunk: &Chunk) -> Option<ChunkRecord> {
        let document = self.documents.get(&chunk.document_id)?;
        Some(ChunkRecord {
            chunk: chunk.clone(),
            owner_id: document.owner_id,
            document_title: document.title.clone(),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            state: RwLock::new(load_snapshot(path)?),
        })
    }

    pub fn persist(&self, path: &Path) -> Result<(), StoreError> {
        write_snapshot(path, &*read_lock(&self.state))
    }

    /// Every document regardless of owner, in id order.
    pub fn documents(&self) -> Vec<Document> {
        read_lock(&self.state).documents.values().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, document: NewDocument) -> Result<Document, StoreError> {
        let mut state = write_lock(&self.state);
        state.next_document_id += 1;
        let created = Document {
            id: state.next_document_id,
            owner_id: document.owner_id,
            title: document.title,
            file_path: document.file_path,
            content_text: String::new(),
            status: Default::default(),
            progress: 0,
            embedding_model: String::new(),
            chunk_count: 0,
            token_count: 0,
            last_indexed_at: None,
            metadata: document.metadata,
            created_at: Utc::now(),
        };
        state.documents.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_document(&self, document_id: u64) -> Result<Option<Document>, StoreError> {
        Ok(read_lock(&self.state).documents.get(&document_id).cloned())
    }

    async fn save_document(&self, document: &Document) -> Result<(), StoreError> {
        let mut state = write_lock(&self.state);
        match state.documents.get_mut(&document.id) {
            Some(stored) => {
                *stored = document.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "document",
                id: document.id,
            }),
        }
    }

    async fn delete_document(&self, document_id: u64) -> Result<(), StoreError> {
        let mut state = write_lock(&self.state);
        if state.documents.remove(&document_id).is_none() {
            return Err(StoreError::NotFound {
                entity: "document",
                id: document_id,
            });
        }
        state.chunks.retain(|_, chunk| chunk.document_id != document_id);
        Ok(())
    }

    async fn documents_for_owner(&self, owner_id: u64) -> Result<Vec<Document>, StoreError> {
        Ok(read_lock(&self.state)
            .documents
            .values()
            .filter(|document| document.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn insert_chunks(
        &self,
        document_id: u64,
        chunks: &[TextChunk],
    ) -> Result<Vec<Chunk>, StoreError> {
        let mut state = write_lock(&self.state);
        if !state.documents.contains_key(&document_id) {
            return Err(StoreError::NotFound {
                entity: "document",
                id: document_id,
            });
        }

        let mut taken: HashSet<usize> = state
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .map(|chunk| chunk.index)
            .collect();
        for chunk in chunks {
            if !taken.insert(chunk.index) {
                return Err(StoreError::Conflict(format!(
                    "chunk {} already exists for document {}",
                    chunk.index, document_id
                )));
            }
        }

        let mut inserted = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            state.next_chunk_id += 1;
            let row = Chunk {
                id: state.next_chunk_id,
                document_id,
                index: chunk.index,
                text: chunk.text.clone(),
                start: Some(chunk.start),
                end: Some(chunk.end),
                vector_id: String::new(),
            };
            state.chunks.insert(row.id, row.clone());
            inserted.push(row);
        }

        Ok(inserted)
    }

    async fn set_chunk_vector_id(&self, chunk_id: u64, vector_id: &str) -> Result<(), StoreError> {
        let mut state = write_lock(&self.state);
        let chunk = state.chunks.get_mut(&chunk_id).ok_or(StoreError::NotFound {
            entity: "chunk",
            id: chunk_id,
        })?;
        chunk.vector_id = vector_id.to_string();
        Ok(())
    }

    async fn delete_chunks(&self, document_id: u64) -> Result<usize, StoreError> {
        let mut state = write_lock(&self.state);
        let before = state.chunks.len();
        state.chunks.retain(|_, chunk| chunk.document_id != document_id);
        Ok(before - state.chunks.len())
    }

    async fn chunks_for_document(&self, document_id: u64) -> Result<Vec<Chunk>, StoreError> {
        let mut chunks: Vec<Chunk> = read_lock(&self.state)
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|chunk| chunk.index);
        Ok(chunks)
    }

    async fn chunk_with_document(&self, chunk_id: u64) -> Result<Option<ChunkRecord>, StoreError> {
        let state = read_lock(&self.state);
        Ok(state
            .chunks
            .get(&chunk_id)
            .and_then(|chunk| state.record(chunk)))
    }

    async fn keyword_search(
        &self,
        owner_id: u64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let state = read_lock(&self.state);
        Ok(state
            .chunks
            .values()
            .filter_map(|chunk| state.record(chunk))
            .filter(|record| record.owner_id == owner_id)
            .filter(|record| record.chunk.text.to_lowercase().contains(&needle))
            .take(limit)
            .collect())
    }

    async fn record_search_event(&self, event: SearchEvent) -> Result<(), StoreError> {
        write_lock(&self.state).search_events.push(event);
        Ok(())
    }

    async fn search_events(&self, user_id: Option<u64>) -> Result<Vec<SearchEvent>, StoreError> {
        Ok(read_lock(&self.state)
            .search_events
            .iter()
            .filter(|event| user_id.is_none() || event.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPoint {
    vector: Vec<f32>,
    payload: Map<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    chunk_collection: Option<BTreeMap<PointId, StoredPoint>>,
    document_collection: Option<BTreeMap<PointId, StoredPoint>>,
}

#[derive(Debug)]
pub struct MemoryVectorIndex {
    vector_size: usize,
    state: RwLock<IndexState>,
}

impl MemoryVectorIndex {
    pub fn new(vector_size: usize) -> Self {
        Self {
            vector_size,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn load(path: &Path, vector_size: usize) -> Result<Self, StoreError> {
        Ok(Self {
            vector_size,
            state: RwLock::new(load_snapshot(path)?),
        })
    }

    pub fn persist(&self, path: &Path) -> Result<(), StoreError> {
        write_snapshot(path, &*read_lock(&self.state))
    }

    pub fn chunk_point_count(&self) -> usize {
        read_lock(&self.state)
            .chunk_collection
            .as_ref()
            .map_or(0, BTreeMap::len)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.vector_size {
            return Err(IndexError::Dimension {
                expected: self.vector_size,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

fn missing_collection(name: &str) -> IndexError {
    IndexError::BackendResponse {
        backend: "memory".to_string(),
        details: format!("collection {name} does not exist"),
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f64 = left
        .iter()
        .zip(right)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum();
    let left_norm = left.iter().map(|a| f64::from(*a).powi(2)).sum::<f64>().sqrt();
    let right_norm = right.iter().map(|b| f64::from(*b).powi(2)).sum::<f64>().sqrt();
    if left_norm < f64::EPSILON || right_norm < f64::EPSILON {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn ensure_collections(&self) -> Result<(), IndexError> {
        let mut state = write_lock(&self.state);
        state.chunk_collection.get_or_insert_with(BTreeMap::new);
        state.document_collection.get_or_insert_with(BTreeMap::new);
        Ok(())
    }

    async fn upsert_chunk_vector(
        &self,
        chunk_id: u64,
        vector: &[f32],
        payload: &ChunkPayload,
    ) -> Result<PointId, IndexError> {
        self.check_dimension(vector)?;
        let mut state = write_lock(&self.state);
        let collection = state
            .chunk_collection
            .as_mut()
            .ok_or_else(|| missing_collection("chunks"))?;
        collection.insert(
            chunk_id,
            StoredPoint {
                vector: vector.to_vec(),
                payload: payload.to_map(),
            },
        );
        Ok(chunk_id)
    }

    async fn upsert_document_vector(
        &self,
        document_id: u64,
        title: &str,
        mean_vector: &[f32],
    ) -> Result<PointId, IndexError> {
        self.check_dimension(mean_vector)?;
        let mut state = write_lock(&self.state);
        let collection = state
            .document_collection
            .as_mut()
            .ok_or_else(|| missing_collection("documents"))?;
        let payload = match json!({ "title": title }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        collection.insert(
            document_id,
            StoredPoint {
                vector: mean_vector.to_vec(),
                payload,
            },
        );
        Ok(document_id)
    }

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<ScoredPoint>, IndexError> {
        self.check_dimension(query_vector)?;
        let state = read_lock(&self.state);
        let Some(collection) = state.chunk_collection.as_ref() else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<ScoredPoint> = collection
            .iter()
            .filter(|(_, point)| filter.matches(&point.payload))
            .map(|(id, point)| ScoredPoint {
                id: *id,
                score: cosine_similarity(query_vector, &point.vector),
                payload: point.payload.clone(),
            })
            .collect();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: u64) -> Result<(), IndexError> {
        let filter = PayloadFilter::new().must_match("document_id", document_id);
        let mut state = write_lock(&self.state);
        if let Some(collection) = state.chunk_collection.as_mut() {
            collection.retain(|_, point| !filter.matches(&point.payload));
        }
        Ok(())
    }

    async fn delete_document_vector(&self, document_id: u64) -> Result<(), IndexError> {
        let mut state = write_lock(&self.state);
        if let Some(collection) = state.document_collection.as_mut() {
            collection.remove(&document_id);
        }
        Ok(())
    }

    async fn scroll_vectors_for_document(
        &self,
        document_id: u64,
    ) -> Result<Vec<Vec<f32>>, IndexError> {
        let filter = PayloadFilter::new().must_match("document_id", document_id);
        let state = read_lock(&self.state);
        Ok(state
            .chunk_collection
            .iter()
            .flat_map(|collection| collection.values())
            .filter(|point| filter.matches(&point.payload))
            .map(|point| point.vector.clone())
            .collect())
    }
}
