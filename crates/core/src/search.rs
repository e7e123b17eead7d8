use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::highlight::{highlight, DEFAULT_SNIPPET_CHARS};
use crate::models::{
    ChunkHit, ChunkRecord, DocumentGroup, SearchEvent, SearchMode, SearchRequest, SearchResponse,
};
use crate::traits::{DocumentStore, PayloadFilter, VectorIndex};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SEMANTIC_THRESHOLD: f64 = 0.30;
pub const HYBRID_THRESHOLD: f64 = 0.75;
pub const KEYWORD_LIMIT: usize = 50;
pub const HYBRID_CHUNKS_PER_DOCUMENT: usize = 3;
const DEDUP_PREFIX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemanticOptions {
    pub top_k: usize,
    pub max_chunks_per_doc: usize,
    pub threshold: f64,
}

impl Default for SemanticOptions {
    fn default() -> Self {
        Self {
            top_k: 20,
            max_chunks_per_doc: 3,
            threshold: SEMANTIC_THRESHOLD,
        }
    }
}

fn round_score(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

fn to_hit(record: ChunkRecord, score: f64) -> ChunkHit {
    ChunkHit {
        chunk_id: record.chunk.id,
        document_id: record.chunk.document_id,
        document_title: record.document_title,
        chunk_index: record.chunk.index,
        text: record.chunk.text,
        score,
        highlight: None,
    }
}

/// Groups hits by document in first-seen order. Each group keeps its `max_per_document` best
/// chunks; groups are ordered by their best score, ties keeping first-seen order.
fn group_by_document(hits: Vec<ChunkHit>, max_per_document: Option<usize>) -> Vec<DocumentGroup> {
    let mut positions: HashMap<u64, usize> = HashMap::new();
    let mut groups: Vec<DocumentGroup> = Vec::new();

    for hit in hits {
        let position = *positions.entry(hit.document_id).or_insert_with(|| {
            groups.push(DocumentGroup {
                document_id: hit.document_id,
                title: hit.document_title.clone(),
                best_score: 0.0,
                chunks: Vec::new(),
            });
            groups.len() - 1
        });
        groups[position].chunks.push(hit);
    }

    for group in &mut groups {
        group
            .chunks
            .sort_by(|left, right| right.score.total_cmp(&left.score));
        if let Some(limit) = max_per_document {
            group.chunks.truncate(limit);
        }
        group.best_score = group.chunks.first().map_or(0.0, |hit| hit.score);
    }

    groups.sort_by(|left, right| right.best_score.total_cmp(&left.best_score));
    groups
}

fn dedup_key(hit: &ChunkHit) -> (u64, String) {
    (
        hit.document_id,
        hit.text.chars().take(DEDUP_PREFIX_CHARS).collect(),
    )
}

/// Read-only query side: semantic, keyword and hybrid retrieval over indexed chunks.
pub struct SearchEngine<S, V, E>
where
    S: DocumentStore + ?Sized,
    V: VectorIndex + ?Sized,
    E: Embedder + ?Sized,
{
    store: Arc<S>,
    index: Arc<V>,
    embedder: Arc<E>,
    snippet_chars: usize,
}

impl<S, V, E> SearchEngine<S, V, E>
where
    S: DocumentStore + ?Sized,
    V: VectorIndex + ?Sized,
    E: Embedder + ?Sized,
{
    pub fn new(store: Arc<S>, index: Arc<V>, embedder: Arc<E>) -> Self {
        Self {
            store,
            index,
            embedder,
            snippet_chars: DEFAULT_SNIPPET_CHARS,
        }
    }

    pub fn with_snippet_chars(mut self, snippet_chars: usize) -> Self {
        self.snippet_chars = snippet_chars;
        self
    }

    pub async fn semantic_search(
        &self,
        query: &str,
        owner_id: u64,
        options: SemanticOptions,
    ) -> Result<Vec<DocumentGroup>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query).await?;
        let filter = PayloadFilter::new().must_match("owner_id", owner_id);
        let points = self
            .index
            .search(&query_vector, options.top_k, &filter)
            .await?;

        let mut hits = Vec::with_capacity(points.len());
        for point in points {
            if point.score < options.threshold {
                continue;
            }
            let Some(chunk_id) = point.payload_u64("chunk_id") else {
                debug!(point_id = point.id, "vector point without chunk_id");
                continue;
            };
            match self.store.chunk_with_document(chunk_id).await? {
                Some(record) => hits.push(to_hit(record, round_score(point.score))),
                None => debug!(chunk_id, "chunk missing from store, skipping hit"),
            }
        }

        Ok(group_by_document(hits, Some(options.max_chunks_per_doc)))
    }

    /// Case-insensitive substring matches with a fixed score of 1.0, in store order.
    pub async fn keyword_search(
        &self,
        query: &str,
        owner_id: u64,
    ) -> Result<Vec<ChunkHit>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let records = self
            .store
            .keyword_search(owner_id, query, KEYWORD_LIMIT)
            .await?;
        Ok(records
            .into_iter()
            .map(|record| to_hit(record, 1.0))
            .collect())
    }

    /// Semantic hits (at `threshold`) followed by keyword hits, deduplicated on document and
    /// text prefix with the earlier hit winning, then regrouped and highlighted.
    pub async fn hybrid_search(
        &self,
        query: &str,
        owner_id: u64,
        threshold: f64,
    ) -> Result<Vec<DocumentGroup>, SearchError> {
        let options = SemanticOptions {
            threshold,
            ..SemanticOptions::default()
        };
        let (semantic, keyword) = tokio::try_join!(
            self.semantic_search(query, owner_id, options),
            self.keyword_search(query, owner_id),
        )?;

        let mut seen = HashSet::new();
        let merged: Vec<ChunkHit> = semantic
            .into_iter()
            .flat_map(|group| group.chunks)
            .chain(keyword)
            .filter(|hit| seen.insert(dedup_key(hit)))
            .collect();

        let mut groups = group_by_document(merged, Some(HYBRID_CHUNKS_PER_DOCUMENT));
        self.attach_highlights(&mut groups, query);
        Ok(groups)
    }

    fn attach_highlights(&self, groups: &mut [DocumentGroup], query: &str) {
        for hit in groups.iter_mut().flat_map(|group| group.chunks.iter_mut()) {
            hit.highlight = Some(highlight(&hit.text, query, self.snippet_chars));
        }
    }

    /// Runs the requested mode and appends a search event for the owner.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();

        let (threshold, groups) = match request.mode {
            SearchMode::Semantic => {
                let threshold = request.threshold.unwrap_or(SEMANTIC_THRESHOLD);
                let options = SemanticOptions {
                    threshold,
                    ..SemanticOptions::default()
                };
                let groups = self
                    .semantic_search(&request.query, request.owner_id, options)
                    .await?;
                (threshold, groups)
            }
            SearchMode::Keyword => {
                let hits = self
                    .keyword_search(&request.query, request.owner_id)
                    .await?;
                let mut groups = group_by_document(hits, None);
                self.attach_highlights(&mut groups, &request.query);
                (0.0, groups)
            }
            SearchMode::Hybrid => {
                let threshold = request.threshold.unwrap_or(HYBRID_THRESHOLD);
                let groups = self
                    .hybrid_search(&request.query, request.owner_id, threshold)
                    .await?;
                (threshold, groups)
            }
        };

        let response = SearchResponse {
            query: request.query.clone(),
            mode: request.mode,
            threshold,
            groups,
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let event = SearchEvent {
            id: Uuid::new_v4(),
            user_id: Some(request.owner_id),
            query: request.query.clone(),
            mode: request.mode,
            threshold,
            result_count: response.chunk_count(),
            top_score: response.top_score(),
            latency_ms,
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.record_search_event(event).await {
            warn!(error = %error, "failed to record search event");
        }

        info!(
            owner_id = request.owner_id,
            mode = %request.mode,
            results = response.chunk_count(),
            latency_ms,
            "search completed"
        );
        Ok(response)
    }
}
