use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Indexing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Indexing => "indexing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }

    /// Whether a new indexing run may start from this state.
    pub fn accepts_indexing(&self) -> bool {
        matches!(self, DocumentStatus::Pending | DocumentStatus::Error)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: u64,
    pub owner_id: u64,
    pub title: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub content_text: String,
    #[serde(default)]
    pub status: DocumentStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub chunk_count: u64,
    #[serde(default)]
    pub token_count: u64,
    pub last_indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn last_error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDocument {
    pub owner_id: u64,
    pub title: String,
    pub file_path: PathBuf,
    pub metadata: Map<String, Value>,
}

/// A chunk as produced by the chunker, before it has a row in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: u64,
    pub document_id: u64,
    pub index: usize,
    pub text: String,
    pub start: Option<usize>,
    pub end: Option<usize>,
    #[serde(default)]
    pub vector_id: String,
}

/// A chunk row joined with the fields of its owning document that search needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub owner_id: u64,
    pub document_title: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchEvent {
    pub id: Uuid,
    pub user_id: Option<u64>,
    pub query: String,
    pub mode: SearchMode,
    pub threshold: f64,
    pub result_count: usize,
    pub top_score: Option<f64>,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Highlight {
    pub html: String,
    pub truncated: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkHit {
    pub chunk_id: u64,
    pub document_id: u64,
    pub document_title: String,
    pub chunk_index: usize,
    pub text: String,
    pub score: f64,
    pub highlight: Option<Highlight>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentGroup {
    pub document_id: u64,
    pub title: String,
    pub best_score: f64,
    pub chunks: Vec<ChunkHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub owner_id: u64,
    pub mode: SearchMode,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub threshold: f64,
    pub groups: Vec<DocumentGroup>,
}

impl SearchResponse {
    pub fn chunk_count(&self) -> usize {
        self.groups.iter().map(|group| group.chunks.len()).sum()
    }

    pub fn top_score(&self) -> Option<f64> {
        self.groups.first().map(|group| group.best_score)
    }
}
