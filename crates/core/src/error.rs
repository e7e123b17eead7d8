use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file format for text extraction: {0}")]
    UnsupportedFormat(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    Pdf(String),

    #[error("docx parse error: {0}")]
    Docx(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding configuration error: {0}")]
    Configuration(String),

    #[error("embedding provider {provider} failed: {details}")]
    Provider { provider: String, details: String },

    #[error("invalid embedding input: {0}")]
    InvalidInput(String),
}

impl EmbeddingError {
    pub(crate) fn provider(provider: &str, details: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.to_string(),
            details: details.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("vector dimension {actual} does not match collection dimension {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for IndexError {
    fn from(error: reqwest::Error) -> Self {
        Self::Unavailable(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IndexingError {
    #[error("document {0} not found")]
    NotFound(u64),

    #[error("document {document_id} is {status} and cannot be indexed")]
    InvalidState { document_id: u64, status: String },

    #[error("no supported documents found in {}", .0.display())]
    NoDocuments(PathBuf),

    #[error("document {0} has no embeddable content")]
    EmptyDocument(u64),

    #[error("embedding dimension changed mid-document: expected {expected}, got {actual}")]
    InconsistentDimension { expected: usize, actual: usize },

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = IndexingError> = std::result::Result<T, E>;
