pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod highlight;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod reindex;
pub mod search;
pub mod stores;
pub mod tokens;
pub mod traits;

pub use chunking::{chunk_text, split_sentences, ChunkingConfig};
pub use config::Settings;
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbeddingDispatcher, OllamaProvider, OpenAiProvider,
    ProviderKind, ProviderSetting,
};
pub use error::{
    EmbeddingError, ExtractError, IndexError, IndexingError, SearchError, StoreError,
};
pub use extractor::{FileExtractor, FileFormat};
pub use highlight::{highlight, DEFAULT_SNIPPET_CHARS};
pub use ingest::{
    digest_file, discover_documents, register_document, register_folder, RegistrationReport,
    SkippedFile,
};
pub use models::{
    Chunk, ChunkHit, ChunkRecord, Document, DocumentGroup, DocumentStatus, Highlight,
    NewDocument, SearchEvent, SearchMode, SearchRequest, SearchResponse, TextChunk,
};
pub use pipeline::{IndexingPipeline, MeanVector};
pub use reindex::{delete_document, reset_for_reindex};
pub use search::{SearchEngine, SemanticOptions, HYBRID_THRESHOLD, SEMANTIC_THRESHOLD};
pub use stores::{MemoryStore, MemoryVectorIndex, QdrantStore};
pub use tokens::{estimate_tokens, TokenCounter};
pub use traits::{
    ChunkPayload, DocumentStore, PayloadFilter, PointId, ScoredPoint, TextExtractor, VectorIndex,
};
