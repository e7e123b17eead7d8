use crate::chunking::ChunkingConfig;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_VECTOR_SIZE: usize = 1536;
pub const DEFAULT_CHUNK_COLLECTION: &str = "doc_chunks";
pub const DEFAULT_DOCUMENT_COLLECTION: &str = "doc_vectors";

/// Runtime settings shared by the pipeline, the embedding dispatcher and the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub vector_size: usize,
    pub embedding_provider: String,
    pub openai_embedding_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub ollama_url: String,
    pub ollama_embedding_model: String,
    pub embedding_timeout_secs: u64,
    pub chunk_collection: String,
    pub document_collection: String,
    pub qdrant_host: String,
    pub qdrant_port: u16,
    pub qdrant_api_key: Option<String>,
    pub qdrant_timeout_secs: u64,
    pub chunk_max_chars: usize,
    pub chunk_overlap: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vector_size: DEFAULT_VECTOR_SIZE,
            embedding_provider: "openai".to_string(),
            openai_embedding_model: "text-embedding-3-small".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_embedding_model: "nomic-embed-text".to_string(),
            embedding_timeout_secs: 30,
            chunk_collection: DEFAULT_CHUNK_COLLECTION.to_string(),
            document_collection: DEFAULT_DOCUMENT_COLLECTION.to_string(),
            qdrant_host: "localhost".to_string(),
            qdrant_port: 6333,
            qdrant_api_key: None,
            qdrant_timeout_secs: 30,
            chunk_max_chars: 1_200,
            chunk_overlap: 200,
        }
    }
}

impl Settings {
    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig::new(self.chunk_max_chars, self.chunk_overlap)
    }

    pub fn qdrant_url(&self) -> Result<Url, url::ParseError> {
        let host = self.qdrant_host.trim();
        if host.starts_with("http://") || host.starts_with("https://") {
            let mut url = Url::parse(host)?;
            if url.port().is_none() {
                // Only fails for cannot-be-a-base URLs, which http(s) never are.
                let _ = url.set_port(Some(self.qdrant_port));
            }
            return Ok(url);
        }

        Url::parse(&format!("http://{}:{}", host, self.qdrant_port))
    }
}
