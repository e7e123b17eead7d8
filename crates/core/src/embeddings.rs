use crate::config::Settings;
use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_EMBEDDING_CHARS: usize = 32_000;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier recorded on documents indexed with this embedder.
    fn model_name(&self) -> String;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingInput<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a str> for EmbeddingInput<'a> {
    fn from(value: &'a str) -> Self {
        EmbeddingInput::Text(value)
    }
}

impl<'a> From<&'a [u8]> for EmbeddingInput<'a> {
    fn from(value: &'a [u8]) -> Self {
        EmbeddingInput::Bytes(value)
    }
}

/// Cleans embedding input: bytes are decoded lossily with invalid sequences dropped, NULs
/// become spaces, surrounding whitespace is stripped and overlong input is truncated.
pub fn normalize_input(input: EmbeddingInput<'_>) -> Result<String, EmbeddingError> {
    let decoded = match input {
        EmbeddingInput::Text(text) => text.to_string(),
        EmbeddingInput::Bytes(bytes) => String::from_utf8_lossy(bytes).replace('\u{fffd}', ""),
    };

    let cleaned = decoded.replace('\0', " ");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Err(EmbeddingError::InvalidInput(
            "input is empty after stripping".to_string(),
        ));
    }

    let length = trimmed.chars().count();
    if length > MAX_EMBEDDING_CHARS {
        warn!(
            original_chars = length,
            max_chars = MAX_EMBEDDING_CHARS,
            "truncating embedding input"
        );
        return Ok(trimmed.chars().take(MAX_EMBEDDING_CHARS).collect());
    }

    Ok(trimmed.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Ollama,
    Hashed,
}

impl FromStr for ProviderKind {
    type Err = EmbeddingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            "hashed" => Ok(ProviderKind::Hashed),
            other => Err(EmbeddingError::Configuration(format!(
                "unknown embedding provider: {other}"
            ))),
        }
    }
}

/// Shared handle to the active provider key. Updates are visible to the next `embed` call.
#[derive(Debug, Clone)]
pub struct ProviderSetting(Arc<RwLock<String>>);

impl ProviderSetting {
    pub fn new(provider: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(provider.into())))
    }

    pub fn get(&self) -> String {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, provider: impl Into<String>) {
        let provider = provider.into();
        match self.0.write() {
            Ok(mut guard) => *guard = provider,
            Err(poisoned) => *poisoned.into_inner() = provider,
        }
    }
}

/// Deterministic character-trigram embedder. Needs no network and keeps similar strings close.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        if chars.len() < 3 {
            let bucket = fnv_bucket(&lowered, vector.len());
            vector[bucket] = 1.0;
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let bucket = fnv_bucket(&token, vector.len());
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

fn fnv_bucket(token: &str, buckets: usize) -> usize {
    let mut hash = 1469598103934665603u64;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    (hash % buckets as u64) as usize
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_name(&self) -> String {
        format!("hashed:{}", self.dimensions)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let normalized = normalize_input(EmbeddingInput::Text(text))?;
        Ok(self.embed_text(&normalized))
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            EmbeddingError::Configuration("OPENAI_API_KEY is not set".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(api_key)
            .json(&EmbedRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await
            .map_err(|error| EmbeddingError::provider("openai", error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::provider(
                "openai",
                format!("status {status}: {body}"),
            ));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::provider("openai", format!("malformed response: {error}")))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| EmbeddingError::provider("openai", "response contained no embedding"))
    }
}

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Client,
    url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(client: Client, url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&EmbedRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await
            .map_err(|error| {
                EmbeddingError::provider(
                    "ollama",
                    format!("connection error (is Ollama running at {}?): {error}", self.url),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::provider(
                "ollama",
                format!("status {status}: {body}"),
            ));
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::provider("ollama", format!("malformed response: {error}")))?;

        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::provider("ollama", "response contained no embedding"))
    }
}

/// Routes each call to the provider named by the shared [`ProviderSetting`].
#[derive(Debug, Clone)]
pub struct EmbeddingDispatcher {
    provider: ProviderSetting,
    dimensions: usize,
    openai: OpenAiProvider,
    ollama: OllamaProvider,
    hashed: CharacterNgramEmbedder,
}

impl EmbeddingDispatcher {
    pub fn from_settings(
        settings: &Settings,
        provider: ProviderSetting,
    ) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.embedding_timeout_secs))
            .build()
            .map_err(|error| EmbeddingError::Configuration(error.to_string()))?;

        Ok(Self {
            provider,
            dimensions: settings.vector_size,
            openai: OpenAiProvider::new(
                client.clone(),
                &settings.openai_base_url,
                &settings.openai_embedding_model,
                settings.openai_api_key.clone(),
            ),
            ollama: OllamaProvider::new(client, &settings.ollama_url, &settings.ollama_embedding_model),
            hashed: CharacterNgramEmbedder::new(settings.vector_size),
        })
    }

    pub fn provider(&self) -> &ProviderSetting {
        &self.provider
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[async_trait]
impl Embedder for EmbeddingDispatcher {
    fn model_name(&self) -> String {
        let key = self.provider.get();
        match key.parse::<ProviderKind>() {
            Ok(ProviderKind::OpenAi) => format!("openai:{}", self.openai.model()),
            Ok(ProviderKind::Ollama) => format!("ollama:{}", self.ollama.model()),
            Ok(ProviderKind::Hashed) => self.hashed.model_name(),
            Err(_) => key,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let normalized = normalize_input(EmbeddingInput::Text(text))?;
        let kind: ProviderKind = self.provider.get().parse()?;
        debug!(provider = ?kind, chars = normalized.chars().count(), "embedding text");

        let (name, vector) = match kind {
            ProviderKind::OpenAi => ("openai", self.openai.embed(&normalized).await?),
            ProviderKind::Ollama => ("ollama", self.ollama.embed(&normalized).await?),
            ProviderKind::Hashed => ("hashed", self.hashed.embed_text(&normalized)),
        };

        if vector.len() != self.dimensions {
            return Err(EmbeddingError::provider(
                name,
                format!(
                    "malformed response: embedding has {} dimensions, expected {}",
                    vector.len(),
                    self.dimensions
                ),
            ));
        }

        Ok(vector)
    }
}
