use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use docsearch_core::{
    delete_document, register_document, register_folder, reset_for_reindex, Document,
    DocumentStore, EmbeddingDispatcher, FileExtractor, IndexingPipeline, MemoryStore,
    MemoryVectorIndex, ProviderSetting, QdrantStore, SearchEngine, SearchMode, SearchRequest,
    Settings, VectorIndex,
};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docsearch", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON snapshot holding documents, chunks and search events
    #[arg(long, env = "DOCSEARCH_STATE", default_value = "docsearch-state.json")]
    state: PathBuf,

    /// Where chunk and document vectors live
    #[arg(long, value_enum, env = "VECTOR_BACKEND", default_value = "qdrant")]
    vector_backend: VectorBackend,

    /// Embedding dimension shared by the provider and both collections
    #[arg(long, env = "VECTOR_SIZE", default_value_t = 1536)]
    vector_size: usize,

    /// Active embedding provider: openai, ollama or hashed
    #[arg(long, env = "EMBEDDING_PROVIDER", default_value = "openai")]
    embedding_provider: String,

    #[arg(long, env = "OPENAI_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    openai_embedding_model: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com")]
    openai_base_url: String,

    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    ollama_url: String,

    #[arg(long, env = "OLLAMA_EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    ollama_embedding_model: String,

    /// Per-request timeout for embedding calls
    #[arg(long, env = "EMBEDDING_TIMEOUT_SECS", default_value_t = 30)]
    embedding_timeout_secs: u64,

    #[arg(long, env = "QDRANT_CHUNK_COLLECTION", default_value = "doc_chunks")]
    chunk_collection: String,

    #[arg(long, env = "QDRANT_DOCUMENT_COLLECTION", default_value = "doc_vectors")]
    document_collection: String,

    #[arg(long, env = "QDRANT_HOST", default_value = "localhost")]
    qdrant_host: String,

    #[arg(long, env = "QDRANT_PORT", default_value_t = 6333)]
    qdrant_port: u16,

    #[arg(long, env = "QDRANT_API_KEY", hide_env_values = true)]
    qdrant_api_key: Option<String>,

    /// Per-request timeout for vector index calls
    #[arg(long, env = "QDRANT_TIMEOUT_SECS", default_value_t = 30)]
    qdrant_timeout_secs: u64,

    #[arg(long, env = "CHUNK_MAX_CHARS", default_value_t = 1200)]
    chunk_max_chars: usize,

    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            vector_size: self.vector_size,
            embedding_provider: self.embedding_provider.clone(),
            openai_embedding_model: self.openai_embedding_model.clone(),
            openai_api_key: self.openai_api_key.clone(),
            openai_base_url: self.openai_base_url.clone(),
            ollama_url: self.ollama_url.clone(),
            ollama_embedding_model: self.ollama_embedding_model.clone(),
            embedding_timeout_secs: self.embedding_timeout_secs,
            chunk_collection: self.chunk_collection.clone(),
            document_collection: self.document_collection.clone(),
            qdrant_host: self.qdrant_host.clone(),
            qdrant_port: self.qdrant_port,
            qdrant_api_key: self.qdrant_api_key.clone(),
            qdrant_timeout_secs: self.qdrant_timeout_secs,
            chunk_max_chars: self.chunk_max_chars,
            chunk_overlap: self.chunk_overlap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VectorBackend {
    Qdrant,
    /// Keep vectors next to the state snapshot
    Memory,
}

#[derive(Subcommand)]
enum Command {
    /// Register every supported file under a folder (or a single file) as a pending document.
    Upload {
        #[arg(long)]
        owner: u64,
        /// Folder searched recursively for txt, md, pdf and docx files.
        #[arg(long)]
        folder: PathBuf,
        /// Title for a single uploaded file. Defaults to the file name.
        #[arg(long)]
        title: Option<String>,
    },
    /// Run the indexing pipeline for one document, or every pending and failed document.
    Index {
        #[arg(long)]
        document: Option<u64>,
    },
    /// Query indexed chunks.
    Search {
        #[arg(long)]
        owner: u64,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "hybrid")]
        mode: SearchMode,
        /// Minimum semantic score. Defaults to 0.30 for semantic and 0.75 for hybrid.
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Drop a document's chunks and vectors, then index it again.
    Reindex {
        #[arg(long)]
        document: u64,
    },
    /// Delete a document with its chunks and vectors.
    Delete {
        #[arg(long)]
        document: u64,
    },
    /// Show the indexing state of an owner's documents.
    Status {
        #[arg(long)]
        owner: u64,
    },
}

type Pipeline = IndexingPipeline<MemoryStore, dyn VectorIndex, EmbeddingDispatcher, FileExtractor>;

struct App {
    settings: Settings,
    state_path: PathBuf,
    store: Arc<MemoryStore>,
    index: Arc<dyn VectorIndex>,
    memory_index: Option<(Arc<MemoryVectorIndex>, PathBuf)>,
    embedder: Arc<EmbeddingDispatcher>,
}

impl App {
    fn open(cli: &Cli) -> anyhow::Result<Self> {
        let settings = cli.settings();
        let store = Arc::new(
            MemoryStore::load(&cli.state)
                .with_context(|| format!("loading state from {}", cli.state.display()))?,
        );

        let (index, memory_index) = match cli.vector_backend {
            VectorBackend::Qdrant => {
                let qdrant: Arc<dyn VectorIndex> = Arc::new(QdrantStore::from_settings(&settings)?);
                (qdrant, None)
            }
            VectorBackend::Memory => {
                let path = vectors_path(&cli.state);
                let memory = Arc::new(
                    MemoryVectorIndex::load(&path, settings.vector_size)
                        .with_context(|| format!("loading vectors from {}", path.display()))?,
                );
                let index: Arc<dyn VectorIndex> = memory.clone();
                (index, Some((memory, path)))
            }
        };

        let provider = ProviderSetting::new(settings.embedding_provider.clone());
        let embedder = Arc::new(EmbeddingDispatcher::from_settings(&settings, provider)?);

        Ok(Self {
            settings,
            state_path: cli.state.clone(),
            store,
            index,
            memory_index,
            embedder,
        })
    }

    fn pipeline(&self) -> Pipeline {
        IndexingPipeline::new(
            Arc::clone(&self.store),
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            Arc::new(FileExtractor),
        )
        .with_chunking(self.settings.chunking())
    }

    fn persist(&self) -> anyhow::Result<()> {
        self.store
            .persist(&self.state_path)
            .with_context(|| format!("writing state to {}", self.state_path.display()))?;
        if let Some((memory, path)) = &self.memory_index {
            memory
                .persist(path)
                .with_context(|| format!("writing vectors to {}", path.display()))?;
        }
        Ok(())
    }
}

fn vectors_path(state: &Path) -> PathBuf {
    state.with_extension("vectors.json")
}

fn print_document(document: &Document) {
    println!(
        "[{}] {} status={} progress={} chunks={} tokens={} model={}",
        document.id,
        document.title,
        document.status,
        document.progress,
        document.chunk_count,
        document.token_count,
        if document.embedding_model.is_empty() {
            "-"
        } else {
            document.embedding_model.as_str()
        }
    );
    if let Some(error) = document.last_error() {
        println!("  error={error}");
    }
}

async fn index_documents(app: &App, document_ids: Vec<u64>) -> usize {
    let pipeline = app.pipeline();
    let runs = document_ids.iter().map(|document_id| pipeline.run(*document_id));
    let results = join_all(runs).await;

    let mut failures = 0;
    for (document_id, result) in document_ids.iter().zip(results) {
        match result {
            Ok(document) => print_document(&document),
            Err(error) => {
                failures += 1;
                warn!(document_id, error = %error, "indexing failed");
                println!("[{document_id}] failed: {error}");
            }
        }
    }
    failures
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let app = App::open(&cli)?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        backend = ?cli.vector_backend,
        provider = %app.settings.embedding_provider,
        "docsearch boot"
    );

    let outcome = run(&app, cli.command).await;
    app.persist()?;
    outcome
}

async fn run(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Upload {
            owner,
            folder,
            title,
        } => {
            if folder.is_file() {
                let document = register_document(app.store.as_ref(), owner, &folder, title).await?;
                print_document(&document);
                return Ok(());
            }

            let report = register_folder(app.store.as_ref(), owner, &folder).await?;
            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
            }
            for document in &report.documents {
                print_document(document);
            }
            println!(
                "{} documents registered, {} skipped at {}",
                report.documents.len(),
                report.skipped_files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Index { document } => {
            let document_ids = match document {
                Some(document_id) => vec![document_id],
                None => app
                    .store
                    .documents()
                    .into_iter()
                    .filter(|document| document.status.accepts_indexing())
                    .map(|document| document.id)
                    .collect(),
            };

            if document_ids.is_empty() {
                println!("nothing to index");
                return Ok(());
            }

            info!(documents = document_ids.len(), "indexing documents");
            let total = document_ids.len();
            let failures = index_documents(app, document_ids).await;
            println!("{} indexed, {} failed", total - failures, failures);
        }
        Command::Search {
            owner,
            query,
            mode,
            threshold,
        } => {
            let engine = SearchEngine::new(
                Arc::clone(&app.store),
                Arc::clone(&app.index),
                Arc::clone(&app.embedder),
            );
            let response = engine
                .search(&SearchRequest {
                    query,
                    owner_id: owner,
                    mode,
                    threshold,
                })
                .await?;

            println!(
                "query: {} mode={} threshold={:.2}",
                response.query, response.mode, response.threshold
            );
            if response.groups.is_empty() {
                println!("no results");
            }
            for group in &response.groups {
                println!(
                    "document_id={} title={} best_score={:.3}",
                    group.document_id, group.title, group.best_score
                );
                for hit in &group.chunks {
                    println!(
                        "  chunk={} index={} score={:.3}",
                        hit.chunk_id, hit.chunk_index, hit.score
                    );
                    match &hit.highlight {
                        Some(highlight) => println!(
                            "    {}{}",
                            highlight.html,
                            if highlight.truncated { " …" } else { "" }
                        ),
                        None => println!("    {}", hit.text),
                    }
                }
            }
        }
        Command::Reindex { document } => {
            reset_for_reindex(app.store.as_ref(), app.index.as_ref(), document).await?;
            let failures = index_documents(app, vec![document]).await;
            if failures > 0 {
                anyhow::bail!("reindex of document {document} failed");
            }
        }
        Command::Delete { document } => {
            delete_document(app.store.as_ref(), app.index.as_ref(), document).await?;
            println!("document {document} deleted");
        }
        Command::Status { owner } => {
            let documents = app.store.documents_for_owner(owner).await?;
            if documents.is_empty() {
                println!("no documents for owner {owner}");
            }
            for document in &documents {
                print_document(document);
            }
        }
    }

    Ok(())
}
