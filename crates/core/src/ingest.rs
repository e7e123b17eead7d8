use crate::error::{ExtractError, IndexingError};
use crate::extractor::FileFormat;
use crate::models::{Document, NewDocument};
use crate::traits::DocumentStore;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Recursively lists files with a supported extension, sorted by path.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        if FileFormat::from_path(entry.path()).is_some() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, std::io::Error> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Creates a pending document for `path`. The title defaults to the file name.
pub async fn register_document<S>(
    store: &S,
    owner_id: u64,
    path: &Path,
    title: Option<String>,
) -> Result<Document, IndexingError>
where
    S: DocumentStore + ?Sized,
{
    if FileFormat::from_path(path).is_none() {
        return Err(ExtractError::UnsupportedFormat(path.display().to_string()).into());
    }

    let checksum = digest_file(path).map_err(ExtractError::from)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let mut metadata = Map::new();
    metadata.insert("file_sha256".to_string(), Value::String(checksum));
    metadata.insert("original_filename".to_string(), Value::String(file_name.clone()));

    let title = title
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or(file_name);

    let document = store
        .create_document(NewDocument {
            owner_id,
            title,
            file_path: path.to_path_buf(),
            metadata,
        })
        .await?;

    info!(document_id = document.id, path = %path.display(), "registered document");
    Ok(document)
}

#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RegistrationReport {
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Registers every supported file under `folder`, skipping files that cannot be read.
pub async fn register_folder<S>(
    store: &S,
    owner_id: u64,
    folder: &Path,
) -> Result<RegistrationReport, IndexingError>
where
    S: DocumentStore + ?Sized,
{
    let files = discover_documents(folder);
    if files.is_empty() {
        return Err(IndexingError::NoDocuments(folder.to_path_buf()));
    }

    let mut report = RegistrationReport::default();
    for path in files {
        match register_document(store, owner_id, &path, None).await {
            Ok(document) => report.documents.push(document),
            Err(IndexingError::Store(error)) => return Err(error.into()),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "skipping file");
                report.skipped_files.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    Ok(report)
}
