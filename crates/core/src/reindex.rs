use crate::error::{IndexingError, Result};
use crate::models::{Document, DocumentStatus};
use crate::traits::{DocumentStore, VectorIndex};
use tracing::info;

/// Removes the chunk points, the mean-vector point and the chunk rows of a document. Safe to
/// call when nothing was indexed. Returns how many chunk rows were removed.
pub(crate) async fn discard_indexed_state<S, V>(
    store: &S,
    index: &V,
    document_id: u64,
) -> Result<usize>
where
    S: DocumentStore + ?Sized,
    V: VectorIndex + ?Sized,
{
    index.delete_by_document(document_id).await?;
    index.delete_document_vector(document_id).await?;
    Ok(store.delete_chunks(document_id).await?)
}

/// Drops the document's points and chunk rows and puts it back to `pending`. The caller
/// decides when to run the pipeline again.
pub async fn reset_for_reindex<S, V>(store: &S, index: &V, document_id: u64) -> Result<Document>
where
    S: DocumentStore + ?Sized,
    V: VectorIndex + ?Sized,
{
    let mut document = store
        .get_document(document_id)
        .await?
        .ok_or(IndexingError::NotFound(document_id))?;

    let removed = discard_indexed_state(store, index, document_id).await?;

    document.status = DocumentStatus::Pending;
    document.progress = 0;
    document.content_text.clear();
    store.save_document(&document).await?;

    info!(document_id, removed_chunks = removed, "document reset for reindex");
    Ok(document)
}

/// Removes the document row together with its chunks and vectors.
pub async fn delete_document<S, V>(store: &S, index: &V, document_id: u64) -> Result<()>
where
    S: DocumentStore + ?Sized,
    V: VectorIndex + ?Sized,
{
    if store.get_document(document_id).await?.is_none() {
        return Err(IndexingError::NotFound(document_id));
    }

    discard_indexed_state(store, index, document_id).await?;
    store.delete_document(document_id).await?;

    info!(document_id, "document deleted");
    Ok(())
}
