//! Knowledge base management: create, list, rename, delete, bulk file
//! removal. Each operation keeps the metadata store, the vector collection,
//! and blob storage consistent with each other.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::collections::collection_name_for;
use crate::error::Result;
use crate::models::KnowledgeBase;
use crate::runtime::Services;

/// Create a knowledge base and its (empty) vector collection.
pub async fn create(services: &Services, username: &str, name: &str) -> Result<KnowledgeBase> {
    let kb = services.metadata.create_kb(username, name).await?;
    services
        .collections
        .create_collection(&collection_name_for(&kb.id))
        .await?;
    info!(kb = %kb.id, name = %kb.name, "created knowledge base");
    Ok(kb)
}

pub async fn list(services: &Services, username: &str) -> Result<Vec<KnowledgeBase>> {
    services.metadata.list_kbs(username).await
}

pub async fn rename(services: &Services, kb_id: &str, name: &str) -> Result<()> {
    services.metadata.rename_kb(kb_id, name).await
}

/// Delete a knowledge base: hide it immediately, then purge its collection,
/// file and page rows, and blobs. Straggler blob deletions are logged and
/// skipped rather than failing the operation.
pub async fn delete(services: &Services, kb_id: &str) -> Result<()> {
    services.metadata.soft_delete_kb(kb_id).await?;

    let file_ids = services.metadata.file_ids_for_kb(kb_id).await?;
    services
        .collections
        .drop_collection(&collection_name_for(kb_id))
        .await?;
    let blob_keys = services.metadata.delete_files(&file_ids).await?;
    for key in &blob_keys {
        if let Err(e) = services.blob.delete(key).await {
            warn!(key = %key, error = %e, "blob deletion failed");
        }
    }
    info!(kb = %kb_id, files = file_ids.len(), "deleted knowledge base");
    Ok(())
}

/// Remove a set of files from a knowledge base: vectors, metadata, blobs.
/// Ids that do not belong to the knowledge base are skipped. Returns the
/// number of files removed.
pub async fn delete_files(services: &Services, kb_id: &str, file_ids: &[String]) -> Result<u64> {
    let owned: HashSet<String> = services
        .metadata
        .file_ids_for_kb(kb_id)
        .await?
        .into_iter()
        .collect();
    let targets: Vec<String> = file_ids
        .iter()
        .filter(|id| owned.contains(*id))
        .cloned()
        .collect();
    if targets.is_empty() {
        return Ok(0);
    }

    services
        .collections
        .delete_by_files(&collection_name_for(kb_id), &targets)
        .await?;
    let blob_keys = services.metadata.delete_files(&targets).await?;
    for key in &blob_keys {
        if let Err(e) = services.blob.delete(key).await {
            warn!(key = %key, error = %e, "blob deletion failed");
        }
    }
    info!(kb = %kb_id, files = targets.len(), "deleted files");
    Ok(targets.len() as u64)
}
