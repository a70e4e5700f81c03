//! Core data models used throughout Folio.
//!
//! These types represent the knowledge bases, files, pages, queue messages,
//! and search results that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A named, user-owned corpus of uploaded files. Maps 1:1 to one vector
/// collection (same id, normalized to a collection-safe name).
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    pub id: String,
    pub username: String,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_deleted: bool,
}

/// One uploaded file inside a knowledge base.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub kb_id: String,
    pub original_name: String,
    /// Locator of the raw upload in blob storage.
    pub blob_key: String,
    pub created_at: i64,
    pub is_deleted: bool,
}

/// One rasterized page of a file. Immutable once created.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub id: String,
    pub file_id: String,
    /// 1-based page number within the file.
    pub page_number: i64,
    /// Locator of the rendered page image in blob storage.
    pub image_key: String,
    pub created_at: i64,
}

/// Per-file metadata carried inside a queue message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    /// Blob locator of the raw upload.
    pub minio_filename: String,
    pub original_filename: String,
}

/// One ingestion message: exactly one file of one job. The wire shape is
/// fixed; external producers rely on these field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub task_id: String,
    pub username: String,
    pub knowledge_db_id: String,
    pub file_meta: FileMeta,
}

/// Job lifecycle states as stored in the progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Pollable progress of one ingestion job.
#[derive(Debug, Clone)]
pub struct JobProgress {
    pub status: JobStatus,
    pub total: i64,
    pub processed: i64,
    pub message: String,
}

/// One hit from the search engine. Transient, never persisted.
///
/// `file_id` and `page_number` are `None` for candidates whose token vectors
/// could not be retrieved (inconsistent state); such hits score 0.0.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub page_id: String,
    pub file_id: Option<String>,
    pub page_number: Option<i64>,
    pub score: f32,
}

/// A retrieval result resolved for the chat layer: provenance plus
/// time-bounded URLs for the page image and the original file.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSource {
    pub score: f32,
    pub knowledge_base_id: String,
    pub filename: String,
    pub image_url: String,
    pub file_url: String,
}
