//! Ingestion: job submission and the worker loop.
//!
//! A job is one user action ("add these files to this knowledge base") and
//! fans out to one queue message per file. Workers poll the shared log,
//! guard each delivery with a lease so concurrent workers never process the
//! same message twice, and acknowledge before processing: a message that
//! fails never comes back, the failure lands in the job's status instead.
//! Dying mid-message therefore loses that message's work, which is the
//! accepted trade for never double-ingesting a file.

use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collections::collection_name_for;
use crate::error::{Error, Result};
use crate::models::{FileMeta, JobStatus, QueueMessage};
use crate::rasterize;
use crate::runtime::Services;

/// One upload handed to [`submit_job`].
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Stage a job: store the raw uploads, enqueue one message per file, and
/// create the job's progress record. Returns the job id pollers watch.
pub async fn submit_job(
    services: &Services,
    username: &str,
    kb_id: &str,
    uploads: Vec<Upload>,
    priority: &str,
) -> Result<String> {
    if uploads.is_empty() {
        return Err(Error::Config("cannot submit a job with no files".into()));
    }
    let Some(_kb) = services.metadata.get_kb(kb_id).await? else {
        return Err(Error::NotFound {
            kind: "knowledge base",
            name: kb_id.to_string(),
        });
    };

    let job_id = format!("{}_{}", username, Uuid::new_v4());
    // The progress record must exist before a worker can pick up the first
    // message.
    services
        .progress
        .init_job(&job_id, uploads.len() as i64)
        .await?;

    for upload in uploads {
        let file_id = Uuid::new_v4().to_string();
        let blob_key = format!("files/{}", file_id);
        services
            .blob
            .put(&blob_key, upload.bytes, "application/octet-stream")
            .await?;
        services
            .metadata
            .insert_file(&file_id, kb_id, &upload.filename, &blob_key)
            .await?;

        let message = QueueMessage {
            task_id: job_id.clone(),
            username: username.to_string(),
            knowledge_db_id: kb_id.to_string(),
            file_meta: FileMeta {
                file_id,
                minio_filename: blob_key,
                original_filename: upload.filename,
            },
        };
        let (partition, offset) = services.queue.enqueue(&message, priority).await?;
        info!(
            job = %job_id,
            file = %message.file_meta.file_id,
            partition,
            offset,
            "enqueued file"
        );
    }

    Ok(job_id)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerOptions {
    /// Process until the queue is empty, then return instead of idling.
    pub drain: bool,
}

/// The consumer loop. Runs until the process is stopped, or until the queue
/// drains when [`WorkerOptions::drain`] is set.
pub async fn run_worker(services: &Services, opts: WorkerOptions) -> Result<()> {
    let group = services.config.queue.group.clone();
    let poll_interval = Duration::from_millis(services.config.queue.poll_interval_ms);
    let lock_namespace = services.config.queue.lock_namespace.clone();
    let lease_secs = services.config.queue.lease_secs;
    info!(group = %group, drain = opts.drain, "worker started");

    loop {
        let Some(delivered) = services.queue.poll(&group).await? else {
            if opts.drain {
                info!("queue drained, worker stopping");
                return Ok(());
            }
            // Idle housekeeping: clear lapsed leases and expired job records.
            services.locks.sweep_expired().await?;
            services.progress.sweep_expired().await?;
            tokio::time::sleep(poll_interval).await;
            continue;
        };

        let lock_key = format!("{}:{}", lock_namespace, delivered.token());
        // Fast-path peek; only the atomic acquire decides ownership.
        if services.locks.held(&lock_key).await?
            || !services.locks.try_acquire(&lock_key, lease_secs).await?
        {
            // Another worker holds this delivery; it will commit past it.
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        // Acknowledge before processing. At-most-once: a failed message is
        // not redelivered, the failure is recorded on the job instead.
        services
            .queue
            .commit(&group, delivered.partition, delivered.offset)
            .await?;

        let job_id = delivered.message.task_id.clone();
        if let Err(e) = process_message(services, &delivered.message).await {
            error!(
                job = %job_id,
                file = %delivered.message.file_meta.file_id,
                error = %e,
                "file ingestion failed"
            );
            if let Err(status_err) = services
                .progress
                .set_status(&job_id, JobStatus::Failed, &e.to_string())
                .await
            {
                warn!(job = %job_id, error = %status_err, "could not record job failure");
            }
        }
        services.locks.release(&lock_key).await?;
    }
}

/// Ingest one file end to end: fetch, rasterize, embed, store.
async fn process_message(services: &Services, message: &QueueMessage) -> Result<()> {
    let meta = &message.file_meta;
    info!(
        job = %message.task_id,
        file = %meta.file_id,
        name = %meta.original_filename,
        "processing file"
    );

    let bytes = services.blob.get(&meta.minio_filename).await?;

    let filename = meta.original_filename.clone();
    let pages =
        tokio::task::spawn_blocking(move || rasterize::rasterize(&bytes, &filename)).await??;

    // Vectors must have somewhere to land before the first insert.
    let collection = collection_name_for(&message.knowledge_db_id);
    if !services.collections.exists(&collection).await? {
        services.collections.create_collection(&collection).await?;
    }

    // One embedding call per file, all pages batched.
    let images: Vec<Vec<u8>> = pages.iter().map(|p| p.bytes.clone()).collect();
    let embeddings = services.embedder.embed_images(&images).await?;
    if embeddings.len() != pages.len() {
        return Err(Error::Embedding(format!(
            "embedding count {} does not match page count {}",
            embeddings.len(),
            pages.len()
        )));
    }

    for (page, vectors) in pages.iter().zip(embeddings.iter()) {
        let page_id = format!("{}_{}", meta.file_id, page.page_number);
        let image_key = format!("pages/{}.{}", page_id, image_ext(page.content_type));
        services
            .blob
            .put(&image_key, page.bytes.clone(), page.content_type)
            .await?;
        services
            .metadata
            .add_page(&page_id, &meta.file_id, page.page_number, &image_key)
            .await?;
        services
            .collections
            .insert_vectors(&collection, &page_id, &meta.file_id, page.page_number, vectors)
            .await?;
    }

    let (processed, total) = services.progress.increment_processed(&message.task_id).await?;
    if processed >= total {
        // Only a cleanly processing job flips to completed; a job that
        // already failed keeps its failure.
        if let Some(progress) = services.progress.get_progress(&message.task_id).await? {
            if progress.status == JobStatus::Processing {
                services
                    .progress
                    .set_status(&message.task_id, JobStatus::Completed, "")
                    .await?;
                info!(job = %message.task_id, total, "job completed");
            }
        }
    }
    Ok(())
}

fn image_ext(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        _ => "jpg",
    }
}
