use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::Result;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation. Shared by `folio init` and the test harness.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Knowledge-base / file / page metadata
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_bases (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            kb_id TEXT NOT NULL,
            original_name TEXT NOT NULL,
            blob_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (kb_id) REFERENCES knowledge_bases(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            image_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(file_id, page_number),
            FOREIGN KEY (file_id) REFERENCES files(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable message log with per-group committed offsets
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            partition INTEGER NOT NULL,
            "offset" INTEGER NOT NULL,
            payload TEXT NOT NULL,
            priority TEXT NOT NULL DEFAULT '5',
            enqueued_at INTEGER NOT NULL,
            PRIMARY KEY (partition, "offset")
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_offsets (
            group_name TEXT NOT NULL,
            partition INTEGER NOT NULL,
            committed INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (group_name, partition)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Lock leases and job progress (the shared coordination store)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_progress (
            key TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            total INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector collections: registry plus one row per token vector
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            dim INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            page_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_kb ON files(kb_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_file ON pages(file_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_collection_page ON vectors(collection, page_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_collection_file ON vectors(collection, file_id)")
        .execute(pool)
        .await?;

    Ok(())
}
