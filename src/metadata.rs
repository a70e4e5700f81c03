//! Relational metadata: knowledge bases, files, and pages.
//!
//! Knowledge bases are soft-deleted so a delete can return immediately while
//! vector cleanup proceeds; files and pages are hard-deleted once their
//! vectors are gone. Page rows are unique per `(file_id, page_number)` and
//! inserts are idempotent, which keeps redelivered ingestion messages from
//! duplicating pages.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{FileRecord, KnowledgeBase, PageRecord};

/// Provenance of one page, resolved through the `pages -> files` join.
/// Everything the chat layer needs to cite a hit.
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub kb_id: String,
    pub original_name: String,
    /// Blob locator of the rendered page image.
    pub image_key: String,
    /// Blob locator of the original upload.
    pub file_blob_key: String,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ============================================================================
    // Knowledge bases
    // ============================================================================

    pub async fn create_kb(&self, username: &str, name: &str) -> Result<KnowledgeBase> {
        let now = chrono::Utc::now().timestamp();
        let kb = KnowledgeBase {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        sqlx::query(
            r#"
            INSERT INTO knowledge_bases (id, username, name, created_at, updated_at, is_deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            "#,
        )
        .bind(&kb.id)
        .bind(&kb.username)
        .bind(&kb.name)
        .bind(kb.created_at)
        .bind(kb.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(kb)
    }

    pub async fn get_kb(&self, kb_id: &str) -> Result<Option<KnowledgeBase>> {
        let row: Option<(String, String, String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, username, name, created_at, updated_at, is_deleted
            FROM knowledge_bases WHERE id = ?1 AND is_deleted = 0
            "#,
        )
        .bind(kb_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(kb_from_row))
    }

    pub async fn list_kbs(&self, username: &str) -> Result<Vec<KnowledgeBase>> {
        let rows: Vec<(String, String, String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, username, name, created_at, updated_at, is_deleted
            FROM knowledge_bases WHERE username = ?1 AND is_deleted = 0
            ORDER BY created_at, id
            "#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(kb_from_row).collect())
    }

    pub async fn rename_kb(&self, kb_id: &str, name: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE knowledge_bases SET name = ?1, updated_at = ?2
            WHERE id = ?3 AND is_deleted = 0
            "#,
        )
        .bind(name)
        .bind(now)
        .bind(kb_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                kind: "knowledge base",
                name: kb_id.to_string(),
            });
        }
        Ok(())
    }

    /// Mark a knowledge base deleted. The caller is responsible for purging
    /// its files, pages, and vectors afterwards.
    pub async fn soft_delete_kb(&self, kb_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE knowledge_bases SET is_deleted = 1, updated_at = ?1
            WHERE id = ?2 AND is_deleted = 0
            "#,
        )
        .bind(now)
        .bind(kb_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                kind: "knowledge base",
                name: kb_id.to_string(),
            });
        }
        Ok(())
    }

    // ============================================================================
    // Files and pages
    // ============================================================================

    pub async fn insert_file(
        &self,
        file_id: &str,
        kb_id: &str,
        original_name: &str,
        blob_key: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO files (id, kb_id, original_name, blob_key, created_at, is_deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            "#,
        )
        .bind(file_id)
        .bind(kb_id)
        .bind(original_name)
        .bind(blob_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let row: Option<(String, String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, kb_id, original_name, blob_key, created_at, is_deleted
            FROM files WHERE id = ?1 AND is_deleted = 0
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, kb_id, original_name, blob_key, created_at, is_deleted)| FileRecord {
            id,
            kb_id,
            original_name,
            blob_key,
            created_at,
            is_deleted: is_deleted != 0,
        }))
    }

    pub async fn list_files(&self, kb_id: &str) -> Result<Vec<FileRecord>> {
        let rows: Vec<(String, String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, kb_id, original_name, blob_key, created_at, is_deleted
            FROM files WHERE kb_id = ?1 AND is_deleted = 0
            ORDER BY created_at, id
            "#,
        )
        .bind(kb_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, kb_id, original_name, blob_key, created_at, is_deleted)| FileRecord {
                id,
                kb_id,
                original_name,
                blob_key,
                created_at,
                is_deleted: is_deleted != 0,
            })
            .collect())
    }

    pub async fn file_ids_for_kb(&self, kb_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM files WHERE kb_id = ?1")
            .bind(kb_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Record one rendered page. Re-inserting the same `(file_id, page_number)`
    /// is a no-op, so a redelivered message cannot duplicate pages.
    pub async fn add_page(
        &self,
        page_id: &str,
        file_id: &str,
        page_number: i64,
        image_key: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO pages (id, file_id, page_number, image_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(page_id)
        .bind(file_id)
        .bind(page_number)
        .bind(image_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_pages(&self, file_id: &str) -> Result<Vec<PageRecord>> {
        let rows: Vec<(String, String, i64, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, file_id, page_number, image_key, created_at
            FROM pages WHERE file_id = ?1 ORDER BY page_number
            "#,
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, file_id, page_number, image_key, created_at)| PageRecord {
                id,
                file_id,
                page_number,
                image_key,
                created_at,
            })
            .collect())
    }

    /// Resolve a page hit to its provenance. `None` when the page or its
    /// file is gone, which callers treat as a skippable hit rather than an
    /// error.
    pub async fn page_info(&self, page_id: &str) -> Result<Option<PageInfo>> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT f.kb_id, f.original_name, p.image_key, f.blob_key
            FROM pages p JOIN files f ON p.file_id = f.id
            WHERE p.id = ?1 AND f.is_deleted = 0
            "#,
        )
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(
            row.map(|(kb_id, original_name, image_key, file_blob_key)| PageInfo {
                kb_id,
                original_name,
                image_key,
                file_blob_key,
            }),
        )
    }

    /// Hard-delete file and page rows, returning the blob keys that should
    /// be removed from storage (page images plus the raw uploads).
    pub async fn delete_files(&self, file_ids: &[String]) -> Result<Vec<String>> {
        let mut blob_keys = Vec::new();
        let mut tx = self.pool.begin().await?;
        for file_id in file_ids {
            let page_keys: Vec<(String,)> =
                sqlx::query_as("SELECT image_key FROM pages WHERE file_id = ?1")
                    .bind(file_id)
                    .fetch_all(&mut *tx)
                    .await?;
            blob_keys.extend(page_keys.into_iter().map(|(k,)| k));

            let file_key: Option<(String,)> =
                sqlx::query_as("SELECT blob_key FROM files WHERE id = ?1")
                    .bind(file_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            blob_keys.extend(file_key.into_iter().map(|(k,)| k));

            sqlx::query("DELETE FROM pages WHERE file_id = ?1")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM files WHERE id = ?1")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(blob_keys)
    }
}

fn kb_from_row(row: (String, String, String, i64, i64, i64)) -> KnowledgeBase {
    let (id, username, name, created_at, updated_at, is_deleted) = row;
    KnowledgeBase {
        id,
        username,
        name,
        created_at,
        updated_at,
        is_deleted: is_deleted != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn setup() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            dir.path().join("test.sqlite").display()
        ))
        .unwrap()
        .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect_with(options)
            .await
            .unwrap();
        migrate::create_schema(&pool).await.unwrap();
        (dir, MetadataStore::new(pool))
    }

    #[tokio::test]
    async fn test_create_list_kbs_per_user() {
        let (_dir, store) = setup().await;
        let a = store.create_kb("alice", "papers").await.unwrap();
        store.create_kb("alice", "notes").await.unwrap();
        store.create_kb("bob", "papers").await.unwrap();

        let alices = store.list_kbs("alice").await.unwrap();
        assert_eq!(alices.len(), 2);
        assert!(alices.iter().any(|kb| kb.id == a.id));
        assert_eq!(store.list_kbs("bob").await.unwrap().len(), 1);
        assert!(store.list_kbs("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_kb() {
        let (_dir, store) = setup().await;
        let kb = store.create_kb("alice", "papers").await.unwrap();
        store.rename_kb(&kb.id, "archive").await.unwrap();

        let fetched = store.get_kb(&kb.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "archive");

        let err = store.rename_kb("missing", "x").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_soft_delete_hides_kb() {
        let (_dir, store) = setup().await;
        let kb = store.create_kb("alice", "papers").await.unwrap();
        store.soft_delete_kb(&kb.id).await.unwrap();

        assert!(store.get_kb(&kb.id).await.unwrap().is_none());
        assert!(store.list_kbs("alice").await.unwrap().is_empty());
        // A second delete is a not-found, not a silent success.
        assert!(store.soft_delete_kb(&kb.id).await.is_err());
    }

    #[tokio::test]
    async fn test_file_and_page_provenance() {
        let (_dir, store) = setup().await;
        let kb = store.create_kb("alice", "papers").await.unwrap();
        store
            .insert_file("f1", &kb.id, "report.pdf", "files/f1")
            .await
            .unwrap();
        store.add_page("f1_1", "f1", 1, "pages/f1_1.jpg").await.unwrap();
        store.add_page("f1_2", "f1", 2, "pages/f1_2.jpg").await.unwrap();
        // Redelivered message writes the same page again.
        store.add_page("f1_2", "f1", 2, "pages/f1_2.jpg").await.unwrap();

        assert_eq!(store.list_pages("f1").await.unwrap().len(), 2);

        let info = store.page_info("f1_2").await.unwrap().unwrap();
        assert_eq!(info.kb_id, kb.id);
        assert_eq!(info.original_name, "report.pdf");
        assert_eq!(info.image_key, "pages/f1_2.jpg");
        assert_eq!(info.file_blob_key, "files/f1");

        assert!(store.page_info("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_files_purges_and_reports_blobs() {
        let (_dir, store) = setup().await;
        let kb = store.create_kb("alice", "papers").await.unwrap();
        store
            .insert_file("f1", &kb.id, "a.pdf", "files/f1")
            .await
            .unwrap();
        store
            .insert_file("f2", &kb.id, "b.pdf", "files/f2")
            .await
            .unwrap();
        store.add_page("f1_1", "f1", 1, "pages/f1_1.jpg").await.unwrap();

        let blobs = store.delete_files(&["f1".to_string()]).await.unwrap();
        assert_eq!(blobs.len(), 2);
        assert!(blobs.contains(&"pages/f1_1.jpg".to_string()));
        assert!(blobs.contains(&"files/f1".to_string()));

        assert!(store.get_file("f1").await.unwrap().is_none());
        assert!(store.page_info("f1_1").await.unwrap().is_none());
        assert_eq!(store.file_ids_for_kb(&kb.id).await.unwrap(), vec!["f2"]);
    }
}
