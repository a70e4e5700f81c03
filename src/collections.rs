//! Vector collections: durable token vectors plus per-collection ANN graphs.
//!
//! Each knowledge base owns one collection. The durable form is rows in the
//! `vectors` table (one row per token vector, embeddings as little-endian
//! f32 blobs); the searchable form is an in-memory [`TokenIndex`] built
//! lazily from those rows.
//!
//! Several processes can share the database, so every mutation bumps the
//! collection's `version` in the registry. A cached graph whose version no
//! longer matches the registry is rebuilt before the next search; a process
//! applying its own mutation keeps its graph current in place when it holds
//! the immediately preceding version.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::ann::TokenIndex;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};

/// Collection name for a knowledge base id. Hyphens are not valid in
/// collection names, so they become underscores; the prefix pins the
/// embedding model family the collection was built with.
pub fn collection_name_for(kb_id: &str) -> String {
    format!("colqwen{}", kb_id.replace('-', "_"))
}

struct CachedGraph {
    /// Registry version the graph was built at (or advanced to).
    version: i64,
    index: Arc<Mutex<TokenIndex>>,
}

pub struct CollectionManager {
    pool: SqlitePool,
    dim: usize,
    ef_construction: usize,
    graphs: RwLock<HashMap<String, CachedGraph>>,
}

impl CollectionManager {
    pub fn new(pool: SqlitePool, dim: usize, ef_construction: usize) -> Self {
        Self {
            pool,
            dim,
            ef_construction,
            graphs: RwLock::new(HashMap::new()),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    // ============================================================================
    // Registry operations
    // ============================================================================

    /// Create a collection, destructively replacing any existing one of the
    /// same name. The version still advances across the reset so other
    /// processes drop their stale graphs.
    pub async fn create_collection(&self, name: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let old: Option<(i64,)> = sqlx::query_as("SELECT version FROM collections WHERE name = ?1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        let version = old.map(|(v,)| v).unwrap_or(0) + 1;

        sqlx::query("DELETE FROM vectors WHERE collection = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO collections (name, dim, version, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(self.dim as i64)
        .bind(version)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut graphs = self.graphs.write().await;
        graphs.insert(
            name.to_string(),
            CachedGraph {
                version,
                index: Arc::new(Mutex::new(TokenIndex::new(self.dim, self.ef_construction))),
            },
        );
        info!(collection = name, "created collection");
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM collections WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Remove a collection and all its vectors. Returns whether a collection
    /// was actually dropped; dropping one that does not exist is a no-op.
    pub async fn drop_collection(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE collection = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM collections WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.graphs.write().await.remove(name);
        let dropped = result.rows_affected() > 0;
        if dropped {
            info!(collection = name, "dropped collection");
        }
        Ok(dropped)
    }

    // ============================================================================
    // Vector writes
    // ============================================================================

    /// Store one page's token vectors and fold them into the cached graph.
    pub async fn insert_vectors(
        &self,
        collection: &str,
        page_id: &str,
        file_id: &str,
        page_number: i64,
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT dim FROM collections WHERE name = ?1")
            .bind(collection)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((dim,)) = row else {
            return Err(Error::NotFound {
                kind: "collection",
                name: collection.to_string(),
            });
        };

        for vector in vectors {
            if vector.len() != dim as usize {
                return Err(Error::DimensionMismatch {
                    expected: dim as usize,
                    got: vector.len(),
                });
            }
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, page_id, file_id, page_number, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(collection)
            .bind(page_id)
            .bind(file_id)
            .bind(page_number)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        let (new_version,): (i64,) = sqlx::query_as(
            "UPDATE collections SET version = version + 1 WHERE name = ?1 RETURNING version",
        )
        .bind(collection)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        // Keep our own graph current when no other writer slipped in
        // between; otherwise evict and let the next search rebuild.
        let mut graphs = self.graphs.write().await;
        if let Some(cached) = graphs.get_mut(collection) {
            if cached.version + 1 == new_version {
                let mut index = cached.index.lock().await;
                for vector in vectors {
                    index.insert(page_id, file_id, vector.clone())?;
                }
                cached.version = new_version;
            } else {
                debug!(collection, "graph stale after concurrent write, evicting");
                graphs.remove(collection);
            }
        }
        Ok(())
    }

    /// Remove all vectors belonging to the given files. Returns the number
    /// of vector rows deleted.
    pub async fn delete_by_files(&self, collection: &str, file_ids: &[String]) -> Result<u64> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;
        for file_id in file_ids {
            let result =
                sqlx::query("DELETE FROM vectors WHERE collection = ?1 AND file_id = ?2")
                    .bind(collection)
                    .bind(file_id)
                    .execute(&mut *tx)
                    .await?;
            deleted += result.rows_affected();
        }
        let new_version: Option<(i64,)> = sqlx::query_as(
            "UPDATE collections SET version = version + 1 WHERE name = ?1 RETURNING version",
        )
        .bind(collection)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        if let Some((new_version,)) = new_version {
            let mut graphs = self.graphs.write().await;
            if let Some(cached) = graphs.get_mut(collection) {
                if cached.version + 1 == new_version {
                    let gone: HashSet<String> = file_ids.iter().cloned().collect();
                    cached.index.lock().await.tombstone_files(&gone);
                    cached.version = new_version;
                } else {
                    graphs.remove(collection);
                }
            }
        }
        Ok(deleted)
    }

    // ============================================================================
    // Reads
    // ============================================================================

    /// Load one page's token vectors with their file provenance, in the
    /// order they were inserted. A page with no stored vectors yields an
    /// empty matrix and no provenance.
    pub async fn page_vectors(
        &self,
        collection: &str,
        page_id: &str,
    ) -> Result<(Vec<Vec<f32>>, Option<(String, i64)>)> {
        let rows: Vec<(Vec<u8>, String, i64)> = sqlx::query_as(
            r#"
            SELECT embedding, file_id, page_number FROM vectors
            WHERE collection = ?1 AND page_id = ?2
            ORDER BY id
            "#,
        )
        .bind(collection)
        .bind(page_id)
        .fetch_all(&self.pool)
        .await?;

        let meta = rows
            .first()
            .map(|(_, file_id, page_number)| (file_id.clone(), *page_number));
        let vectors = rows.iter().map(|(blob, _, _)| blob_to_vec(blob)).collect();
        Ok((vectors, meta))
    }

    /// Coarse ANN retrieval over the collection's graph, rebuilding it
    /// first if the registry version has moved.
    pub async fn coarse_candidates(
        &self,
        collection: &str,
        query_vectors: &[Vec<f32>],
        width: usize,
    ) -> Result<Vec<String>> {
        let index = self.ensure_graph(collection).await?;
        let mut guard = index.lock().await;
        guard.coarse_candidates(query_vectors, width)
    }

    /// Return a graph no older than the registry version, building it from
    /// the vectors table if the cache is missing or stale.
    async fn ensure_graph(&self, collection: &str) -> Result<Arc<Mutex<TokenIndex>>> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT version, dim FROM collections WHERE name = ?1")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        let Some((version, dim)) = row else {
            return Err(Error::NotFound {
                kind: "collection",
                name: collection.to_string(),
            });
        };

        {
            let graphs = self.graphs.read().await;
            if let Some(cached) = graphs.get(collection) {
                if cached.version == version {
                    return Ok(cached.index.clone());
                }
            }
        }

        let rows: Vec<(String, String, Vec<u8>)> = sqlx::query_as(
            "SELECT page_id, file_id, embedding FROM vectors WHERE collection = ?1 ORDER BY id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        debug!(collection, version, vectors = rows.len(), "rebuilding graph");
        let mut index = TokenIndex::new(dim as usize, self.ef_construction);
        for (page_id, file_id, blob) in &rows {
            index.insert(page_id, file_id, blob_to_vec(blob))?;
        }

        let index = Arc::new(Mutex::new(index));
        let mut graphs = self.graphs.write().await;
        graphs.insert(
            collection.to_string(),
            CachedGraph {
                version,
                index: index.clone(),
            },
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn pool_in(dir: &tempfile::TempDir) -> SqlitePool {
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
        pool
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_collection_naming() {
        assert_eq!(
            collection_name_for("0a1b-2c3d-4e5f"),
            "colqwen0a1b_2c3d_4e5f"
        );
        assert_eq!(collection_name_for("plain"), "colqwenplain");
    }

    #[tokio::test]
    async fn test_create_is_a_destructive_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CollectionManager::new(pool_in(&dir).await, 4, 64);

        mgr.create_collection("c1").await.unwrap();
        mgr.insert_vectors("c1", "p1", "f1", 1, &[unit(4, 0)])
            .await
            .unwrap();
        mgr.create_collection("c1").await.unwrap();

        assert!(mgr.exists("c1").await.unwrap());
        let (vectors, meta) = mgr.page_vectors("c1", "p1").await.unwrap();
        assert!(vectors.is_empty());
        assert!(meta.is_none());
    }

    #[tokio::test]
    async fn test_insert_and_read_back_page_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CollectionManager::new(pool_in(&dir).await, 4, 64);
        mgr.create_collection("c1").await.unwrap();

        mgr.insert_vectors("c1", "f1_2", "f1", 2, &[unit(4, 0), unit(4, 1)])
            .await
            .unwrap();

        let (vectors, meta) = mgr.page_vectors("c1", "f1_2").await.unwrap();
        assert_eq!(vectors, vec![unit(4, 0), unit(4, 1)]);
        assert_eq!(meta, Some(("f1".to_string(), 2)));
    }

    #[tokio::test]
    async fn test_insert_into_missing_collection_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CollectionManager::new(pool_in(&dir).await, 4, 64);
        let err = mgr
            .insert_vectors("ghost", "p1", "f1", 1, &[unit(4, 0)])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_coarse_candidates_through_graph() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CollectionManager::new(pool_in(&dir).await, 4, 64);
        mgr.create_collection("c1").await.unwrap();
        mgr.insert_vectors("c1", "p1", "f1", 1, &[unit(4, 0)])
            .await
            .unwrap();
        mgr.insert_vectors("c1", "p2", "f1", 2, &[unit(4, 2)])
            .await
            .unwrap();

        let pool = mgr.coarse_candidates("c1", &[unit(4, 2)], 1).await.unwrap();
        assert_eq!(pool, vec!["p2"]);

        let err = mgr
            .coarse_candidates("ghost", &[unit(4, 2)], 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stale_graph_rebuilds_after_foreign_write() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        let ours = CollectionManager::new(pool.clone(), 4, 64);
        let theirs = CollectionManager::new(pool, 4, 64);

        ours.create_collection("c1").await.unwrap();
        ours.insert_vectors("c1", "p1", "f1", 1, &[unit(4, 0)])
            .await
            .unwrap();
        // Warm our graph.
        assert_eq!(
            ours.coarse_candidates("c1", &[unit(4, 0)], 5).await.unwrap(),
            vec!["p1"]
        );

        // Another process writes the same collection.
        theirs
            .insert_vectors("c1", "p2", "f2", 1, &[unit(4, 1)])
            .await
            .unwrap();

        // The version moved, so our next search rebuilds and sees p2.
        let hits = ours.coarse_candidates("c1", &[unit(4, 1)], 1).await.unwrap();
        assert_eq!(hits, vec!["p2"]);
    }

    #[tokio::test]
    async fn test_delete_by_files_hides_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CollectionManager::new(pool_in(&dir).await, 4, 64);
        mgr.create_collection("c1").await.unwrap();
        mgr.insert_vectors("c1", "p1", "f1", 1, &[unit(4, 0), unit(4, 1)])
            .await
            .unwrap();
        mgr.insert_vectors("c1", "p2", "f2", 1, &[unit(4, 2)])
            .await
            .unwrap();

        let deleted = mgr
            .delete_by_files("c1", &["f1".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let pool = mgr.coarse_candidates("c1", &[unit(4, 0)], 5).await.unwrap();
        assert_eq!(pool, vec!["p2"]);
        let (vectors, _) = mgr.page_vectors("c1", "p1").await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_drop_collection_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CollectionManager::new(pool_in(&dir).await, 4, 64);
        mgr.create_collection("c1").await.unwrap();
        assert!(mgr.drop_collection("c1").await.unwrap());
        assert!(!mgr.exists("c1").await.unwrap());
        // Dropping again reports that nothing was there.
        assert!(!mgr.drop_collection("c1").await.unwrap());
    }
}
