//! Job progress tracking shared by every consumer instance.
//!
//! One record per ingestion job, keyed `task:{job_id}`, holding the fields
//! pollers read: status, total, processed, message. Records are created with
//! a fixed retention window and reads treat expired rows as absent, so a
//! finished (or abandoned) job disappears on its own. The retention clock is
//! set once at creation and is not extended by later writes.
//!
//! `increment_processed` is the one operation that must be an atomic
//! read-modify-write: files of a job complete concurrently on different
//! workers and the counter must increase monotonically toward `total`.

use sqlx::SqlitePool;

use crate::error::{Error, Result};
use crate::models::{JobProgress, JobStatus};

fn progress_key(job_id: &str) -> String {
    format!("task:{}", job_id)
}

#[derive(Clone)]
pub struct ProgressStore {
    pool: SqlitePool,
    ttl_secs: u64,
}

impl ProgressStore {
    pub fn new(pool: SqlitePool, ttl_secs: u64) -> Self {
        Self { pool, ttl_secs }
    }

    /// Create the record for a freshly enqueued job: `processing`, zero
    /// progress, retention window started. Replaces any previous record
    /// under the same id.
    pub async fn init_job(&self, job_id: &str, total: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO job_progress (key, status, total, processed, message, expires_at)
            VALUES (?1, ?2, ?3, 0, '', ?4)
            "#,
        )
        .bind(progress_key(job_id))
        .bind(JobStatus::Processing.as_str())
        .bind(total)
        .bind(now + self.ttl_secs as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read a job's progress. Expired or unknown jobs read as `None`.
    pub async fn get_progress(&self, job_id: &str) -> Result<Option<JobProgress>> {
        let now = chrono::Utc::now().timestamp();
        let row: Option<(String, i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT status, total, processed, message
            FROM job_progress WHERE key = ?1 AND expires_at > ?2
            "#,
        )
        .bind(progress_key(job_id))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(status, total, processed, message)| {
            JobStatus::parse(&status).map(|status| JobProgress {
                status,
                total,
                processed,
                message,
            })
        }))
    }

    /// Transition a job's status, optionally attaching a message. The
    /// retention window is left untouched.
    pub async fn set_status(&self, job_id: &str, status: JobStatus, message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE job_progress SET status = ?1, message = ?2
            WHERE key = ?3 AND expires_at > ?4
            "#,
        )
        .bind(status.as_str())
        .bind(message)
        .bind(progress_key(job_id))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically bump `processed` and return `(processed, total)` after the
    /// bump. Errors with not-found if the job's record is gone (expired or
    /// never created).
    pub async fn increment_processed(&self, job_id: &str) -> Result<(i64, i64)> {
        let now = chrono::Utc::now().timestamp();
        let row: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE job_progress SET processed = processed + 1
            WHERE key = ?1 AND expires_at > ?2
            RETURNING processed, total
            "#,
        )
        .bind(progress_key(job_id))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound {
            kind: "job",
            name: job_id.to_string(),
        })
    }

    /// Drop expired progress rows. Called opportunistically.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("DELETE FROM job_progress WHERE expires_at <= ?1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn setup() -> (tempfile::TempDir, ProgressStore) {
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
        (dir, ProgressStore::new(pool, 3600))
    }

    #[tokio::test]
    async fn test_init_then_get() {
        let (_dir, store) = setup().await;
        store.init_job("job-1", 3).await.unwrap();

        let p = store.get_progress("job-1").await.unwrap().unwrap();
        assert_eq!(p.status, JobStatus::Processing);
        assert_eq!(p.total, 3);
        assert_eq!(p.processed, 0);
        assert!(p.message.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_reads_as_absent() {
        let (_dir, store) = setup().await;
        assert!(store.get_progress("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_is_atomic_and_monotonic() {
        let (_dir, store) = setup().await;
        store.init_job("job-1", 3).await.unwrap();

        let (a, b, c) = tokio::join!(
            store.increment_processed("job-1"),
            store.increment_processed("job-1"),
            store.increment_processed("job-1")
        );
        let mut seen = vec![a.unwrap().0, b.unwrap().0, c.unwrap().0];
        seen.sort_unstable();
        // Three concurrent increments observe three distinct values.
        assert_eq!(seen, vec![1, 2, 3]);

        let p = store.get_progress("job-1").await.unwrap().unwrap();
        assert_eq!(p.processed, 3);
        assert_eq!(p.total, 3);
    }

    #[tokio::test]
    async fn test_increment_missing_job_is_not_found() {
        let (_dir, store) = setup().await;
        let err = store.increment_processed("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (_dir, store) = setup().await;
        store.init_job("job-1", 1).await.unwrap();

        store
            .set_status("job-1", JobStatus::Failed, "embedding service error 503")
            .await
            .unwrap();

        let p = store.get_progress("job-1").await.unwrap().unwrap();
        assert_eq!(p.status, JobStatus::Failed);
        assert_eq!(p.message, "embedding service error 503");
    }

    #[tokio::test]
    async fn test_expired_record_is_invisible_and_swept() {
        let (_dir, store) = setup().await;
        let short = ProgressStore::new(store.pool.clone(), 0);
        short.init_job("job-1", 1).await.unwrap();

        assert!(store.get_progress("job-1").await.unwrap().is_none());
        assert!(store.increment_processed("job-1").await.is_err());
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
    }
}
