//! Durable ingestion task queue.
//!
//! A partitioned, append-only message log backed by the shared database.
//! Producers append one message per file; consumer groups track a committed
//! offset per partition. Delivery order is guaranteed within a partition
//! only — consumers must never assume cross-partition ordering.
//!
//! Delivery is at-least-once from the log's point of view: a message stays
//! visible until some group member commits past it. The per-message lock
//! (see [`crate::locks`]) is what keeps competing consumers from processing
//! the same delivery twice.

use sqlx::SqlitePool;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::Result;
use crate::models::QueueMessage;

/// Handle to the message log. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    pool: SqlitePool,
    partitions: u32,
}

/// One delivered message plus its position in the log.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub partition: i64,
    pub offset: i64,
    pub priority: String,
    pub message: QueueMessage,
}

impl Delivered {
    /// Delivery-position token, used to key the per-message lock.
    pub fn token(&self) -> String {
        format!("{}:{}", self.partition, self.offset)
    }
}

impl Queue {
    pub fn new(pool: SqlitePool, partitions: u32) -> Self {
        Self { pool, partitions }
    }

    /// Partition for a message key. Stable across processes so one job's
    /// files always land in the same partition, preserving their order.
    pub fn partition_for(&self, key: &str) -> i64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i64
    }

    /// Append one message. Offset allocation and insertion are a single
    /// statement, so concurrent producers cannot collide.
    pub async fn enqueue(&self, message: &QueueMessage, priority: &str) -> Result<(i64, i64)> {
        let partition = self.partition_for(&message.task_id);
        let payload = serde_json::to_string(message)?;
        let now = chrono::Utc::now().timestamp();

        let offset: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queue_messages (partition, "offset", payload, priority, enqueued_at)
            SELECT ?1, COALESCE(MAX("offset") + 1, 0), ?2, ?3, ?4
            FROM queue_messages WHERE partition = ?1
            RETURNING "offset"
            "#,
        )
        .bind(partition)
        .bind(&payload)
        .bind(priority)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok((partition, offset))
    }

    /// Fetch the next uncommitted message for a group, oldest first.
    ///
    /// The same message is returned again until the group commits past it;
    /// the caller's lock discipline decides who actually processes it.
    pub async fn poll(&self, group: &str) -> Result<Option<Delivered>> {
        let row: Option<(i64, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT m.partition, m."offset", m.payload, m.priority
            FROM queue_messages m
            LEFT JOIN queue_offsets o
                ON o.group_name = ?1 AND o.partition = m.partition
            WHERE m."offset" >= COALESCE(o.committed, 0)
            ORDER BY m.enqueued_at, m.partition, m."offset"
            LIMIT 1
            "#,
        )
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((partition, offset, payload, priority)) => {
                let message: QueueMessage = serde_json::from_str(&payload)?;
                Ok(Some(Delivered {
                    partition,
                    offset,
                    priority,
                    message,
                }))
            }
        }
    }

    /// Commit a group's offset for one partition. Monotonic: committing an
    /// older offset than the stored one is a no-op.
    pub async fn commit(&self, group: &str, partition: i64, offset: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO queue_offsets (group_name, partition, committed, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(group_name, partition) DO UPDATE SET
                committed = MAX(queue_offsets.committed, excluded.committed),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(group)
        .bind(partition)
        .bind(offset + 1)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of messages the group has not committed past yet.
    pub async fn pending(&self, group: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM queue_messages m
            LEFT JOIN queue_offsets o
                ON o.group_name = ?1 AND o.partition = m.partition
            WHERE m."offset" >= COALESCE(o.committed, 0)
            "#,
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::FileMeta;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn setup() -> (tempfile::TempDir, SqlitePool) {
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
        (dir, pool)
    }

    fn message(task_id: &str, file_id: &str) -> QueueMessage {
        QueueMessage {
            task_id: task_id.to_string(),
            username: "alice".to_string(),
            knowledge_db_id: "kb-1".to_string(),
            file_meta: FileMeta {
                file_id: file_id.to_string(),
                minio_filename: format!("files/{}", file_id),
                original_filename: format!("{}.pdf", file_id),
            },
        }
    }

    #[tokio::test]
    async fn test_enqueue_assigns_sequential_offsets() {
        let (_dir, pool) = setup().await;
        let queue = Queue::new(pool, 4);

        let (p1, o1) = queue.enqueue(&message("job-a", "f1"), "5").await.unwrap();
        let (p2, o2) = queue.enqueue(&message("job-a", "f2"), "5").await.unwrap();

        // Same job -> same partition, consecutive offsets.
        assert_eq!(p1, p2);
        assert_eq!(o2, o1 + 1);
    }

    #[tokio::test]
    async fn test_poll_delivers_in_partition_order() {
        let (_dir, pool) = setup().await;
        let queue = Queue::new(pool, 1);

        queue.enqueue(&message("job-a", "f1"), "5").await.unwrap();
        queue.enqueue(&message("job-a", "f2"), "5").await.unwrap();

        let first = queue.poll("g").await.unwrap().unwrap();
        assert_eq!(first.message.file_meta.file_id, "f1");
        assert_eq!(first.priority, "5");

        // Uncommitted messages are redelivered.
        let again = queue.poll("g").await.unwrap().unwrap();
        assert_eq!(again.offset, first.offset);

        queue.commit("g", first.partition, first.offset).await.unwrap();
        let second = queue.poll("g").await.unwrap().unwrap();
        assert_eq!(second.message.file_meta.file_id, "f2");

        queue.commit("g", second.partition, second.offset).await.unwrap();
        assert!(queue.poll("g").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_groups_track_independent_offsets() {
        let (_dir, pool) = setup().await;
        let queue = Queue::new(pool, 1);

        queue.enqueue(&message("job-a", "f1"), "5").await.unwrap();
        let d = queue.poll("g1").await.unwrap().unwrap();
        queue.commit("g1", d.partition, d.offset).await.unwrap();

        assert!(queue.poll("g1").await.unwrap().is_none());
        assert!(queue.poll("g2").await.unwrap().is_some());
        assert_eq!(queue.pending("g1").await.unwrap(), 0);
        assert_eq!(queue.pending("g2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let (_dir, pool) = setup().await;
        let queue = Queue::new(pool, 1);

        queue.enqueue(&message("job-a", "f1"), "5").await.unwrap();
        queue.enqueue(&message("job-a", "f2"), "5").await.unwrap();

        queue.commit("g", 0, 1).await.unwrap();
        // A stale commit must not rewind the group.
        queue.commit("g", 0, 0).await.unwrap();
        assert!(queue.poll("g").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_message_payload_roundtrip() {
        let (_dir, pool) = setup().await;
        let queue = Queue::new(pool, 4);

        let sent = message("alice_8c1f", "f9");
        queue.enqueue(&sent, "9").await.unwrap();

        let got = queue.poll("g").await.unwrap().unwrap();
        assert_eq!(got.message.task_id, "alice_8c1f");
        assert_eq!(got.message.knowledge_db_id, "kb-1");
        assert_eq!(got.message.file_meta.original_filename, "f9.pdf");
        assert_eq!(got.priority, "9");
        assert_eq!(got.token(), format!("{}:{}", got.partition, got.offset));
    }
}
