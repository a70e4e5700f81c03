use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Blob-storage backend. Raw uploads and rendered page images both live here.
#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    /// `fs` (local directory) or `s3` (S3-compatible service such as MinIO).
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    /// Root directory for the `fs` backend.
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,
    /// Bucket name for the `s3` backend.
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (e.g. `http://localhost:9000`).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Lifetime of presigned retrieval URLs, in seconds.
    #[serde(default = "default_presign_ttl")]
    pub presign_ttl_secs: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            root: default_blob_root(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            presign_ttl_secs: default_presign_ttl(),
        }
    }
}

fn default_blob_backend() -> String {
    "fs".to_string()
}
fn default_blob_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_presign_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Number of log partitions. Order is only guaranteed within a partition.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Consumer group name; each group tracks its own committed offsets.
    #[serde(default = "default_group")]
    pub group: String,
    /// Poll interval while the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Namespace prefix for per-message lock keys.
    #[serde(default = "default_lock_namespace")]
    pub lock_namespace: String,
    /// Lock lease in seconds. A worker that dies mid-message holds the lock
    /// for at most this long before the message becomes retryable.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Retention of job progress records, in seconds.
    #[serde(default = "default_progress_ttl")]
    pub progress_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            group: default_group(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_namespace: default_lock_namespace(),
            lease_secs: default_lease_secs(),
            progress_ttl_secs: default_progress_ttl(),
        }
    }
}

fn default_partitions() -> u32 {
    4
}
fn default_group() -> String {
    "folio-workers".to_string()
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_lock_namespace() -> String {
    "message_lock".to_string()
}
fn default_lease_secs() -> u64 {
    100
}
fn default_progress_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Token-vector width. Every collection is created with this dimension
    /// and inserts are rejected on mismatch.
    #[serde(default = "default_dim")]
    pub dim: usize,
    /// HNSW construction breadth. Favors recall over build speed; the exact
    /// rerank stage corrects coarse-stage misses either way.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            ef_construction: default_ef_construction(),
        }
    }
}

fn default_dim() -> usize {
    128
}
fn default_ef_construction() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Candidates retrieved per query token in the coarse stage.
    #[serde(default = "default_coarse_width")]
    pub coarse_width: usize,
    /// Ceiling on concurrent rerank tasks.
    #[serde(default = "default_rerank_workers")]
    pub rerank_workers: usize,
    /// Results scoring below this are dropped during context assembly.
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Upper clamp on caller-requested `top_k`.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    /// Search deadline. Past it, the coarse stage stops early and unfinished
    /// rerank tasks are skipped.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            coarse_width: default_coarse_width(),
            rerank_workers: default_rerank_workers(),
            min_score: default_min_score(),
            max_top_k: default_max_top_k(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

fn default_coarse_width() -> usize {
    50
}
fn default_rerank_workers() -> usize {
    32
}
fn default_min_score() -> f32 {
    10.0
}
fn default_max_top_k() -> usize {
    30
}
fn default_deadline_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding service (`/embed_text`, `/embed_images`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8005".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config file {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

    match config.blob.backend.as_str() {
        "fs" => {}
        "s3" => {
            if config.blob.bucket.is_empty() {
                return Err(Error::Config(
                    "blob.bucket must be set when blob.backend is 's3'".to_string(),
                ));
            }
        }
        other => {
            return Err(Error::Config(format!(
                "unknown blob backend: '{}'. Must be fs or s3.",
                other
            )))
        }
    }

    if config.queue.partitions == 0 {
        return Err(Error::Config("queue.partitions must be >= 1".to_string()));
    }
    if config.queue.lease_secs == 0 {
        return Err(Error::Config("queue.lease_secs must be >= 1".to_string()));
    }

    if config.index.dim == 0 {
        return Err(Error::Config("index.dim must be > 0".to_string()));
    }

    if config.search.coarse_width == 0 {
        return Err(Error::Config("search.coarse_width must be >= 1".to_string()));
    }
    if config.search.rerank_workers == 0 {
        return Err(Error::Config("search.rerank_workers must be >= 1".to_string()));
    }
    if config.search.max_top_k == 0 {
        return Err(Error::Config("search.max_top_k must be >= 1".to_string()));
    }

    if config.embedding.endpoint.trim().is_empty() {
        return Err(Error::Config("embedding.endpoint must be set".to_string()));
    }

    Ok(config)
}

/// Starter config written by `folio init --write-config`.
pub fn starter_config() -> &'static str {
    r#"[db]
path = "./data/folio.sqlite"

[blob]
backend = "fs"
root = "./data/blobs"
# backend = "s3"
# bucket = "folio-pages"
# region = "us-east-1"
# endpoint_url = "http://localhost:9000"

[queue]
partitions = 4
group = "folio-workers"
poll_interval_ms = 500
lease_secs = 100

[index]
dim = 128
ef_construction = 500

[search]
coarse_width = 50
rerank_workers = 32
min_score = 10.0
max_top_k = 30

[embedding]
endpoint = "http://127.0.0.1:8005"
max_retries = 5
timeout_secs = 120
"#
}
