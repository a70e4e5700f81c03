//! Error taxonomy shared across the pipeline.
//!
//! Components return [`Error`] to their callers; only the ingestion worker
//! and the search engine translate errors into job-status or search-result
//! shapes. The binary wraps everything in `anyhow` at the CLI boundary.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding service error: {0}")]
    Embedding(String),

    #[error("blob storage error: {0}")]
    Blob(String),

    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("pdf rendering error: {0}")]
    Pdf(String),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// True for the not-found class, which CRUD callers treat as an explicit
    /// result rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
