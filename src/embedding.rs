//! Embedding collaborator abstraction and the HTTP implementation.
//!
//! The embedding model is a black box behind the [`Embedder`] trait: text or
//! page images in, one ordered token-vector sequence per input out. The
//! search engine and the ingestion worker only ever see the trait, so both
//! are testable with synthetic vectors.
//!
//! Also provides the BLOB codec used for vector rows:
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! The HTTP embedder retries transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// One token-vector sequence: N≥1 vectors of equal dimension for a single
/// page or query.
pub type TokenVectors = Vec<Vec<f32>>;

/// Trait for embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one token-vector sequence per input, in order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<TokenVectors>>;

    /// Embed a batch of page images (raw encoded bytes), one token-vector
    /// sequence per input, in order.
    async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<TokenVectors>>;
}

/// Embed a single query text.
///
/// Convenience wrapper around [`Embedder::embed_texts`] for the search path.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<TokenVectors> {
    let mut results = embedder.embed_texts(&[text.to_string()]).await?;
    if results.len() != 1 {
        return Err(Error::Embedding(format!(
            "expected 1 embedding, got {}",
            results.len()
        )));
    }
    Ok(results.remove(0))
}

// ============ HTTP Embedder ============

/// Embedding backend speaking the model server's HTTP protocol:
/// `POST {endpoint}/embed_text` with `{"inputs": [..strings..]}` and
/// `POST {endpoint}/embed_images` with `{"inputs": [..base64 images..]}`,
/// both answered with `{"embeddings": [[[f32; dim], ..], ..]}`.
pub struct HttpEmbedder {
    endpoint: String,
    client: reqwest::Client,
    max_retries: u32,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<TokenVectors>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client,
            max_retries: config.max_retries,
        })
    }

    /// POST with retry/backoff, returning the parsed token-vector sequences.
    async fn request(&self, path: &str, body: serde_json::Value) -> Result<Vec<TokenVectors>> {
        let url = format!("{}{}", self.endpoint, path);
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: EmbedResponse = response.json().await?;
                        return Ok(parsed.embeddings);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(Error::Embedding(format!(
                            "embedding service error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(Error::Embedding(format!(
                        "embedding service error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Embedding("embedding failed after retries".to_string())))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<TokenVectors>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "inputs": texts });
        let embeddings = self.request("/embed_text", body).await?;
        check_count(embeddings.len(), texts.len())?;
        Ok(embeddings)
    }

    async fn embed_images(&self, images: &[Vec<u8>]) -> Result<Vec<TokenVectors>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let encoded: Vec<String> = images
            .iter()
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
            .collect();
        let body = serde_json::json!({ "inputs": encoded });
        let embeddings = self.request("/embed_images", body).await?;
        check_count(embeddings.len(), images.len())?;
        Ok(embeddings)
    }
}

fn check_count(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::Embedding(format!(
            "embedding count mismatch: sent {} inputs, got {} sequences",
            expected, got
        )));
    }
    Ok(())
}

// ============ Vector BLOB codec ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing a BLOB
/// of `vec.len() × 4` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Reverses [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_blob_ignores_trailing_bytes() {
        let mut blob = vec_to_blob(&[1.0f32, 2.0]);
        blob.push(0xFF);
        assert_eq!(blob_to_vec(&blob), vec![1.0, 2.0]);
    }

    #[test]
    fn test_check_count_mismatch() {
        assert!(check_count(2, 3).is_err());
        assert!(check_count(3, 3).is_ok());
    }
}
