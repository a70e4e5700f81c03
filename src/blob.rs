//! Blob storage for raw uploads and rendered page images.
//!
//! Two backends behind one trait: a local-filesystem store for single-node
//! setups and tests, and an S3-compatible store (AWS S3, MinIO) using the
//! REST API with AWS Signature V4 authentication. The S3 path uses only
//! pure-Rust signing (`hmac` + `sha2`), no C library dependencies.
//!
//! When `endpoint_url` is set (MinIO, LocalStack) requests are path-style
//! (`http://host/bucket/key`); otherwise virtual-hosted AWS addressing is
//! used. Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
//! and optionally `AWS_SESSION_TOKEN`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::BlobConfig;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Storage for opaque blobs addressed by key. Keys are slash-separated
/// paths (`files/<file_id>`, `pages/<page_id>.jpg`).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Produce a URL for reading the blob without credentials, valid for
    /// `ttl_secs`.
    async fn presign_get(&self, key: &str, ttl_secs: u64) -> Result<String>;
}

/// Build the configured backend.
pub fn from_config(config: &BlobConfig) -> Result<Arc<dyn BlobStore>> {
    match config.backend.as_str() {
        "fs" => Ok(Arc::new(FsBlobStore::new(config.root.clone()))),
        "s3" => {
            let creds = AwsCredentials::from_env()?;
            Ok(Arc::new(S3BlobStore::new(
                config.bucket.clone(),
                config.region.clone(),
                config.endpoint_url.clone(),
                creds,
            )))
        }
        other => Err(Error::Config(format!("unknown blob backend '{}'", other))),
    }
}

// ============================================================================
// Filesystem backend
// ============================================================================

/// Blobs as plain files under a root directory. Presigned URLs are `file://`
/// paths; the TTL is accepted for interface parity but local paths do not
/// expire.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound {
                kind: "blob",
                name: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn presign_get(&self, key: &str, _ttl_secs: u64) -> Result<String> {
        Ok(format!("file://{}", self.path_for(key).display()))
    }
}

// ============================================================================
// S3-compatible backend
// ============================================================================

/// AWS credentials loaded from environment variables.
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: String,
        secret_access_key: String,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            session_token,
        }
    }

    /// Load from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and
    /// optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::Config("AWS_ACCESS_KEY_ID environment variable not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            Error::Config("AWS_SECRET_ACCESS_KEY environment variable not set".into())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        Ok(Self::new(access_key_id, secret_access_key, session_token))
    }
}

pub struct S3BlobStore {
    bucket: String,
    region: String,
    /// Custom endpoint for S3-compatible services; switches to path-style
    /// addressing.
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        creds: AwsCredentials,
    ) -> Self {
        Self {
            bucket,
            region,
            endpoint_url,
            creds,
            client: reqwest::Client::new(),
        }
    }

    /// Scheme, host, and canonical URI for a key. Path-style when a custom
    /// endpoint is configured, virtual-hosted otherwise.
    fn addressing(&self, key: &str) -> (String, String, String) {
        let encoded_key: String = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        if let Some(ref endpoint) = self.endpoint_url {
            let scheme = if endpoint.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            let uri = format!("/{}/{}", uri_encode(&self.bucket), encoded_key);
            (scheme.to_string(), host, uri)
        } else {
            let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
            ("https".to_string(), host, format!("/{}", encoded_key))
        }
    }

    /// Sign a request with header-based SigV4 and return the prepared
    /// builder. The payload hash must cover the exact body sent.
    fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let (scheme, host, canonical_uri) = self.addressing(key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let url = format!("{}://{}{}", scheme, host, canonical_uri);
        let mut builder = self
            .client
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        builder
    }

    /// Build a presigned GET URL using SigV4 query-string authentication.
    /// Only the `host` header is signed and the payload is unsigned, the
    /// standard shape for browser-dereferenceable links.
    fn presign_url(&self, key: &str, ttl_secs: u64) -> String {
        let (scheme, host, canonical_uri) = self.addressing(key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);

        let mut query_params = vec![
            (
                "X-Amz-Algorithm".to_string(),
                "AWS4-HMAC-SHA256".to_string(),
            ),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.creds.access_key_id, credential_scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), ttl_secs.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = self.creds.session_token {
            query_params.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        query_params.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            canonical_uri, canonical_querystring, host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        format!(
            "{}://{}{}?{}&X-Amz-Signature={}",
            scheme, host, canonical_uri, canonical_querystring, signature
        )
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let payload_hash = hex_sha256(&bytes);
        let resp = self
            .signed_request(reqwest::Method::PUT, key, &payload_hash)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Blob(format!(
                "S3 PutObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let payload_hash = hex_sha256(b"");
        let resp = self
            .signed_request(reqwest::Method::GET, key, &payload_hash)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound {
                kind: "blob",
                name: key.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(Error::Blob(format!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let payload_hash = hex_sha256(b"");
        let resp = self
            .signed_request(reqwest::Method::DELETE, key, &payload_hash)
            .send()
            .await?;
        // S3 DeleteObject returns 204 for present and absent keys alike.
        if !resp.status().is_success() {
            return Err(Error::Blob(format!(
                "S3 DeleteObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            )));
        }
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl_secs: u64) -> Result<String> {
        Ok(self.presign_url(key, ttl_secs))
    }
}

// ============ AWS SigV4 helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986, keeping only unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
