//! The embedding-model collaborator.
//!
//! The filter consumes embeddings through the [`Embedder`] trait only; the
//! model itself lives behind an HTTP service. Encoding must be deterministic
//! for identical input within a process lifetime.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use flywheel_shared::{FlywheelError, Result};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("flywheel/", env!("CARGO_PKG_VERSION"));

/// Converts text into a fixed-dimension embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Encode `text` into an embedding. Deterministic per input.
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimensionality of produced vectors.
    fn dimension(&self) -> usize;
}

// ---------------------------------------------------------------------------
// HTTP embedder
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EncodeRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EncodeResponse {
    embedding: Vec<f32>,
}

/// Client for a remote embedding service exposing `POST {text} -> {embedding}`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    dimension: usize,
}

impl HttpEmbedder {
    /// Build a client against the given encode endpoint.
    pub fn new(endpoint: impl Into<String>, dimension: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FlywheelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EncodeRequest { text })
            .send()
            .await
            .map_err(|e| FlywheelError::Network(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FlywheelError::Network(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }

        let parsed: EncodeResponse = response
            .json()
            .await
            .map_err(|e| FlywheelError::malformed(format!("embedding response: {e}")))?;

        if parsed.embedding.len() != self.dimension {
            return Err(FlywheelError::malformed(format!(
                "embedding has dimension {}, expected {}",
                parsed.embedding.len(),
                self.dimension
            )));
        }

        debug!(chars = text.len(), "text encoded");
        Ok(parsed.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ---------------------------------------------------------------------------
// Hash embedder
// ---------------------------------------------------------------------------

/// Deterministic token-hashing embedder for tests and offline runs.
///
/// Each whitespace token is hashed into a bucket; the bucket counts are
/// L2-normalized. Identical texts map to identical vectors, disjoint token
/// sets to orthogonal ones.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text.split_whitespace() {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().expect("8 digest bytes"))
                as usize
                % self.dimension;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
