//! Embedding client abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`RemoteProvider`]** — calls an OpenAI-compatible embeddings endpoint
//!   with batching, retry, and backoff; optional vision endpoint for images.
//! - **[`MockProvider`]** — deterministic hashed bag-of-words vectors for
//!   tests and offline development.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB encoding
//!   for SQLite storage
//!
//! A single process uses a single active embedding configuration at a time;
//! every vector stored in the graph carries that configuration's dimension
//! and the graph facade rejects mismatches.
//!
//! # Retry Strategy
//!
//! The remote provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{KgError, KgResult};

/// Trait for embedding backends.
///
/// Batching is internal to the implementation; callers hand over the whole
/// batch and receive vectors in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch of texts. One vector per input, same order.
    async fn embed_batch(&self, texts: &[String]) -> KgResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_text(&self, text: &str) -> KgResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| KgError::fatal("empty embedding response"))
    }

    /// Embed raw image bytes. Only available when the provider has a
    /// vision endpoint configured.
    async fn embed_image(&self, _bytes: &[u8]) -> KgResult<Vec<f32>> {
        Err(KgError::fatal("provider has no vision endpoint"))
    }
}

/// Create the provider selected by configuration.
pub fn create_provider(config: &EmbeddingConfig) -> KgResult<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "remote" => Ok(Box::new(RemoteProvider::new(config)?)),
        "mock" => Ok(Box::new(MockProvider::new(
            config.dims.unwrap_or(MockProvider::DEFAULT_DIMS),
        ))),
        other => Err(KgError::Validation(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Remote Provider ============

/// Embedding provider calling an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteProvider {
    model: String,
    dims: usize,
    base_url: String,
    api_key: Option<String>,
    vision: bool,
    max_retries: u32,
    timeout: Duration,
}

impl RemoteProvider {
    pub fn new(config: &EmbeddingConfig) -> KgResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| KgError::Validation("embedding.model required for remote provider".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| KgError::Validation("embedding.dims required for remote provider".into()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                KgError::Validation(format!("environment variable {} not set", var))
            })?),
            None => None,
        };

        Ok(Self {
            model,
            dims,
            base_url,
            api_key,
            vision: config.vision,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn client(&self) -> KgResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| KgError::fatal(format!("http client: {}", e)))
    }

    /// POST with retry/backoff shared by the text and vision endpoints.
    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> KgResult<serde_json::Value> {
        let client = self.client()?;
        let mut last_err: Option<KgError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = client.post(url).json(body);
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| KgError::fatal(format!("invalid response body: {}", e)));
                    }

                    // Rate limited or server error — retry, honoring any
                    // provider-advised delay.
                    if status.as_u16() == 429 || status.is_server_error() {
                        let advised = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok());
                        if let Some(secs) = advised {
                            tokio::time::sleep(Duration::from_secs(secs.min(60))).await;
                        }
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(KgError::transient(format!(
                            "embedding API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(KgError::fatal(format!(
                        "embedding API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(KgError::transient(format!("network error: {}", e)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| KgError::transient("embedding failed after retries")))
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> KgResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let json = self.post_with_retry(&url, &body).await?;
        let vectors = parse_embeddings_response(&json)?;

        if vectors.len() != texts.len() {
            return Err(KgError::fatal(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        for v in &vectors {
            if v.len() != self.dims {
                return Err(KgError::Consistency(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dims,
                    v.len()
                )));
            }
        }
        Ok(vectors)
    }

    async fn embed_image(&self, bytes: &[u8]) -> KgResult<Vec<f32>> {
        if !self.vision {
            return Err(KgError::fatal("provider has no vision endpoint"));
        }

        use base64::Engine as _;
        let url = format!("{}/embeddings/image", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "image": base64::engine::general_purpose::STANDARD.encode(bytes),
        });

        let json = self.post_with_retry(&url, &body).await?;
        let mut vectors = parse_embeddings_response(&json)?;
        let v = vectors
            .pop()
            .ok_or_else(|| KgError::fatal("empty image embedding response"))?;
        if v.len() != self.dims {
            return Err(KgError::Consistency(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dims,
                v.len()
            )));
        }
        Ok(v)
    }
}

/// Parse an OpenAI-shaped embeddings response: `data[].embedding` arrays,
/// returned in index order.
fn parse_embeddings_response(json: &serde_json::Value) -> KgResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| KgError::fatal("invalid embeddings response: missing data array"))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| KgError::fatal("invalid embeddings response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Mock Provider ============

/// Deterministic embedding provider for tests and offline runs.
///
/// Hashes each whitespace-separated token into a slot of the output vector,
/// so texts that share words land close together in cosine space. Tokens
/// before the first period are weighted as the head phrase, which keeps two
/// texts naming the same thing (label first, then differing prose) above
/// typical match thresholds. Image bytes hash into the same space.
pub struct MockProvider {
    dims: usize,
}

impl MockProvider {
    pub const DEFAULT_DIMS: usize = 64;

    const HEAD_WEIGHT: f32 = 4.0;

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let head_len = text.find('.').unwrap_or(text.len());
        for (is_head, segment) in [(true, &text[..head_len]), (false, &text[head_len..])] {
            let weight = if is_head { Self::HEAD_WEIGHT } else { 1.0 };
            for token in segment.to_lowercase().split_whitespace() {
                let token = token.trim_matches(|c: char| !c.is_alphanumeric());
                if token.is_empty() {
                    continue;
                }
                let digest = Sha256::digest(token.as_bytes());
                let slot = u64::from_le_bytes([
                    digest[0], digest[1], digest[2], digest[3], digest[4], digest[5],
                    digest[6], digest[7],
                ]) as usize
                    % self.dims;
                v[slot] += weight;
            }
        }
        // Normalize so cosine comparisons are scale-free
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn model_name(&self) -> &str {
        "mock"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> KgResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    async fn embed_image(&self, bytes: &[u8]) -> KgResult<Vec<f32>> {
        Ok(self.embed_one(&hex::encode(Sha256::digest(bytes))))
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
