//! Embedding generation: provider interface, the OpenAI-compatible HTTP
//! client, and the cache-aware batching layer.
//!
//! The generator is what the rest of the system calls. It partitions texts
//! into cache hits and misses in one pass, sends the misses to the provider
//! in order-preserving batches, and writes fresh vectors back to the cache.
//! Retry with exponential backoff lives in the HTTP provider, so injected
//! test providers never sleep.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::EmbeddingCache;
use crate::config::ApiConfig;
use crate::error::{AppError, AppResult};

/// Maximum texts per provider call. Some backends only accept batches of 10,
/// so that is the lowest common denominator.
pub const DEFAULT_BATCH_SIZE: usize = 10;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_SECS: u64 = 2;
const RETRY_CAP_SECS: u64 = 10;

/// Opaque `text -> vector` function. Implementations must preserve input
/// order within a batch.
pub trait EmbeddingProvider: Send + Sync {
    fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Blocking client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(api: &ApiConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(120))
            .build();
        Self {
            agent,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
            model: api.embedding_model.clone(),
        }
    }

    fn call(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let response: EmbeddingResponse = self
            .agent
            .post(&format!("{}/embeddings", self.base_url))
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(&request)
            .map_err(|e| AppError::EmbeddingFailure(e.to_string()))?
            .into_json()
            .map_err(|e| AppError::EmbeddingFailure(format!("response decode: {e}")))?;

        if response.data.len() != texts.len() {
            return Err(AppError::EmbeddingFailure(format!(
                "provider returned {} embeddings for {} inputs",
                response.data.len(),
                texts.len()
            )));
        }

        // The API reports each embedding's position in the input; sort by it
        // so reordered responses still line up.
        let mut data = response.data;
        data.sort_by_key(|item| item.index);
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

impl EmbeddingProvider for OpenAiEmbeddings {
    fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut last_error = None;
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                let backoff = (RETRY_BASE_SECS << (attempt - 1)).min(RETRY_CAP_SECS);
                warn!(
                    "embedding request failed, retrying in {}s (attempt {}/{})",
                    backoff,
                    attempt + 1,
                    RETRY_ATTEMPTS
                );
                std::thread::sleep(Duration::from_secs(backoff));
            }
            match self.call(texts) {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| AppError::EmbeddingFailure("no attempts made".into())))
    }
}

/// Cache-aware, batching front door for embedding generation.
pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    batch_size: usize,
}

impl EmbeddingGenerator {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: EmbeddingCache) -> Self {
        Self {
            provider,
            cache,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Embed `texts`, returning vectors in input order. Cached texts never
    /// reach the provider.
    pub fn generate(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(text) {
                Some(embedding) => results[i] = Some(embedding),
                None => misses.push(i),
            }
        }

        if !misses.is_empty() {
            debug!(
                "embedding {} texts ({} cached)",
                misses.len(),
                texts.len() - misses.len()
            );
        }

        for batch in misses.chunks(self.batch_size) {
            let batch_texts: Vec<String> =
                batch.iter().map(|&i| texts[i].clone()).collect();
            let embeddings = self.provider.embed_batch(&batch_texts)?;
            if embeddings.len() != batch_texts.len() {
                return Err(AppError::EmbeddingFailure(format!(
                    "provider returned {} embeddings for a batch of {}",
                    embeddings.len(),
                    batch_texts.len()
                )));
            }
            for (&position, embedding) in batch.iter().zip(embeddings) {
                self.cache.put(&texts[position], &embedding);
                results[position] = Some(embedding);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or_default()).collect())
    }

    pub fn generate_one(&self, text: &str) -> AppResult<Vec<f32>> {
        let texts = [text.to_string()];
        let mut vectors = self.generate(&texts)?;
        vectors
            .pop()
            .ok_or_else(|| AppError::EmbeddingFailure("empty embedding result".into()))
    }
}
