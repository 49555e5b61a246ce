//! Batch embedding pipeline.
//!
//! Chunks are embedded in fixed-size batches, one batch at a time. Each chunk
//! is looked up in the [`EmbeddingCache`] first and otherwise sent to the
//! embedding model, retrying with linear backoff. A chunk that still fails
//! gets a zero vector so the run always completes; the damage shows up in
//! [`validate_embeddings`] and [`get_stats`] instead of as an error.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use quarry_core::config::{CacheConfig, PipelineConfig};
use quarry_core::error::QuarryError;
use quarry_core::types::Chunk;

use crate::cache::EmbeddingCache;
use crate::embedding::{DynEmbeddingService, EmbeddingService};
use crate::index::IndexedObject;

/// Chunks paired 1:1 with their embeddings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunks {
    pub chunks: Vec<Chunk>,
    pub embeddings: Vec<Vec<f32>>,
}

impl EmbeddedChunks {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Pair every chunk with its embedding as an index object.
    pub fn indexed_objects(&self) -> Result<Vec<IndexedObject>, QuarryError> {
        if self.chunks.len() != self.embeddings.len() {
            return Err(QuarryError::Schema(format!(
                "Mismatch: {} chunks but {} embeddings",
                self.chunks.len(),
                self.embeddings.len()
            )));
        }
        self.chunks
            .iter()
            .zip(&self.embeddings)
            .map(|(chunk, embedding)| IndexedObject::from_chunk(chunk, embedding.clone()))
            .collect()
    }
}

/// Counts behind a [`ValidationReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub chunks: usize,
    pub embeddings: usize,
    pub wrong_dimensions: usize,
    pub all_zero: usize,
    pub non_finite: usize,
}

/// Outcome of [`validate_embeddings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub stats: ValidationStats,
}

/// Summary of an embedding run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStats {
    pub total_chunks: usize,
    pub successful: usize,
    /// Embeddings that are all zeros, i.e. fell back to the sentinel.
    pub failed: usize,
    pub elapsed_ms: u64,
    pub avg_ms_per_chunk: f64,
}

/// Drives an embedding model over many chunks.
pub struct BatchEmbeddingPipeline {
    embedder: Box<dyn DynEmbeddingService>,
    config: PipelineConfig,
    cache_config: CacheConfig,
    cache: OnceLock<Arc<EmbeddingCache>>,
}

impl BatchEmbeddingPipeline {
    /// Create a pipeline. The model must produce vectors of `config.dimensions`.
    pub fn new(
        embedder: impl EmbeddingService + 'static,
        config: PipelineConfig,
        cache_config: CacheConfig,
    ) -> Result<Self, QuarryError> {
        if config.batch_size == 0 {
            return Err(QuarryError::Config("batch_size must be at least 1".into()));
        }
        if config.max_retries == 0 {
            return Err(QuarryError::Config("max_retries must be at least 1".into()));
        }
        let model_dims = EmbeddingService::dimensions(&embedder);
        if model_dims != config.dimensions {
            return Err(QuarryError::Config(format!(
                "model '{}' produces {} dimensions but the pipeline expects {}",
                EmbeddingService::model_name(&embedder),
                model_dims,
                config.dimensions
            )));
        }

        Ok(Self {
            embedder: Box::new(embedder),
            config,
            cache_config,
            cache: OnceLock::new(),
        })
    }

    /// Use `cache` instead of building one on first use.
    pub fn with_cache(self, cache: Arc<EmbeddingCache>) -> Self {
        let slot = OnceLock::new();
        let _ = slot.set(cache);
        Self { cache: slot, ..self }
    }

    /// The pipeline's cache, built from the cache config on first call.
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        self.cache
            .get_or_init(|| Arc::new(EmbeddingCache::new(&self.cache_config)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Embed one text, consulting the cache and retrying failed model calls.
    ///
    /// Returns the last model error once every attempt has failed.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, QuarryError> {
        let cache = self.cache();
        if let Some(vector) = cache.get(text) {
            debug!("Embedding cache hit");
            return Ok(vector);
        }

        let attempts = self.config.max_retries;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.embedder.embed_boxed(text).await {
                Ok(vector) => {
                    cache.set(text, vector.clone());
                    return Ok(vector);
                }
                Err(e) => {
                    warn!(attempt, max = attempts, error = %e, "Embedding attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(QuarryError::TransientEmbedding(format!(
            "gave up after {} attempts: {}",
            attempts, last_error
        )))
    }

    /// Wait before retrying after failed attempt `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let ms = (attempt as u64)
            .saturating_mul(self.config.base_delay_ms)
            .min(self.config.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Embed every chunk, in batches, substituting a zero vector for failures.
    pub async fn generate_embeddings(&self, chunks: Vec<Chunk>) -> EmbeddedChunks {
        if chunks.is_empty() {
            return EmbeddedChunks::default();
        }

        let batch_size = self.config.batch_size;
        let total_batches = chunks.len().div_ceil(batch_size);
        let pause = Duration::from_millis(self.config.effective_inter_batch_delay_ms());
        let mut embeddings = Vec::with_capacity(chunks.len());
        let mut fallbacks = 0usize;

        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            for chunk in batch {
                match self.embed_text(&chunk.content).await {
                    Ok(vector) => embeddings.push(vector),
                    Err(e) => {
                        warn!(chunk_id = %chunk.id, error = %e, "Using zero vector for chunk");
                        embeddings.push(vec![0.0; self.config.dimensions]);
                        fallbacks += 1;
                    }
                }
            }

            info!(
                batch = batch_no + 1,
                total = total_batches,
                embedded = embeddings.len(),
                "Batch embedded"
            );

            if batch_no + 1 < total_batches && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        info!(chunks = chunks.len(), fallbacks, "Embedding run complete");
        EmbeddedChunks { chunks, embeddings }
    }

    /// [`validate_embeddings`] against this pipeline's dimensions.
    pub fn validate(&self, data: &EmbeddedChunks) -> ValidationReport {
        validate_embeddings(data, self.config.dimensions)
    }
}

impl std::fmt::Debug for BatchEmbeddingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEmbeddingPipeline")
            .field("model", &self.embedder.model_name())
            .field("config", &self.config)
            .field("cache", &self.cache.get())
            .finish()
    }
}

/// Check a run for count mismatches and bad vectors.
///
/// Every check runs regardless of the others, so one vector can be counted
/// under more than one issue.
pub fn validate_embeddings(data: &EmbeddedChunks, dimensions: usize) -> ValidationReport {
    let mut stats = ValidationStats {
        chunks: data.chunks.len(),
        embeddings: data.embeddings.len(),
        ..ValidationStats::default()
    };

    for vector in &data.embeddings {
        if vector.len() != dimensions {
            stats.wrong_dimensions += 1;
        }
        if vector.iter().all(|v| *v == 0.0) {
            stats.all_zero += 1;
        }
        if vector.iter().any(|v| !v.is_finite()) {
            stats.non_finite += 1;
        }
    }

    let mut issues = Vec::new();
    if stats.chunks != stats.embeddings {
        issues.push(format!(
            "Mismatch: {} chunks but {} embeddings",
            stats.chunks, stats.embeddings
        ));
    }
    if stats.wrong_dimensions > 0 {
        issues.push(format!(
            "{} embeddings have incorrect dimensions",
            stats.wrong_dimensions
        ));
    }
    if stats.all_zero > 0 {
        issues.push(format!("{} embeddings are empty (all zeros)", stats.all_zero));
    }
    if stats.non_finite > 0 {
        issues.push(format!(
            "{} embeddings contain invalid values",
            stats.non_finite
        ));
    }

    for issue in &issues {
        warn!(issue = %issue, "Embedding validation issue");
    }

    ValidationReport {
        is_valid: issues.is_empty(),
        issues,
        stats,
    }
}

/// Success and timing figures for a run that took `elapsed`.
pub fn get_stats(data: &EmbeddedChunks, elapsed: Duration) -> EmbeddingStats {
    let total_chunks = data.chunks.len();
    let failed = data
        .embeddings
        .iter()
        .filter(|v| v.iter().all(|x| *x == 0.0))
        .count();
    let elapsed_ms = elapsed.as_millis() as u64;
    let avg_ms_per_chunk = if total_chunks == 0 {
        0.0
    } else {
        elapsed_ms as f64 / total_chunks as f64
    };

    EmbeddingStats {
        total_chunks,
        successful: data.embeddings.len() - failed,
        failed,
        elapsed_ms,
        avg_ms_per_chunk,
    }
}
