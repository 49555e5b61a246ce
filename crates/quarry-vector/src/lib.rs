//! Quarry Vector crate - embedding pipeline, exact and approximate indexes, and search.
//!
//! Provides an LRU embedding cache, an embedding model trait with a
//! deterministic hash model, a batch pipeline with retry and validation,
//! a brute-force cosine index that can checkpoint to and search a durable
//! collection, an HNSW-style graph with JSON and binary snapshots, and a
//! search engine that runs text queries against both indexes.

pub mod cache;
pub mod embedding;
pub mod hnsw;
pub mod index;
pub mod pipeline;
pub mod search;

pub use cache::EmbeddingCache;
pub use embedding::{DynEmbeddingService, EmbeddingService, HashEmbedding};
pub use hnsw::{ApproximateIndex, HnswSnapshot, Node, DEFAULT_SEARCH_EF};
pub use index::{
    cosine_similarity, Filter, IndexedObject, ScoredObject, SearchBackend, SearchOptions,
    VectorIndex, DEFAULT_TOP_K,
};
pub use pipeline::{
    get_stats, validate_embeddings, BatchEmbeddingPipeline, EmbeddedChunks, EmbeddingStats,
    ValidationReport, ValidationStats,
};
pub use search::{ApproximateHit, SearchEngine};
