use thiserror::Error;

/// Top-level error type for the Quarry search engine.
///
/// Each variant corresponds to one failure class. Transient embedding
/// failures are retried by the pipeline; everything else propagates to the
/// caller of the offending operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuarryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },

    #[error("Embedding error: {0}")]
    TransientEmbedding(String),

    /// In-memory index state is unusable, e.g. a poisoned lock.
    #[error("Index error: {0}")]
    Index(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for QuarryError {
    fn from(err: toml::de::Error) -> Self {
        QuarryError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for QuarryError {
    fn from(err: toml::ser::Error) -> Self {
        QuarryError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for QuarryError {
    fn from(err: serde_json::Error) -> Self {
        QuarryError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Quarry operations.
pub type Result<T> = std::result::Result<T, QuarryError>;
