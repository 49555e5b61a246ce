use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{QuarryError, Result};

/// Upper bound applied to the pause between pipeline batches.
pub const MAX_INTER_BATCH_DELAY_MS: u64 = 1_000;

/// Top-level configuration for Quarry.
///
/// Loaded from `~/.quarry/config.toml` by default. Each section configures
/// one component of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuarryConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub hnsw: HnswConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl QuarryConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: QuarryConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check every section for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.cache.validate()?;
        self.hnsw.validate()?;
        self.storage.validate()?;
        if self.search.top_k == 0 {
            return Err(QuarryError::Config("search.top_k must be at least 1".into()));
        }
        if self.search.ef == 0 {
            return Err(QuarryError::Config("search.ef must be at least 1".into()));
        }
        Ok(())
    }

    /// Data directory with a leading `~` expanded to the home directory.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the store files, snapshots and ingestion metadata.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.quarry/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Batch embedding pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of chunks embedded per batch.
    pub batch_size: usize,
    /// Attempts per chunk before falling back to the zero vector.
    pub max_retries: u32,
    /// Linear backoff step: attempt `n` waits `n * base_delay_ms`.
    pub base_delay_ms: u64,
    /// Ceiling for any single backoff wait.
    pub max_delay_ms: u64,
    /// Pause between consecutive batches, capped at [`MAX_INTER_BATCH_DELAY_MS`].
    pub inter_batch_delay_ms: u64,
    /// Expected vector length.
    pub dimensions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            inter_batch_delay_ms: 100,
            dimensions: 384,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(QuarryError::Config("pipeline.batch_size must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(QuarryError::Config("pipeline.max_retries must be at least 1".into()));
        }
        if self.dimensions == 0 {
            return Err(QuarryError::Config("pipeline.dimensions must be at least 1".into()));
        }
        Ok(())
    }

    /// The inter-batch pause after applying the cap.
    pub fn effective_inter_batch_delay_ms(&self) -> u64 {
        self.inter_batch_delay_ms.min(MAX_INTER_BATCH_DELAY_MS)
    }
}

/// Embedding cache bounds. Fixed once a cache has been built from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached vectors.
    pub max_entries: usize,
    /// Maximum age of a cached vector in seconds.
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_age_secs: 3_600,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(QuarryError::Config("cache.max_entries must be at least 1".into()));
        }
        Ok(())
    }
}

/// Approximate index construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Number of graph layers (L).
    pub layers: usize,
    /// Layer-selection decay (mL).
    pub ml: f64,
    /// Candidate list width used while inserting (efc).
    pub efc: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            layers: 5,
            ml: 0.62,
            efc: 10,
        }
    }
}

impl HnswConfig {
    /// Reject parameter sets the graph cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.layers == 0 {
            return Err(QuarryError::Config("hnsw.layers must be at least 1".into()));
        }
        if !self.ml.is_finite() || self.ml <= 0.0 {
            return Err(QuarryError::Config(format!(
                "hnsw.ml must be a positive number, got {}",
                self.ml
            )));
        }
        if self.efc == 0 {
            return Err(QuarryError::Config("hnsw.efc must be at least 1".into()));
        }
        Ok(())
    }
}

/// Durable store addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store name; one SQLite file per store.
    pub store_name: String,
    /// Collection name within the store.
    pub collection_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_name: "quarry".to_string(),
            collection_name: "vectors".to_string(),
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        validate_identifier("storage.store_name", &self.store_name)?;
        validate_identifier("storage.collection_name", &self.collection_name)
    }
}

/// Query defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Results returned by exact search when the caller does not say.
    pub top_k: usize,
    /// Base-layer beam width for approximate search.
    pub ef: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { top_k: 5, ef: 10 }
    }
}

/// Store and collection names end up in file names and SQL identifiers, so
/// only ASCII letters, digits and underscores are accepted.
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(QuarryError::Config(format!("{} must not be empty", field)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(QuarryError::Config(format!(
            "{} may only contain letters, digits and underscores, got '{}'",
            field, value
        )));
    }
    Ok(())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE");
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME");
        if let Ok(home) = home {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
