//! Ingestion metadata used to decide whether a corpus must be re-embedded.
//!
//! One snapshot is produced per generation run and compared against the
//! snapshot saved by the previous run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::Result;
use crate::types::Chunk;

/// Snapshot of one ingestion run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestionMetadata {
    /// Corpus format version. Runs with different versions are incompatible.
    pub version: String,
    /// Name of the embedding model that produced the vectors.
    pub model: String,
    pub dimensions: usize,
    pub generated_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub embedding_count: usize,
    /// Embeddings that fell back to the zero vector.
    pub failed_count: usize,
    /// Source file to SHA-256 of its chunk contents, concatenated in chunk order.
    pub source_hashes: BTreeMap<String, String>,
}

impl IngestionMetadata {
    /// Build the snapshot for a run over `chunks`.
    pub fn from_chunks(
        version: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        chunks: &[Chunk],
        embedding_count: usize,
        failed_count: usize,
    ) -> Self {
        Self {
            version: version.into(),
            model: model.into(),
            dimensions,
            generated_at: Utc::now(),
            chunk_count: chunks.len(),
            embedding_count,
            failed_count,
            source_hashes: hash_sources(chunks),
        }
    }

    /// Vectors from `previous` can be mixed with vectors from this run.
    pub fn is_compatible(&self, previous: &IngestionMetadata) -> bool {
        self.version == previous.version
            && self.model == previous.model
            && self.dimensions == previous.dimensions
    }

    /// Sources that were added, removed, or whose content changed since `previous`.
    pub fn changed_sources(&self, previous: &IngestionMetadata) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .source_hashes
            .keys()
            .chain(previous.source_hashes.keys())
            .collect();

        names
            .into_iter()
            .filter(|name| self.source_hashes.get(*name) != previous.source_hashes.get(*name))
            .cloned()
            .collect()
    }

    /// True if this run cannot reuse the previous run's output.
    pub fn needs_reingest(&self, previous: &IngestionMetadata) -> bool {
        !self.is_compatible(previous) || !self.changed_sources(previous).is_empty()
    }

    /// Write the snapshot as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), chunks = self.chunk_count, "Saved ingestion metadata");
        Ok(())
    }

    /// Read a snapshot written by [`IngestionMetadata::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn hash_sources(chunks: &[Chunk]) -> BTreeMap<String, String> {
    let mut by_source: BTreeMap<&str, Vec<&Chunk>> = BTreeMap::new();
    for chunk in chunks {
        by_source.entry(chunk.source_file.as_str()).or_default().push(chunk);
    }

    by_source
        .into_iter()
        .map(|(source, mut group)| {
            group.sort_by_key(|c| c.chunk_index);
            let mut hasher = Sha256::new();
            for chunk in group {
                hasher.update(chunk.content.as_bytes());
                hasher.update([0u8]);
            }
            (source.to_string(), hex::encode(hasher.finalize()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks() -> Vec<Chunk> {
        vec![
            Chunk::new("a.md", 0, "A", "/a", "alpha one"),
            Chunk::new("a.md", 1, "A", "/a", "alpha two"),
            Chunk::new("b.md", 0, "B", "/b", "beta"),
        ]
    }

    fn snapshot(chunks: &[Chunk]) -> IngestionMetadata {
        IngestionMetadata::from_chunks("1", "hash-384", 384, chunks, chunks.len(), 0)
    }

    #[test]
    fn test_hashes_one_entry_per_source() {
        let meta = snapshot(&chunks());
        assert_eq!(meta.source_hashes.len(), 2);
        assert_eq!(meta.chunk_count, 3);
        assert_eq!(meta.source_hashes["a.md"].len(), 64);
    }

    #[test]
    fn test_hash_ignores_input_order() {
        let mut reversed = chunks();
        reversed.reverse();
        assert_eq!(
            snapshot(&chunks()).source_hashes,
            snapshot(&reversed).source_hashes
        );
    }

    #[test]
    fn test_unchanged_corpus_needs_no_reingest() {
        let previous = snapshot(&chunks());
        let current = snapshot(&chunks());
        assert!(current.is_compatible(&previous));
        assert!(current.changed_sources(&previous).is_empty());
        assert!(!current.needs_reingest(&previous));
    }

    #[test]
    fn test_changed_and_new_sources_detected() {
        let previous = snapshot(&chunks());
        let mut next = chunks();
        next[2].content = "beta, revised".to_string();
        next.push(Chunk::new("c.md", 0, "C", "/c", "gamma"));
        let current = snapshot(&next);

        assert_eq!(current.changed_sources(&previous), vec!["b.md", "c.md"]);
        assert!(current.needs_reingest(&previous));
    }

    #[test]
    fn test_removed_source_detected() {
        let previous = snapshot(&chunks());
        let current = snapshot(&chunks()[..2]);
        assert_eq!(current.changed_sources(&previous), vec!["b.md"]);
    }

    #[test]
    fn test_model_change_is_incompatible() {
        let previous = snapshot(&chunks());
        let current =
            IngestionMetadata::from_chunks("1", "other-model", 384, &chunks(), 3, 0);
        assert!(!current.is_compatible(&previous));
        assert!(current.needs_reingest(&previous));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta").join("ingestion.json");
        let meta = snapshot(&chunks());
        meta.save(&path).unwrap();
        assert_eq!(IngestionMetadata::load(&path).unwrap(), meta);
    }
}
