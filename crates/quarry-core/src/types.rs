use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A bounded unit of source text with stable identity and location metadata.
///
/// Chunks are produced by an external chunker. The `id` is derived from the
/// source file and ordinal so that re-ingesting the same file is idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub title: String,
    pub url: String,
    pub source_file: String,
    pub chunk_index: usize,
    /// Always serialized (as `null` when absent) so every chunk has the same key set.
    #[serde(default)]
    pub section: Option<String>,
}

impl Chunk {
    /// Build a chunk whose id is derived from `source_file` and `chunk_index`.
    pub fn new(
        source_file: impl Into<String>,
        chunk_index: usize,
        title: impl Into<String>,
        url: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let source_file = source_file.into();
        Self {
            id: Self::derive_id(&source_file, chunk_index),
            content: content.into(),
            title: title.into(),
            url: url.into(),
            source_file,
            chunk_index,
            section: None,
        }
    }

    /// Attach a section heading.
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Deterministic id for the chunk at `chunk_index` of `source_file`.
    pub fn derive_id(source_file: &str, chunk_index: usize) -> String {
        let name = format!("{}#{}", source_file, chunk_index);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_deterministic() {
        let a = Chunk::new("docs/intro.md", 3, "Intro", "/intro", "hello");
        let b = Chunk::new("docs/intro.md", 3, "Intro (edited)", "/intro", "changed text");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_chunk_id_depends_on_position() {
        let a = Chunk::derive_id("docs/intro.md", 0);
        let b = Chunk::derive_id("docs/intro.md", 1);
        let c = Chunk::derive_id("docs/other.md", 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_chunk_serializes_absent_section_as_null() {
        let chunk = Chunk::new("a.md", 0, "A", "/a", "text");
        let value = serde_json::to_value(&chunk).unwrap();
        let obj = value.as_object().unwrap();
        assert!(obj.contains_key("section"));
        assert!(obj["section"].is_null());
        assert_eq!(obj.len(), 7);
    }

    #[test]
    fn test_chunk_deserialize_without_section() {
        let json = r#"{
            "id": "x",
            "content": "body",
            "title": "T",
            "url": "/t",
            "source_file": "t.md",
            "chunk_index": 2
        }"#;
        let chunk: Chunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.chunk_index, 2);
        assert!(chunk.section.is_none());
    }

    #[test]
    fn test_with_section() {
        let chunk = Chunk::new("a.md", 0, "A", "/a", "text").with_section("Setup");
        assert_eq!(chunk.section.as_deref(), Some("Setup"));
    }
}
