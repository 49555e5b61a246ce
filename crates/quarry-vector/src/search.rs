//! Text queries over the exact and approximate indexes.
//!
//! SearchEngine embeds query text through the same pipeline (and cache) used
//! for ingestion, then hands the vector to VectorIndex or ApproximateIndex.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use quarry_core::config::HnswConfig;
use quarry_core::error::QuarryError;

use crate::hnsw::ApproximateIndex;
use crate::index::{IndexedObject, ScoredObject, SearchOptions, VectorIndex};
use crate::pipeline::BatchEmbeddingPipeline;

/// One approximate-search result.
#[derive(Debug, Clone, Serialize)]
pub struct ApproximateHit {
    /// Euclidean distance to the query.
    pub distance: f32,
    /// Base-layer position of the match.
    pub node: usize,
    /// The object this node was built from, when it is known.
    #[serde(skip)]
    pub object: Option<IndexedObject>,
}

/// Embeds query text and searches the loaded indexes.
///
/// The approximate index is paired with a copy of the exact index's objects
/// taken when the graph is built or attached. Later updates or removals on
/// the exact index do not shift which object an approximate hit names.
pub struct SearchEngine {
    pipeline: Arc<BatchEmbeddingPipeline>,
    index: Arc<VectorIndex>,
    approximate: Option<ApproximateIndex>,
    graph_objects: Vec<IndexedObject>,
}

impl SearchEngine {
    pub fn new(pipeline: Arc<BatchEmbeddingPipeline>, index: Arc<VectorIndex>) -> Self {
        Self {
            pipeline,
            index,
            approximate: None,
            graph_objects: Vec::new(),
        }
    }

    /// Attach an approximate index whose node order matches `index`'s current
    /// insertion order.
    pub fn with_approximate(mut self, approximate: ApproximateIndex) -> Self {
        self.graph_objects = self.index.objects();
        if self.graph_objects.len() != approximate.len() {
            warn!(
                objects = self.graph_objects.len(),
                points = approximate.len(),
                "Approximate index size differs from exact index"
            );
        }
        self.approximate = Some(approximate);
        self
    }

    /// Build an approximate index from every object currently in the exact index.
    pub fn build_approximate(&mut self, config: &HnswConfig) -> Result<&ApproximateIndex, QuarryError> {
        let objects = self.index.objects();
        let mut graph = ApproximateIndex::new(config)?;
        for object in &objects {
            graph.insert(object.embedding.clone())?;
        }
        debug!(points = graph.len(), "Built approximate index");
        self.graph_objects = objects;
        Ok(self.approximate.insert(graph))
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn approximate(&self) -> Option<&ApproximateIndex> {
        self.approximate.as_ref()
    }

    pub fn pipeline(&self) -> &Arc<BatchEmbeddingPipeline> {
        &self.pipeline
    }

    /// Embed `query` and run an exact search.
    pub async fn search_text(
        &self,
        query: &str,
        options: &SearchOptions<'_>,
    ) -> Result<Vec<ScoredObject>, QuarryError> {
        let vector = self.pipeline.embed_text(query).await?;
        let hits = self.index.search(&vector, options)?;
        debug!(query_len = query.len(), hits = hits.len(), "Exact text search");
        Ok(hits)
    }

    /// Embed `query` and run an approximate search with beam width `ef`.
    pub async fn search_approximate(
        &self,
        query: &str,
        ef: usize,
    ) -> Result<Vec<ApproximateHit>, QuarryError> {
        let graph = self
            .approximate
            .as_ref()
            .ok_or_else(|| QuarryError::Config("no approximate index loaded".into()))?;

        let vector = self.pipeline.embed_text(query).await?;
        let hits = graph
            .search(&vector, ef)?
            .into_iter()
            .map(|(distance, node)| ApproximateHit {
                distance,
                node,
                object: self.graph_objects.get(node).cloned(),
            })
            .collect::<Vec<_>>();
        debug!(ef, hits = hits.len(), "Approximate text search");
        Ok(hits)
    }
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("pipeline", &self.pipeline)
            .field("objects", &self.index.len())
            .field("approximate", &self.approximate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::config::{CacheConfig, PipelineConfig};
    use quarry_core::types::Chunk;

    use crate::embedding::HashEmbedding;
    use crate::index::Filter;

    const DIMS: usize = 32;

    fn pipeline() -> Arc<BatchEmbeddingPipeline> {
        let config = PipelineConfig {
            dimensions: DIMS,
            inter_batch_delay_ms: 0,
            ..PipelineConfig::default()
        };
        Arc::new(
            BatchEmbeddingPipeline::new(HashEmbedding::new(DIMS), config, CacheConfig::default())
                .unwrap(),
        )
    }

    async fn engine(texts: &[&str]) -> SearchEngine {
        let pipeline = pipeline();
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::new("notes.md", i, "Notes", "/notes", *t))
            .collect();
        let data = pipeline.generate_embeddings(chunks).await;
        let index = VectorIndex::from_objects(data.indexed_objects().unwrap()).unwrap();
        SearchEngine::new(pipeline, Arc::new(index))
    }

    #[tokio::test]
    async fn test_search_text_finds_exact_content() {
        let engine = engine(&["alpha beta", "gamma delta", "epsilon"]).await;
        let hits = engine
            .search_text("gamma delta", &SearchOptions::top_k(1))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 1.0);
        assert_eq!(hits[0].object.get("content").unwrap(), "gamma delta");
    }

    #[tokio::test]
    async fn test_search_text_with_filter() {
        let engine = engine(&["one", "two", "three"]).await;
        let options = SearchOptions::top_k(5).with_filter(Filter::new().eq("chunk_index", 2));
        let hits = engine.search_text("one", &options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].object.get("content").unwrap(), "three");
    }

    #[tokio::test]
    async fn test_query_embedding_is_cached() {
        let engine = engine(&["cached"]).await;
        // Ingestion already embedded "cached".
        let before = engine.pipeline().cache().hits();
        engine
            .search_text("cached", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(engine.pipeline().cache().hits(), before + 1);
    }

    #[tokio::test]
    async fn test_search_approximate_requires_graph() {
        let engine = engine(&["x"]).await;
        let result = engine.search_approximate("x", 1).await;
        assert!(matches!(result, Err(QuarryError::Config(_))));
    }

    #[tokio::test]
    async fn test_search_approximate_maps_objects() {
        let texts = ["red apple", "green pear", "blue berry", "yellow banana"];
        let mut engine = engine(&texts).await;
        engine.build_approximate(&HnswConfig::default()).unwrap();

        let hits = engine.search_approximate("blue berry", 4).await.unwrap();
        assert_eq!(hits[0].distance, 0.0);
        assert_eq!(hits[0].node, 2);
        let object = hits[0].object.as_ref().unwrap();
        assert_eq!(object.get("content").unwrap(), "blue berry");
    }

    #[tokio::test]
    async fn test_search_approximate_after_removal() {
        let mut engine = engine(&["red apple", "green pear", "blue berry"]).await;
        engine.build_approximate(&HnswConfig::default()).unwrap();

        engine
            .index()
            .remove(&Filter::new().eq("content", "red apple"))
            .unwrap();
        assert_eq!(engine.index().len(), 2);

        let hits = engine.search_approximate("green pear", 3).await.unwrap();
        assert_eq!(hits[0].node, 1);
        let object = hits[0].object.as_ref().unwrap();
        assert_eq!(object.get("content").unwrap(), "green pear");

        let hits = engine.search_approximate("blue berry", 3).await.unwrap();
        assert_eq!(hits[0].node, 2);
        assert_eq!(
            hits[0].object.as_ref().unwrap().get("content").unwrap(),
            "blue berry"
        );
    }

    #[tokio::test]
    async fn test_with_approximate_pairs_current_objects() {
        let built = {
            let mut engine = engine(&["north", "south", "east"]).await;
            engine.build_approximate(&HnswConfig::default()).unwrap();
            engine.approximate().unwrap().to_binary().unwrap()
        };
        let graph = ApproximateIndex::from_binary(&built).unwrap();

        let base = engine(&["north", "south", "east"]).await;
        let index = Arc::clone(base.index());
        let engine = SearchEngine::new(Arc::clone(base.pipeline()), Arc::clone(&index))
            .with_approximate(graph);
        index.remove(&Filter::new().eq("content", "north")).unwrap();

        let hits = engine.search_approximate("east", 3).await.unwrap();
        assert_eq!(hits[0].node, 2);
        assert_eq!(hits[0].object.as_ref().unwrap().get("content").unwrap(), "east");
    }
}
