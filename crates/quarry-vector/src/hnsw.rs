//! Layered proximity graph for approximate nearest-neighbour search.
//!
//! `index[0]` is the sparsest layer and `index[L-1]` is the base layer that
//! holds every inserted point; a node's `layer_below` is its position in the
//! next layer down. Queries walk the upper layers greedily and run one beam
//! search of width `ef` on the base layer.
//!
//! On insert, layers above the point's insertion layer are also walked
//! greedily: a width-1 beam search that keeps moving to the closest
//! neighbour until none is closer. Only the insertion layer and those below
//! it get a search of width `efc`.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use quarry_core::config::HnswConfig;
use quarry_core::error::QuarryError;

/// Beam width used by [`ApproximateIndex::search`] when the caller has no preference.
pub const DEFAULT_SEARCH_EF: usize = 1;

/// One point in one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub vector: Vec<f32>,
    /// Positions of neighbours within the same layer.
    pub connections: Vec<usize>,
    /// Position of the same point in the next layer down; `None` on the base layer.
    #[serde(rename = "layerBelow")]
    pub layer_below: Option<usize>,
}

/// Structural snapshot shared by the JSON and binary codecs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswSnapshot {
    #[serde(rename = "L")]
    pub layers: usize,
    #[serde(rename = "mL")]
    pub ml: f64,
    pub efc: usize,
    pub index: Vec<Vec<Node>>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: f32,
    node: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

pub struct ApproximateIndex {
    layers: usize,
    ml: f64,
    efc: usize,
    index: Vec<Vec<Node>>,
    rng: StdRng,
}

impl ApproximateIndex {
    /// Create an empty graph with entropy-seeded layer selection.
    pub fn new(config: &HnswConfig) -> Result<Self, QuarryError> {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Create an empty graph whose layer selection is reproducible.
    pub fn with_seed(config: &HnswConfig, seed: u64) -> Result<Self, QuarryError> {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &HnswConfig, rng: StdRng) -> Result<Self, QuarryError> {
        config.validate()?;
        Ok(Self {
            layers: config.layers,
            ml: config.ml,
            efc: config.efc,
            index: vec![Vec::new(); config.layers],
            rng,
        })
    }

    /// Number of points, i.e. the size of the base layer.
    pub fn len(&self) -> usize {
        self.base().len()
    }

    pub fn is_empty(&self) -> bool {
        self.base().is_empty()
    }

    pub fn layer_count(&self) -> usize {
        self.layers
    }

    /// Node counts per layer, sparsest first.
    pub fn layer_sizes(&self) -> Vec<usize> {
        self.index.iter().map(Vec::len).collect()
    }

    /// Vector length fixed by the first insert.
    pub fn dimensions(&self) -> Option<usize> {
        self.base().first().map(|n| n.vector.len())
    }

    fn base(&self) -> &[Node] {
        &self.index[self.layers - 1]
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), QuarryError> {
        if vector.is_empty() {
            return Err(QuarryError::Schema("vector must not be empty".into()));
        }
        if let Some(expected) = self.dimensions() {
            if vector.len() != expected {
                return Err(QuarryError::Dimension {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        Ok(())
    }

    fn draw_layer(&mut self) -> usize {
        let u = 1.0 - self.rng.random::<f64>();
        let level = (-u.ln() * self.ml).floor() as usize;
        level.min(self.layers - 1)
    }

    /// Insert `vector` and return its base-layer position (its insertion order).
    pub fn insert(&mut self, vector: Vec<f32>) -> Result<usize, QuarryError> {
        self.check_vector(&vector)?;
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(QuarryError::Schema("vector contains non-finite values".into()));
        }

        let mut target = self.draw_layer();
        let base = self.layers - 1;
        let mut entry = 0usize;

        for n in 0..self.layers {
            let below = if n < base {
                Some(self.index[n + 1].len())
            } else {
                None
            };

            if self.index[n].is_empty() {
                // A seeded point must exist in every finer layer too.
                self.index[n].push(Node {
                    vector: vector.clone(),
                    connections: Vec::new(),
                    layer_below: below,
                });
                target = target.min(n);
                entry = 0;
                continue;
            }

            if n < target {
                // Greedy walk: width-1 beam until no neighbour is closer.
                let nearest = search_layer(&self.index[n], entry, &vector, 1);
                entry = next_entry(&self.index[n], &nearest);
                continue;
            }

            let neighbours = search_layer(&self.index[n], entry, &vector, self.efc);
            let position = self.index[n].len();
            let layer = &mut self.index[n];
            for &(_, neighbour) in &neighbours {
                layer[neighbour].connections.push(position);
            }
            layer.push(Node {
                vector: vector.clone(),
                connections: neighbours.iter().map(|&(_, i)| i).collect(),
                layer_below: below,
            });
            entry = next_entry(&self.index[n], &neighbours);
        }

        debug!(layer = target, points = self.len(), "Inserted point");
        Ok(self.len() - 1)
    }

    /// Approximate nearest neighbours of `query` as `(distance, position)`
    /// pairs, nearest first. Positions are insertion order.
    ///
    /// An `ef` of zero is treated as one.
    pub fn search(&self, query: &[f32], ef: usize) -> Result<Vec<(f32, usize)>, QuarryError> {
        if self.is_empty() {
            return Ok(Vec::new());
        }
        self.check_vector(query)?;

        let base = self.layers - 1;
        let mut entry = 0usize;
        for layer in &self.index[..base] {
            let nearest = search_layer(layer, entry, query, 1);
            entry = next_entry(layer, &nearest);
        }
        Ok(search_layer(&self.index[base], entry, query, ef.max(1)))
    }

    pub fn snapshot(&self) -> HnswSnapshot {
        HnswSnapshot {
            layers: self.layers,
            ml: self.ml,
            efc: self.efc,
            index: self.index.clone(),
        }
    }

    /// Rebuild a graph from `snapshot`, checking its structure first.
    pub fn from_snapshot(snapshot: HnswSnapshot) -> Result<Self, QuarryError> {
        let config = HnswConfig {
            layers: snapshot.layers,
            ml: snapshot.ml,
            efc: snapshot.efc,
        };
        config.validate()?;
        validate_layers(&snapshot)?;
        Ok(Self {
            layers: snapshot.layers,
            ml: snapshot.ml,
            efc: snapshot.efc,
            index: snapshot.index,
            rng: StdRng::from_os_rng(),
        })
    }

    pub fn to_json(&self) -> Result<String, QuarryError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn from_json(json: &str) -> Result<Self, QuarryError> {
        Self::from_snapshot(serde_json::from_str(json)?)
    }

    /// Compact encoding of the same snapshot [`ApproximateIndex::to_json`] produces.
    pub fn to_binary(&self) -> Result<Vec<u8>, QuarryError> {
        bincode::serde::encode_to_vec(self.snapshot(), bincode::config::standard())
            .map_err(|e| QuarryError::Serialization(format!("HNSW encode failed: {}", e)))
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, QuarryError> {
        let (snapshot, read): (HnswSnapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| QuarryError::Serialization(format!("HNSW decode failed: {}", e)))?;
        if read != bytes.len() {
            return Err(QuarryError::Serialization(format!(
                "HNSW snapshot has {} trailing bytes",
                bytes.len() - read
            )));
        }
        Self::from_snapshot(snapshot)
    }
}

impl std::fmt::Debug for ApproximateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApproximateIndex")
            .field("layers", &self.layers)
            .field("ml", &self.ml)
            .field("efc", &self.efc)
            .field("layer_sizes", &self.layer_sizes())
            .finish()
    }
}

fn validate_layers(snapshot: &HnswSnapshot) -> Result<(), QuarryError> {
    let bad = |msg: String| Err(QuarryError::Serialization(format!("invalid HNSW snapshot: {}", msg)));

    if snapshot.index.len() != snapshot.layers {
        return bad(format!(
            "{} layers declared but {} stored",
            snapshot.layers,
            snapshot.index.len()
        ));
    }
    let empty = snapshot.index.iter().filter(|l| l.is_empty()).count();
    if empty != 0 && empty != snapshot.layers {
        return bad("some layers are empty and others are not".into());
    }

    let dims = snapshot.index.iter().flatten().map(|n| n.vector.len()).next();
    let base = snapshot.layers - 1;
    for (n, layer) in snapshot.index.iter().enumerate() {
        let below_len = snapshot.index.get(n + 1).map(Vec::len);
        for (i, node) in layer.iter().enumerate() {
            if Some(node.vector.len()) != dims || node.vector.is_empty() {
                return bad(format!("layer {} node {} has a different vector length", n, i));
            }
            if let Some(c) = node.connections.iter().find(|&&c| c >= layer.len()) {
                return bad(format!("layer {} node {} links to missing node {}", n, i, c));
            }
            match (node.layer_below, below_len) {
                (None, None) => {}
                (Some(b), Some(len)) if b < len => {}
                _ if n == base => {
                    return bad(format!("base layer node {} has a layer below", i));
                }
                _ => {
                    return bad(format!("layer {} node {} has no valid layer below", n, i));
                }
            }
        }
    }
    Ok(())
}

fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Next layer's entry point: the `layer_below` of the nearest result.
fn next_entry(layer: &[Node], results: &[(f32, usize)]) -> usize {
    results
        .first()
        .and_then(|&(_, i)| layer[i].layer_below)
        .unwrap_or(0)
}

/// Bounded beam search of `layer` starting from `entry`.
///
/// Returns at most `ef` `(distance, position)` pairs sorted ascending.
fn search_layer(layer: &[Node], entry: usize, query: &[f32], ef: usize) -> Vec<(f32, usize)> {
    let start = Candidate {
        distance: distance(query, &layer[entry].vector),
        node: entry,
    };
    let mut best = vec![start];
    let mut visited = HashSet::from([entry]);
    let mut candidates = BinaryHeap::from([Reverse(start)]);

    while let Some(Reverse(current)) = candidates.pop() {
        for &neighbour in &layer[current.node].connections {
            if !visited.insert(neighbour) {
                continue;
            }
            let candidate = Candidate {
                distance: distance(query, &layer[neighbour].vector),
                node: neighbour,
            };
            let admit = match best.last() {
                Some(worst) => best.len() < ef || candidate.distance < worst.distance,
                None => true,
            };
            if admit {
                let pos = best.partition_point(|b| b < &candidate);
                best.insert(pos, candidate);
                best.truncate(ef);
                candidates.push(Reverse(candidate));
            }
        }
    }

    best.into_iter().map(|c| (c.distance, c.node)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HnswConfig {
        HnswConfig::default()
    }

    fn points(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
            .collect()
    }

    fn build(n: usize, dims: usize) -> ApproximateIndex {
        let mut index = ApproximateIndex::with_seed(&config(), 42).unwrap();
        for p in points(n, dims, 7) {
            index.insert(p).unwrap();
        }
        index
    }

    fn brute_force(data: &[Vec<f32>], query: &[f32]) -> usize {
        let mut best = (f32::MAX, 0);
        for (i, p) in data.iter().enumerate() {
            let d = distance(p, query);
            if d < best.0 {
                best = (d, i);
            }
        }
        best.1
    }

    #[test]
    fn test_empty_search() {
        let index = ApproximateIndex::new(&config()).unwrap();
        assert!(index.search(&[1.0, 2.0], 10).unwrap().is_empty());
        assert!(index.is_empty());
        assert_eq!(index.dimensions(), None);
    }

    #[test]
    fn test_rejects_bad_config() {
        let bad = HnswConfig {
            layers: 0,
            ..config()
        };
        assert!(matches!(
            ApproximateIndex::new(&bad),
            Err(QuarryError::Config(_))
        ));
    }

    #[test]
    fn test_single_point() {
        let mut index = ApproximateIndex::with_seed(&config(), 1).unwrap();
        assert_eq!(index.insert(vec![1.0, 0.0]).unwrap(), 0);

        // The first point seeds every layer.
        assert_eq!(index.layer_sizes(), vec![1; 5]);
        let hits = index.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(hits, vec![(0.0, 0)]);
    }

    #[test]
    fn test_insert_returns_insertion_order() {
        let mut index = ApproximateIndex::with_seed(&config(), 1).unwrap();
        for (i, p) in points(20, 4, 3).into_iter().enumerate() {
            assert_eq!(index.insert(p).unwrap(), i);
        }
        assert_eq!(index.len(), 20);
    }

    #[test]
    fn test_layers_get_sparser() {
        let index = build(300, 8);
        let sizes = index.layer_sizes();
        assert_eq!(sizes[4], 300);
        assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
        assert!(sizes[0] < 300);
    }

    #[test]
    fn test_search_results_sorted() {
        let index = build(100, 8);
        let query = points(1, 8, 99).remove(0);
        let hits = index.search(&query, 10).unwrap();
        assert_eq!(hits.len(), 10);
        assert!(hits.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_inserted_point_is_found() {
        let data = points(50, 6, 7);
        let index = build(50, 6);
        for (i, p) in data.iter().enumerate() {
            let hits = index.search(p, data.len()).unwrap();
            assert_eq!(hits[0], (0.0, i), "point {} not found", i);
        }
    }

    #[test]
    fn test_full_width_search_is_exact() {
        let data = points(80, 5, 7);
        let index = build(80, 5);
        for query in points(10, 5, 1234) {
            let hits = index.search(&query, 80).unwrap();
            assert_eq!(hits.len(), 80);
            assert_eq!(hits[0].1, brute_force(&data, &query));
        }
    }

    #[test]
    fn test_default_ef_returns_one() {
        let index = build(30, 4);
        let hits = index.search(&[0.0; 4], DEFAULT_SEARCH_EF).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(index.search(&[0.0; 4], 0).unwrap().len(), 1);
    }

    #[test]
    fn test_dimension_checks() {
        let mut index = build(5, 4);
        assert!(matches!(
            index.insert(vec![1.0; 3]),
            Err(QuarryError::Dimension {
                expected: 4,
                actual: 3
            })
        ));
        assert!(matches!(
            index.search(&[1.0; 5], 1),
            Err(QuarryError::Dimension { .. })
        ));
        assert!(matches!(
            index.insert(vec![f32::NAN; 4]),
            Err(QuarryError::Schema(_))
        ));
        assert_eq!(index.len(), 5);
    }

    #[test]
    fn test_seeded_builds_are_identical() {
        assert_eq!(build(40, 4).snapshot(), build(40, 4).snapshot());
    }

    #[test]
    fn test_snapshot_structure_is_valid() {
        let index = build(120, 4);
        assert!(validate_layers(&index.snapshot()).is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let index = build(60, 6);
        let restored = ApproximateIndex::from_json(&index.to_json().unwrap()).unwrap();
        assert_eq!(restored.snapshot(), index.snapshot());

        for query in points(5, 6, 500) {
            assert_eq!(
                restored.search(&query, 5).unwrap(),
                index.search(&query, 5).unwrap()
            );
        }
    }

    #[test]
    fn test_json_field_names() {
        let mut index = ApproximateIndex::with_seed(&config(), 1).unwrap();
        index.insert(vec![1.0]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();
        assert_eq!(value["L"], 5);
        assert_eq!(value["efc"], 10);
        assert!(value["mL"].is_number());
        assert!(value["index"][0][0]["layerBelow"].is_number());
        assert!(value["index"][4][0]["layerBelow"].is_null());
    }

    #[test]
    fn test_binary_round_trip() {
        let index = build(60, 6);
        let bytes = index.to_binary().unwrap();
        let restored = ApproximateIndex::from_binary(&bytes).unwrap();

        for query in points(5, 6, 600) {
            for ef in [1, 3, 10] {
                assert_eq!(
                    restored.search(&query, ef).unwrap(),
                    index.search(&query, ef).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_codecs_agree() {
        let index = build(30, 3);
        let via_json = ApproximateIndex::from_json(&index.to_json().unwrap()).unwrap();
        assert_eq!(via_json.to_binary().unwrap(), index.to_binary().unwrap());

        let via_binary = ApproximateIndex::from_binary(&index.to_binary().unwrap()).unwrap();
        assert_eq!(via_binary.to_json().unwrap(), index.to_json().unwrap());
    }

    #[test]
    fn test_binary_is_smaller_than_json() {
        let index = build(50, 16);
        assert!(index.to_binary().unwrap().len() < index.to_json().unwrap().len());
    }

    #[test]
    fn test_from_binary_rejects_garbage() {
        assert!(ApproximateIndex::from_binary(&[0xff, 0x01]).is_err());

        let mut bytes = build(5, 2).to_binary().unwrap();
        bytes.push(0);
        assert!(matches!(
            ApproximateIndex::from_binary(&bytes),
            Err(QuarryError::Serialization(_))
        ));
    }

    #[test]
    fn test_from_snapshot_rejects_broken_graphs() {
        let good = build(10, 2).snapshot();

        let mut dangling = good.clone();
        dangling.index[4][0].connections.push(999);
        assert!(ApproximateIndex::from_snapshot(dangling).is_err());

        let mut missing_layer = good.clone();
        missing_layer.index.pop();
        assert!(ApproximateIndex::from_snapshot(missing_layer).is_err());

        let mut bad_below = good.clone();
        bad_below.index[0][0].layer_below = None;
        assert!(ApproximateIndex::from_snapshot(bad_below).is_err());

        let mut base_below = good.clone();
        base_below.index[4][0].layer_below = Some(0);
        assert!(ApproximateIndex::from_snapshot(base_below).is_err());

        let mut ragged = good;
        ragged.index[4][1].vector.push(1.0);
        assert!(ApproximateIndex::from_snapshot(ragged).is_err());
    }

    #[test]
    fn test_restored_index_accepts_inserts() {
        let index = build(20, 3);
        let mut restored = ApproximateIndex::from_binary(&index.to_binary().unwrap()).unwrap();
        assert_eq!(restored.insert(vec![0.5, 0.5, 0.5]).unwrap(), 20);
        assert!(validate_layers(&restored.snapshot()).is_ok());
    }
}
