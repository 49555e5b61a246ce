//! In-memory vector index with filtered brute-force cosine similarity search.
//!
//! Objects keep their insertion order. Every object must carry the same
//! field names as the first one inserted, and an embedding of the same
//! length made of finite numbers. Search can also run directly against a
//! durable collection, streaming records instead of reading the in-memory
//! list.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::{debug, info};

use quarry_core::error::QuarryError;
use quarry_core::types::Chunk;
use quarry_storage::Collection;

/// Field name under which the embedding is stored in persisted records.
pub const EMBEDDING_FIELD: &str = "embedding";

/// Results returned when the caller does not ask for a specific count.
pub const DEFAULT_TOP_K: usize = 5;

/// A record in the index: arbitrary named fields plus an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedObject {
    pub fields: Map<String, Value>,
    pub embedding: Vec<f32>,
}

impl IndexedObject {
    pub fn new(fields: Map<String, Value>, embedding: Vec<f32>) -> Self {
        Self { fields, embedding }
    }

    /// Build an object holding every field of `chunk`.
    pub fn from_chunk(chunk: &Chunk, embedding: Vec<f32>) -> Result<Self, QuarryError> {
        match serde_json::to_value(chunk)? {
            Value::Object(fields) => Ok(Self { fields, embedding }),
            other => Err(QuarryError::Schema(format!(
                "chunk serialized to a non-object value: {}",
                other
            ))),
        }
    }

    /// Add an extra field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    /// Read the chunk fields back. Extra fields are ignored.
    pub fn to_chunk(&self) -> Result<Chunk, QuarryError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    fn key_set(&self) -> BTreeSet<String> {
        self.fields.keys().cloned().collect()
    }

    /// Flat JSON record: the fields plus an `embedding` array.
    pub fn to_record(&self) -> Value {
        let mut record = self.fields.clone();
        record.insert(
            EMBEDDING_FIELD.to_string(),
            Value::Array(self.embedding.iter().map(|v| Value::from(*v as f64)).collect()),
        );
        Value::Object(record)
    }

    /// Inverse of [`IndexedObject::to_record`].
    pub fn from_record(record: Value) -> Result<Self, QuarryError> {
        let Value::Object(mut fields) = record else {
            return Err(QuarryError::Schema("record is not a JSON object".into()));
        };
        let embedding = match fields.remove(EMBEDDING_FIELD) {
            Some(Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_f64().map(|f| f as f32).ok_or_else(|| {
                        QuarryError::Schema(format!("embedding contains a non-numeric value: {}", v))
                    })
                })
                .collect::<Result<Vec<f32>, _>>()?,
            Some(_) => {
                return Err(QuarryError::Schema("embedding is not an array".into()));
            }
            None => {
                return Err(QuarryError::Schema("record has no embedding".into()));
            }
        };
        Ok(Self { fields, embedding })
    }
}

/// Conjunctive equality predicate over object fields.
///
/// An empty filter matches every object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Map<String, Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on the `id` field.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::new().eq("id", id.into())
    }

    /// Require `key` to equal `value`.
    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, object: &IndexedObject) -> bool {
        self.conditions
            .iter()
            .all(|(key, expected)| object.fields.get(key) == Some(expected))
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(conditions: Map<String, Value>) -> Self {
        Self { conditions }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.conditions.clone()))
    }
}

/// Where a search reads its candidates from.
#[derive(Debug, Clone, Copy, Default)]
pub enum SearchBackend<'a> {
    /// The in-memory object list.
    #[default]
    Memory,
    /// Records streamed from a durable collection.
    Durable(&'a Collection),
}

/// Options for [`VectorIndex::search`].
#[derive(Debug, Clone)]
pub struct SearchOptions<'a> {
    pub top_k: usize,
    pub filter: Filter,
    pub backend: SearchBackend<'a>,
}

impl Default for SearchOptions<'_> {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            filter: Filter::default(),
            backend: SearchBackend::Memory,
        }
    }
}

impl<'a> SearchOptions<'a> {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_backend(mut self, backend: SearchBackend<'a>) -> Self {
        self.backend = backend;
        self
    }
}

/// A single hit returned from a search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredObject {
    /// Cosine similarity rounded to 6 decimal places.
    pub similarity: f64,
    pub object: IndexedObject,
}

#[derive(Debug, Default)]
struct IndexInner {
    objects: Vec<IndexedObject>,
    keys: Option<BTreeSet<String>>,
    dimensions: Option<usize>,
}

impl IndexInner {
    /// Check `object` against the embedding shape and the fixed key set.
    fn validate(&self, object: &IndexedObject) -> Result<(), QuarryError> {
        if object.fields.contains_key(EMBEDDING_FIELD) {
            return Err(QuarryError::Schema(format!(
                "field name '{}' is reserved",
                EMBEDDING_FIELD
            )));
        }
        if object.embedding.is_empty() {
            return Err(QuarryError::Schema("embedding must not be empty".into()));
        }
        if let Some(pos) = object.embedding.iter().position(|v| !v.is_finite()) {
            return Err(QuarryError::Schema(format!(
                "embedding contains a non-finite value at position {}",
                pos
            )));
        }
        if let Some(expected) = self.dimensions {
            if object.embedding.len() != expected {
                return Err(QuarryError::Dimension {
                    expected,
                    actual: object.embedding.len(),
                });
            }
        }
        if let Some(keys) = &self.keys {
            let actual = object.key_set();
            if &actual != keys {
                return Err(QuarryError::Schema(format!(
                    "object keys {:?} do not match index keys {:?}",
                    actual, keys
                )));
            }
        }
        Ok(())
    }

    fn push(&mut self, object: IndexedObject) -> Result<(), QuarryError> {
        self.validate(&object)?;
        if self.keys.is_none() {
            self.keys = Some(object.key_set());
            self.dimensions = Some(object.embedding.len());
        }
        self.objects.push(object);
        Ok(())
    }

    fn position(&self, filter: &Filter) -> Option<usize> {
        self.objects.iter().position(|o| filter.matches(o))
    }
}

/// In-memory vector index using brute-force cosine similarity.
///
/// Cloning shares the underlying storage.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    inner: Arc<RwLock<IndexInner>>,
}

impl VectorIndex {
    /// Create a new empty vector index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index from `objects`, validating each in order.
    pub fn from_objects(objects: Vec<IndexedObject>) -> Result<Self, QuarryError> {
        let index = Self::new();
        for object in objects {
            index.add(object)?;
        }
        Ok(index)
    }

    /// Append `object` after validating its embedding and field names.
    pub fn add(&self, object: IndexedObject) -> Result<(), QuarryError> {
        self.write()?.push(object)
    }

    /// Replace the first object matching `filter` with `object`.
    pub fn update(&self, filter: &Filter, object: IndexedObject) -> Result<(), QuarryError> {
        let mut inner = self.write()?;
        let pos = inner
            .position(filter)
            .ok_or_else(|| QuarryError::NotFound(format!("no object matches {}", filter)))?;
        inner.validate(&object)?;
        inner.objects[pos] = object;
        debug!(position = pos, "Updated object");
        Ok(())
    }

    /// Remove and return the first object matching `filter`.
    pub fn remove(&self, filter: &Filter) -> Result<IndexedObject, QuarryError> {
        let mut inner = self.write()?;
        let pos = inner
            .position(filter)
            .ok_or_else(|| QuarryError::NotFound(format!("no object matches {}", filter)))?;
        Ok(inner.objects.remove(pos))
    }

    /// Remove the first match of each filter, skipping filters that match nothing.
    ///
    /// Returns the number of objects removed.
    pub fn remove_batch(&self, filters: &[Filter]) -> Result<usize, QuarryError> {
        let mut inner = self.write()?;
        let mut removed = 0;
        for filter in filters {
            if let Some(pos) = inner.position(filter) {
                inner.objects.remove(pos);
                removed += 1;
            }
        }
        debug!(requested = filters.len(), removed, "Batch remove");
        Ok(removed)
    }

    /// First object matching `filter`, if any.
    pub fn get(&self, filter: &Filter) -> Result<Option<IndexedObject>, QuarryError> {
        let inner = self.read()?;
        Ok(inner.position(filter).map(|pos| inner.objects[pos].clone()))
    }

    /// Object at insertion position `position`.
    pub fn object_at(&self, position: usize) -> Option<IndexedObject> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.objects.get(position).cloned())
    }

    /// Snapshot of every object in insertion order.
    pub fn objects(&self) -> Vec<IndexedObject> {
        self.inner
            .read()
            .map(|inner| inner.objects.clone())
            .unwrap_or_default()
    }

    /// Return the top `options.top_k` objects by cosine similarity to `query`.
    ///
    /// Results are sorted by descending similarity; ties keep insertion (or
    /// storage) order. An empty index yields an empty list. A query holding
    /// NaN or infinity is a schema error.
    pub fn search(
        &self,
        query: &[f32],
        options: &SearchOptions<'_>,
    ) -> Result<Vec<ScoredObject>, QuarryError> {
        if let Some(pos) = query.iter().position(|v| !v.is_finite()) {
            return Err(QuarryError::Schema(format!(
                "query contains a non-finite value at position {}",
                pos
            )));
        }
        match options.backend {
            SearchBackend::Memory => self.search_memory(query, options),
            SearchBackend::Durable(collection) => search_collection(collection, query, options),
        }
    }

    fn search_memory(
        &self,
        query: &[f32],
        options: &SearchOptions<'_>,
    ) -> Result<Vec<ScoredObject>, QuarryError> {
        let inner = self.read()?;
        let mut ranked = Vec::new();
        for object in inner.objects.iter().filter(|o| options.filter.matches(o)) {
            let similarity = cosine_similarity(query, &object.embedding)?;
            push_ranked(&mut ranked, similarity, object, options.top_k);
        }
        Ok(ranked)
    }

    /// Replace the contents of `collection` with this index, in one transaction.
    pub fn checkpoint(&self, collection: &Collection) -> Result<usize, QuarryError> {
        let records: Vec<Value> = self.read()?.objects.iter().map(IndexedObject::to_record).collect();
        let written = collection.replace_all(&records)?;
        info!(collection = collection.name(), objects = written, "Checkpointed vector index");
        Ok(written)
    }

    /// Rebuild an index by streaming every record of `collection`.
    pub fn restore(collection: &Collection) -> Result<Self, QuarryError> {
        let index = Self::new();
        for record in collection.cursor()? {
            index.add(IndexedObject::from_record(record?.value)?)?;
        }
        info!(collection = collection.name(), objects = index.len(), "Restored vector index");
        Ok(index)
    }

    /// Return the number of objects currently stored in the index.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.objects.len()).unwrap_or(0)
    }

    /// Return true if the index contains no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding length fixed by the first insert.
    pub fn dimensions(&self) -> Option<usize> {
        self.inner.read().ok().and_then(|i| i.dimensions)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, IndexInner>, QuarryError> {
        self.inner
            .read()
            .map_err(|e| QuarryError::Index(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, IndexInner>, QuarryError> {
        self.inner
            .write()
            .map_err(|e| QuarryError::Index(format!("Lock poisoned: {}", e)))
    }
}

/// Filter, score and rank records streamed from `collection`.
///
/// Holds at most `top_k` objects in memory at any time.
fn search_collection(
    collection: &Collection,
    query: &[f32],
    options: &SearchOptions<'_>,
) -> Result<Vec<ScoredObject>, QuarryError> {
    let mut ranked = Vec::new();
    let mut scanned = 0usize;
    for record in collection.cursor()? {
        let object = IndexedObject::from_record(record?.value)?;
        scanned += 1;
        if !options.filter.matches(&object) {
            continue;
        }
        let similarity = cosine_similarity(query, &object.embedding)?;
        push_ranked(&mut ranked, similarity, &object, options.top_k);
    }
    debug!(collection = collection.name(), scanned, hits = ranked.len(), "Durable search");
    Ok(ranked)
}

/// Insert into a descending list capped at `top_k`, after any equal scores.
fn push_ranked(ranked: &mut Vec<ScoredObject>, similarity: f64, object: &IndexedObject, top_k: usize) {
    let pos = ranked.partition_point(|hit| hit.similarity >= similarity);
    if pos >= top_k {
        return;
    }
    ranked.insert(
        pos,
        ScoredObject {
            similarity,
            object: object.clone(),
        },
    );
    ranked.truncate(top_k);
}

/// Cosine similarity between two vectors, rounded to 6 decimal places.
///
/// Returns 0.0 if either vector has zero magnitude. Vectors of different
/// lengths are a dimension error.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64, QuarryError> {
    if a.len() != b.len() {
        return Err(QuarryError::Dimension {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return Ok(0.0);
    }

    Ok(round6(dot / (mag_a * mag_b)))
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
