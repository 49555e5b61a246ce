//! Benchmarks comparing exact and approximate search.
//!
//! The default corpus is 1,000 chunks so the suite stays quick. Set
//! `BENCH_FULL_SCALE=1` to run against 20,000 chunks:
//!
//! ```bash
//! BENCH_FULL_SCALE=1 cargo bench -p quarry-vector
//! ```
//!
//! Exact search is a linear scan; the HNSW graph only scans the base layer
//! around its entry point, so the gap widens with corpus size.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use quarry_core::config::HnswConfig;
use quarry_core::types::Chunk;
use quarry_vector::embedding::{EmbeddingService, HashEmbedding};
use quarry_vector::hnsw::ApproximateIndex;
use quarry_vector::index::{Filter, IndexedObject, SearchOptions, VectorIndex};

const CI_CHUNK_COUNT: usize = 1_000;

const FULL_SCALE_CHUNK_COUNT: usize = 20_000;

const DIMS: usize = 384;

fn chunk_count() -> usize {
    if std::env::var("BENCH_FULL_SCALE").is_ok() {
        FULL_SCALE_CHUNK_COUNT
    } else {
        CI_CHUNK_COUNT
    }
}

/// Unique text per chunk so the hash model produces distinct vectors.
fn generate_chunk_text(index: usize) -> String {
    format!(
        "Components are the building blocks of the interface. Each component \
         owns its template, styles and state, and communicates with its parent \
         through inputs and outputs. Section {} covers lifecycle hooks.",
        index
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

/// Build both indexes over the same `count` chunks.
fn build_indexes(count: usize, embedder: &HashEmbedding) -> (VectorIndex, ApproximateIndex) {
    let rt = runtime();
    let index = VectorIndex::new();
    let mut graph =
        ApproximateIndex::with_seed(&HnswConfig::default(), 7).expect("invalid HNSW config");

    for i in 0..count {
        let chunk = Chunk::new(
            format!("guide/page-{}.md", i % 50),
            i,
            "Guide",
            "/guide",
            generate_chunk_text(i),
        );
        let embedding = rt.block_on(embedder.embed(&chunk.content)).expect("embed failed");
        graph.insert(embedding.clone()).expect("graph insert failed");
        let object = IndexedObject::from_chunk(&chunk, embedding).expect("object failed");
        index.add(object).expect("index add failed");
    }

    assert_eq!(index.len(), count);
    assert_eq!(graph.len(), count);
    (index, graph)
}

fn bench_exact_vs_approximate(c: &mut Criterion) {
    let count = chunk_count();
    let embedder = HashEmbedding::new(DIMS);
    let (index, graph) = build_indexes(count, &embedder);
    let query = runtime()
        .block_on(embedder.embed("component lifecycle hooks"))
        .expect("query embed failed");

    let mut group = c.benchmark_group("search");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function(format!("exact_top10_{}chunks", count), |b| {
        let options = SearchOptions::top_k(10);
        b.iter(|| {
            let hits = index.search(&query, &options).expect("search failed");
            assert_eq!(hits.len(), 10);
            hits
        });
    });

    group.bench_function(format!("exact_filtered_top10_{}chunks", count), |b| {
        let options = SearchOptions::top_k(10)
            .with_filter(Filter::new().eq("source_file", "guide/page-3.md"));
        b.iter(|| index.search(&query, &options).expect("search failed"));
    });

    for ef in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::new("hnsw", ef), &ef, |b, &ef| {
            b.iter(|| graph.search(&query, ef).expect("search failed"));
        });
    }

    group.finish();
}

fn bench_hnsw_codecs(c: &mut Criterion) {
    let embedder = HashEmbedding::new(DIMS);
    let (_index, graph) = build_indexes(CI_CHUNK_COUNT, &embedder);
    let json = graph.to_json().expect("json encode failed");
    let binary = graph.to_binary().expect("binary encode failed");

    eprintln!(
        "\nHNSW snapshot of {} points: json {} bytes, binary {} bytes",
        graph.len(),
        json.len(),
        binary.len()
    );

    let mut group = c.benchmark_group("hnsw_codecs");
    group.sample_size(20);
    group.bench_function("from_json", |b| {
        b.iter(|| ApproximateIndex::from_json(&json).expect("json decode failed"));
    });
    group.bench_function("from_binary", |b| {
        b.iter(|| ApproximateIndex::from_binary(&binary).expect("binary decode failed"));
    });
    group.finish();
}

criterion_group!(benches, bench_exact_vs_approximate, bench_hnsw_codecs);
criterion_main!(benches);
