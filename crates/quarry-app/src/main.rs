mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use quarry_core::config::QuarryConfig;
use quarry_core::types::Chunk;
use quarry_core::IngestionMetadata;
use quarry_storage::{Collection, Database};
use quarry_vector::{
    get_stats, ApproximateIndex, BatchEmbeddingPipeline, HashEmbedding, SearchBackend,
    SearchEngine, SearchOptions, VectorIndex,
};

use cli::{build_filter, CliArgs, Command};

/// Recorded in ingestion metadata; a new version forces re-ingestion.
const CORPUS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a command needs, resolved from flags and config.
struct Context {
    config: QuarryConfig,
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl Context {
    fn collection(&self) -> Result<Collection, quarry_core::QuarryError> {
        Collection::open(
            &self.data_dir,
            &self.config.storage.store_name,
            &self.config.storage.collection_name,
        )
    }

    fn graph_path(&self) -> PathBuf {
        self.data_dir.join(format!(
            "{}_{}.hnsw",
            self.config.storage.store_name, self.config.storage.collection_name
        ))
    }

    fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(format!(
            "{}_{}.metadata.json",
            self.config.storage.store_name, self.config.storage.collection_name
        ))
    }

    fn pipeline(&self) -> Result<Arc<BatchEmbeddingPipeline>, quarry_core::QuarryError> {
        let embedder = HashEmbedding::new(self.config.pipeline.dimensions);
        Ok(Arc::new(BatchEmbeddingPipeline::new(
            embedder,
            self.config.pipeline.clone(),
            self.config.cache.clone(),
        )?))
    }
}

fn read_chunks(path: &Path) -> Result<Vec<Chunk>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

async fn run_ingest(ctx: &Context, chunks_file: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let chunks = read_chunks(chunks_file)?;
    tracing::info!(path = %chunks_file.display(), chunks = chunks.len(), "Chunks loaded");

    let pipeline = ctx.pipeline()?;
    let metadata_path = ctx.metadata_path();
    let previous = if metadata_path.exists() {
        match IngestionMetadata::load(&metadata_path) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable ingestion metadata");
                None
            }
        }
    } else {
        None
    };

    let planned = IngestionMetadata::from_chunks(
        CORPUS_VERSION,
        pipeline.model_name(),
        pipeline.dimensions(),
        &chunks,
        chunks.len(),
        0,
    );
    if let Some(ref previous) = previous {
        if !force && !planned.needs_reingest(previous) {
            tracing::info!("Sources unchanged since last run; nothing to do (use --force to re-embed)");
            return Ok(());
        }
        let changed = planned.changed_sources(previous);
        tracing::info!(changed = ?changed, compatible = planned.is_compatible(previous), "Re-ingesting");
    }

    let start = Instant::now();
    let data = pipeline.generate_embeddings(chunks).await;
    let stats = get_stats(&data, start.elapsed());
    let report = pipeline.validate(&data);
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let index = Arc::new(VectorIndex::from_objects(data.indexed_objects()?)?);
    let collection = ctx.collection()?;
    index.checkpoint(&collection)?;

    let mut engine = SearchEngine::new(Arc::clone(&pipeline), Arc::clone(&index));
    let graph = engine.build_approximate(&ctx.config.hnsw)?;
    let graph_path = ctx.graph_path();
    std::fs::write(&graph_path, graph.to_binary()?)?;
    tracing::info!(path = %graph_path.display(), layers = ?graph.layer_sizes(), "HNSW snapshot written");

    let metadata = IngestionMetadata::from_chunks(
        CORPUS_VERSION,
        pipeline.model_name(),
        pipeline.dimensions(),
        &data.chunks,
        data.embeddings.len(),
        stats.failed,
    );
    metadata.save(&metadata_path)?;

    if !report.is_valid {
        tracing::warn!(issues = report.issues.len(), "Ingestion finished with quality issues");
    }
    Ok(())
}

async fn run_search(
    ctx: &Context,
    query: &str,
    top_k: Option<usize>,
    filters: &[(String, serde_json::Value)],
    durable: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let collection = ctx.collection()?;
    let index = if durable {
        VectorIndex::new()
    } else {
        VectorIndex::restore(&collection)?
    };
    let engine = SearchEngine::new(ctx.pipeline()?, Arc::new(index));

    let mut options = SearchOptions::top_k(top_k.unwrap_or(ctx.config.search.top_k))
        .with_filter(build_filter(filters));
    if durable {
        options = options.with_backend(SearchBackend::Durable(&collection));
    }

    for hit in engine.search_text(query, &options).await? {
        let mut record = hit.object.fields;
        record.insert("similarity".into(), hit.similarity.into());
        println!("{}", serde_json::Value::Object(record));
    }
    Ok(())
}

async fn run_ann(ctx: &Context, query: &str, ef: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let graph_path = ctx.graph_path();
    let bytes = std::fs::read(&graph_path).map_err(|e| {
        format!(
            "no HNSW snapshot at {} (run `quarry ingest` first): {}",
            graph_path.display(),
            e
        )
    })?;
    let graph = ApproximateIndex::from_binary(&bytes)?;
    let index = VectorIndex::restore(&ctx.collection()?)?;
    let engine = SearchEngine::new(ctx.pipeline()?, Arc::new(index)).with_approximate(graph);

    let ef = ef.unwrap_or(ctx.config.search.ef);
    for hit in engine.search_approximate(query, ef).await? {
        let mut record = hit
            .object
            .map(|o| o.fields)
            .unwrap_or_default();
        record.insert("distance".into(), hit.distance.into());
        record.insert("node".into(), hit.node.into());
        println!("{}", serde_json::Value::Object(record));
    }
    Ok(())
}

fn run_info(ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    println!("config:   {}", ctx.config_file.display());
    println!("data dir: {}", ctx.data_dir.display());

    let db = Arc::new(Database::open(&ctx.data_dir, &ctx.config.storage.store_name)?);
    println!("store:    {}", db.path().display());
    for name in db.collection_names()? {
        let count = db.collection(&name)?.count()?;
        println!("  {:<20} {} records", name, count);
    }

    let graph_path = ctx.graph_path();
    if let Ok(bytes) = std::fs::read(&graph_path) {
        let graph = ApproximateIndex::from_binary(&bytes)?;
        println!("graph:    {} ({:?} nodes per layer)", graph_path.display(), graph.layer_sizes());
    }

    let metadata_path = ctx.metadata_path();
    if metadata_path.exists() {
        let metadata = IngestionMetadata::load(&metadata_path)?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config is read before tracing starts so its log level can apply.
    let config_file = args.resolve_config_path();
    let loaded = config_file
        .exists()
        .then(|| QuarryConfig::load(&config_file));
    let configured_level = match &loaded {
        Some(Ok(config)) => config.general.log_level.clone(),
        _ => "info".to_string(),
    };
    let level = args.log_level.clone().unwrap_or(configured_level);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::debug!("Starting quarry v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Some(Ok(config)) => {
            tracing::info!(path = %config_file.display(), "Configuration loaded");
            config
        }
        Some(Err(e)) => {
            tracing::warn!(path = %config_file.display(), error = %e, "Invalid config, using defaults");
            QuarryConfig::default()
        }
        None => QuarryConfig::default(),
    };
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }

    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let ctx = Context {
        config,
        config_file,
        data_dir,
    };

    match args.command {
        Command::Ingest { chunks, force } => run_ingest(&ctx, &chunks, force).await,
        Command::Search {
            query,
            top_k,
            filters,
            durable,
        } => run_search(&ctx, &query, top_k, &filters, durable).await,
        Command::Ann { query, ef } => run_ann(&ctx, &query, ef).await,
        Command::Info => run_info(&ctx),
    }
}
