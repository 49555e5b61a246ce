//! CLI argument definitions for the quarry binary.
//!
//! Uses `clap` with derive macros. Global options resolve as
//! CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use quarry_vector::Filter;

/// Quarry: embedded vector similarity search over pre-chunked documents.
#[derive(Parser, Debug)]
#[command(name = "quarry", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the store, graph snapshot and ingestion metadata.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Embed a JSON array of chunks, checkpoint it and build the HNSW graph.
    Ingest {
        /// File containing the chunks.
        chunks: PathBuf,
        /// Re-embed even if no source changed since the last run.
        #[arg(long)]
        force: bool,
    },
    /// Exact cosine search.
    Search {
        query: String,
        #[arg(short = 'k', long = "top-k")]
        top_k: Option<usize>,
        /// Equality filter as key=value; repeat to AND several together.
        #[arg(short = 'f', long = "filter", value_parser = parse_filter_pair)]
        filters: Vec<(String, Value)>,
        /// Stream candidates from the store instead of loading them first.
        #[arg(long)]
        durable: bool,
    },
    /// Approximate search over the HNSW graph.
    Ann {
        query: String,
        /// Base-layer beam width.
        #[arg(long)]
        ef: Option<usize>,
    },
    /// Show configuration, store contents and the last ingestion run.
    Info,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > QUARRY_CONFIG env var > ~/.quarry/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("QUARRY_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Data directory override from --data-dir, if given.
    pub fn resolve_data_dir(&self) -> Option<String> {
        self.data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }
}

/// Parse `key=value`. The value is read as JSON when it parses, so
/// `chunk_index=3` matches a number; anything else is a string.
fn parse_filter_pair(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Fold parsed pairs into one conjunctive filter.
pub fn build_filter(pairs: &[(String, Value)]) -> Filter {
    pairs
        .iter()
        .fold(Filter::new(), |f, (k, v)| f.eq(k.clone(), v.clone()))
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".quarry").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".quarry").join("config.toml");
    }
    PathBuf::from("config.toml")
}
