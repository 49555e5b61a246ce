pub mod config;
pub mod error;
pub mod metadata;
pub mod types;

pub use config::QuarryConfig;
pub use error::{QuarryError, Result};
pub use metadata::IngestionMetadata;
pub use types::*;
