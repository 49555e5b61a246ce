//! Quarry Storage crate - durable, transactional collections backed by SQLite.
//!
//! Provides a WAL-mode store with migrations, named collections with
//! all-or-nothing bulk inserts, and a streaming cursor that reads one record
//! at a time.

pub mod collection;
pub mod cursor;
pub mod db;
pub mod migrations;

pub use collection::Collection;
pub use cursor::{RecordCursor, StoredRecord};
pub use db::{Database, DEFAULT_COLLECTION_NAME, DEFAULT_STORE_NAME};
