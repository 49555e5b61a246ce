//! Store schema migrations.
//!
//! Version 1 creates the collection registry. Collection tables themselves
//! are created on first open, see [`create_collection_table`].

use rusqlite::Connection;
use tracing::info;

use quarry_core::error::QuarryError;

/// Run all pending store migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), QuarryError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| QuarryError::Persistence(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| QuarryError::Persistence(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: collection_registry");
    }

    Ok(())
}

/// Version 1: registry of named collections.
fn apply_v1(conn: &Connection) -> Result<(), QuarryError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS collections (
            name        TEXT PRIMARY KEY NOT NULL,
            table_name  TEXT NOT NULL UNIQUE,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        INSERT INTO schema_migrations (version, name) VALUES (1, 'collection_registry');
        ",
    )
    .map_err(|e| QuarryError::Persistence(format!("Migration v1 failed: {}", e)))
}

/// SQL table backing the collection `name`. Names are validated identifiers.
pub fn collection_table(name: &str) -> String {
    format!("collection_{}", name)
}

/// Create the table for collection `name` and register it, if missing.
///
/// Returns true when the collection did not exist before.
pub fn create_collection_table(conn: &Connection, name: &str) -> Result<bool, QuarryError> {
    let table = collection_table(name);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (
            seq     INTEGER PRIMARY KEY AUTOINCREMENT,
            record  TEXT NOT NULL
        );",
        table
    ))
    .map_err(|e| QuarryError::Persistence(format!("Failed to create collection '{}': {}", name, e)))?;

    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO collections (name, table_name) VALUES (?1, ?2)",
            rusqlite::params![name, table],
        )
        .map_err(|e| QuarryError::Persistence(format!("Failed to register collection '{}': {}", name, e)))?;

    Ok(inserted > 0)
}
