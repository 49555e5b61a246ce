//! Store connection management.
//!
//! A store is one SQLite file, `<dir>/<store_name>.db`, holding any number
//! of named collections. The writer connection is wrapped in a Mutex;
//! cursors open their own read-only connections.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction};
use tracing::info;

use quarry_core::config::validate_identifier;
use quarry_core::error::QuarryError;

use crate::collection::Collection;
use crate::migrations;

/// Store opened when the caller does not name one.
pub const DEFAULT_STORE_NAME: &str = "quarry";

/// Collection opened when the caller does not name one.
pub const DEFAULT_COLLECTION_NAME: &str = "vectors";

/// Durable, transactional store of named collections.
pub struct Database {
    conn: Mutex<Connection>,
    name: String,
    path: PathBuf,
}

impl Database {
    /// Open (or create) the store `store_name` inside `dir`.
    ///
    /// Configures WAL mode and runs pending migrations. Any failure here is
    /// fatal for the caller; there is no retry.
    pub fn open(dir: &Path, store_name: &str) -> Result<Self, QuarryError> {
        validate_identifier("store name", store_name)?;

        std::fs::create_dir_all(dir).map_err(|e| {
            QuarryError::Persistence(format!(
                "Failed to create store directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        let path = dir.join(format!("{}.db", store_name));

        let conn = Connection::open(&path)
            .map_err(|e| QuarryError::Persistence(format!("Failed to open store: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| QuarryError::Persistence(format!("Failed to set pragmas: {}", e)))?;

        migrations::run_migrations(&conn)?;

        info!(store = store_name, path = %path.display(), "Store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            name: store_name.to_string(),
            path,
        })
    }

    /// Open the default store inside `dir`.
    pub fn open_default(dir: &Path) -> Result<Self, QuarryError> {
        Self::open(dir, DEFAULT_STORE_NAME)
    }

    /// Open (creating if missing) the collection `name` in this store.
    pub fn collection(self: &Arc<Self>, name: &str) -> Result<Collection, QuarryError> {
        validate_identifier("collection name", name)?;
        let created = self.with_conn(|conn| migrations::create_collection_table(conn, name))?;
        if created {
            info!(store = %self.name, collection = name, "Created collection");
        }
        Ok(Collection::new(Arc::clone(self), name))
    }

    /// Names of all collections registered in this store.
    pub fn collection_names(&self) -> Result<Vec<String>, QuarryError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM collections ORDER BY name")
                .map_err(|e| QuarryError::Persistence(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| QuarryError::Persistence(e.to_string()))?;

            let mut names = Vec::new();
            for row in rows {
                names.push(row.map_err(|e| QuarryError::Persistence(e.to_string()))?);
            }
            Ok(names)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing SQLite file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure with a reference to the writer connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, QuarryError>
    where
        F: FnOnce(&Connection) -> Result<T, QuarryError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| QuarryError::Persistence(format!("Store lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside one transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; on error it is
    /// rolled back and nothing `f` wrote is kept.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, QuarryError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, QuarryError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| QuarryError::Persistence(format!("Store lock poisoned: {}", e)))?;
        let tx = conn
            .transaction()
            .map_err(|e| QuarryError::Persistence(format!("Failed to begin transaction: {}", e)))?;

        let value = f(&tx)?;

        tx.commit()
            .map_err(|e| QuarryError::Persistence(format!("Failed to commit transaction: {}", e)))?;
        Ok(value)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}
