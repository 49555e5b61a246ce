//! Streaming iteration over a collection.
//!
//! A [`RecordCursor`] owns a dedicated read-only connection and fetches one
//! record per advance, keyed on the last sequence number it returned. The
//! connection holds a read transaction for the whole pass, so the cursor
//! sees the collection as it was when opened; writes committed afterwards
//! are not observed. The transaction ends and the connection is closed as
//! soon as the cursor is exhausted, hits an error, or is dropped early.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use quarry_core::error::QuarryError;

/// One record read back from a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Key assigned on insert; increases with insertion order.
    pub key: i64,
    pub value: Value,
}

/// Single-pass, lazily advancing iterator over a collection.
pub struct RecordCursor {
    conn: Option<Connection>,
    collection: String,
    sql: String,
    last_key: i64,
    yielded: usize,
}

impl RecordCursor {
    pub(crate) fn open(path: &Path, collection: &str, table: &str) -> Result<Self, QuarryError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| QuarryError::Persistence(format!("Failed to open cursor: {}", e)))?;

        // A deferred BEGIN takes its WAL snapshot on the first read.
        conn.execute_batch("BEGIN")
            .map_err(|e| QuarryError::Persistence(format!("Failed to begin cursor read: {}", e)))?;
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(|e| QuarryError::Persistence(format!("Failed to begin cursor read: {}", e)))?;

        debug!(collection, "Cursor opened");

        Ok(Self {
            conn: Some(conn),
            collection: collection.to_string(),
            sql: format!(
                "SELECT seq, record FROM \"{}\" WHERE seq > ?1 ORDER BY seq LIMIT 1",
                table
            ),
            last_key: 0,
            yielded: 0,
        })
    }

    /// True once the underlying connection has been released.
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Number of records returned so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// End the read transaction and release the connection. Further
    /// advances yield nothing.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.execute_batch("COMMIT") {
                warn!(collection = %self.collection, error = %e, "Cursor read did not end cleanly");
            }
            if let Err((_, e)) = conn.close() {
                warn!(collection = %self.collection, error = %e, "Cursor close failed");
            }
            debug!(collection = %self.collection, yielded = self.yielded, "Cursor closed");
        }
    }

    fn advance(&mut self) -> Result<Option<StoredRecord>, QuarryError> {
        let Some(conn) = self.conn.as_ref() else {
            return Ok(None);
        };

        let row: Option<(i64, String)> = conn
            .query_row(&self.sql, rusqlite::params![self.last_key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()
            .map_err(|e| QuarryError::Persistence(format!("Cursor advance failed: {}", e)))?;

        let Some((key, json)) = row else {
            return Ok(None);
        };

        let value = serde_json::from_str(&json).map_err(|e| {
            QuarryError::Serialization(format!("Record {} is not valid JSON: {}", key, e))
        })?;
        self.last_key = key;
        self.yielded += 1;
        Ok(Some(StoredRecord { key, value }))
    }
}

impl Iterator for RecordCursor {
    type Item = Result<StoredRecord, QuarryError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for RecordCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RecordCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCursor")
            .field("collection", &self.collection)
            .field("last_key", &self.last_key)
            .field("closed", &self.is_closed())
            .finish()
    }
}
