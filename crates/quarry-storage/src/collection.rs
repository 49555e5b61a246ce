//! Named collections of JSON records.
//!
//! Every record gets a monotonically increasing key on insert. Writes of
//! several records happen inside one transaction: either all of them land
//! or none do.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use quarry_core::error::QuarryError;

use crate::cursor::RecordCursor;
use crate::db::{Database, DEFAULT_COLLECTION_NAME, DEFAULT_STORE_NAME};
use crate::migrations::collection_table;

/// Handle to one collection of a [`Database`].
#[derive(Debug, Clone)]
pub struct Collection {
    db: Arc<Database>,
    name: String,
    table: String,
}

impl Collection {
    pub(crate) fn new(db: Arc<Database>, name: &str) -> Self {
        Self {
            db,
            name: name.to_string(),
            table: collection_table(name),
        }
    }

    /// Open `(store_name, collection_name)` under `dir`, creating whatever is missing.
    pub fn open(dir: &Path, store_name: &str, collection_name: &str) -> Result<Self, QuarryError> {
        let db = Arc::new(Database::open(dir, store_name)?);
        db.collection(collection_name)
    }

    /// Open the default collection of the default store under `dir`.
    pub fn open_default(dir: &Path) -> Result<Self, QuarryError> {
        Self::open(dir, DEFAULT_STORE_NAME, DEFAULT_COLLECTION_NAME)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Insert a single record.
    pub fn insert<T: Serialize>(&self, record: &T) -> Result<(), QuarryError> {
        self.insert_all(std::slice::from_ref(record)).map(|_| ())
    }

    /// Insert `records` in one transaction.
    ///
    /// If any record fails to serialize or write, the whole batch is rolled
    /// back and the error is returned.
    pub fn insert_all<T: Serialize>(&self, records: &[T]) -> Result<usize, QuarryError> {
        let written = self.db.with_transaction(|tx| self.write_records(tx, records))?;
        info!(collection = %self.name, records = written, "Committed insert");
        Ok(written)
    }

    /// Delete every record in the collection. Returns the number removed.
    pub fn clear(&self) -> Result<usize, QuarryError> {
        let removed = self.db.with_conn(|conn| self.delete_all(conn))?;
        info!(collection = %self.name, records = removed, "Cleared collection");
        Ok(removed)
    }

    /// Replace the contents of the collection with `records` in one transaction.
    pub fn replace_all<T: Serialize>(&self, records: &[T]) -> Result<usize, QuarryError> {
        let written = self.db.with_transaction(|tx| {
            self.delete_all(tx)?;
            self.write_records(tx, records)
        })?;
        info!(collection = %self.name, records = written, "Replaced collection contents");
        Ok(written)
    }

    /// Number of records currently stored.
    pub fn count(&self) -> Result<u64, QuarryError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", self.table), [], |row| {
                    row.get(0)
                })
                .map_err(|e| QuarryError::Persistence(e.to_string()))?;
            Ok(count as u64)
        })
    }

    /// Start a single pass over the collection in insertion order.
    ///
    /// Records are fetched one at a time; see [`RecordCursor`].
    pub fn cursor(&self) -> Result<RecordCursor, QuarryError> {
        RecordCursor::open(self.db.path(), &self.name, &self.table)
    }

    fn write_records<T: Serialize>(&self, conn: &Connection, records: &[T]) -> Result<usize, QuarryError> {
        let mut stmt = conn
            .prepare(&format!("INSERT INTO \"{}\" (record) VALUES (?1)", self.table))
            .map_err(|e| QuarryError::Persistence(e.to_string()))?;

        for (i, record) in records.iter().enumerate() {
            let json = serde_json::to_string(record).map_err(|e| {
                QuarryError::Persistence(format!("Record {} could not be serialized: {}", i, e))
            })?;
            stmt.execute(rusqlite::params![json]).map_err(|e| {
                QuarryError::Persistence(format!("Failed to write record {}: {}", i, e))
            })?;
        }
        debug!(collection = %self.name, records = records.len(), "Wrote records");
        Ok(records.len())
    }

    fn delete_all(&self, conn: &Connection) -> Result<usize, QuarryError> {
        conn.execute(&format!("DELETE FROM \"{}\"", self.table), [])
            .map_err(|e| QuarryError::Persistence(format!("Failed to clear collection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::Error as _;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::open_default(dir.path()).unwrap();
        (dir, collection)
    }

    /// Serializes normally unless `poison` is set.
    struct Flaky {
        value: u32,
        poison: bool,
    }

    impl Serialize for Flaky {
        fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
            if self.poison {
                return Err(S::Error::custom("poisoned record"));
            }
            s.serialize_u32(self.value)
        }
    }

    #[test]
    fn test_open_default_names() {
        let (_dir, collection) = open_temp();
        assert_eq!(collection.name(), DEFAULT_COLLECTION_NAME);
        assert_eq!(collection.database().name(), DEFAULT_STORE_NAME);
        assert_eq!(collection.count().unwrap(), 0);
    }

    #[test]
    fn test_insert_single_and_many() {
        let (_dir, collection) = open_temp();
        collection.insert(&json!({"id": "a"})).unwrap();
        let written = collection
            .insert_all(&[json!({"id": "b"}), json!({"id": "c"})])
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(collection.count().unwrap(), 3);
    }

    #[test]
    fn test_insert_all_is_atomic() {
        let (_dir, collection) = open_temp();
        collection.insert(&json!({"id": "existing"})).unwrap();

        let batch = vec![
            Flaky { value: 1, poison: false },
            Flaky { value: 2, poison: true },
            Flaky { value: 3, poison: false },
        ];
        let result = collection.insert_all(&batch);

        assert!(matches!(result, Err(QuarryError::Persistence(_))));
        assert_eq!(collection.count().unwrap(), 1);
    }

    #[test]
    fn test_clear() {
        let (_dir, collection) = open_temp();
        collection
            .insert_all(&[json!(1), json!(2), json!(3)])
            .unwrap();
        assert_eq!(collection.clear().unwrap(), 3);
        assert_eq!(collection.count().unwrap(), 0);
    }

    #[test]
    fn test_replace_all() {
        let (_dir, collection) = open_temp();
        collection.insert_all(&[json!("old"), json!("old")]).unwrap();
        collection.replace_all(&[json!("new")]).unwrap();

        let values: Vec<_> = collection
            .cursor()
            .unwrap()
            .map(|r| r.unwrap().value)
            .collect();
        assert_eq!(values, vec![json!("new")]);
    }

    #[test]
    fn test_failed_replace_keeps_old_contents() {
        let (_dir, collection) = open_temp();
        collection.insert_all(&[Flaky { value: 7, poison: false }]).unwrap();

        let result = collection.replace_all(&[Flaky { value: 8, poison: true }]);
        assert!(result.is_err());
        assert_eq!(collection.count().unwrap(), 1);
    }

    #[test]
    fn test_collections_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = Collection::open(dir.path(), "store", "a").unwrap();
        let b = Collection::open(dir.path(), "store", "b").unwrap();

        a.insert(&json!({"x": 1})).unwrap();
        assert_eq!(a.count().unwrap(), 1);
        assert_eq!(b.count().unwrap(), 0);
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let collection = Collection::open_default(dir.path()).unwrap();
            collection.insert(&json!({"id": "persisted"})).unwrap();
        }
        let collection = Collection::open_default(dir.path()).unwrap();
        assert_eq!(collection.count().unwrap(), 1);
    }
}
