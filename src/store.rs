//! Embedded prepared-transaction store
//!
//! The participant's local data engine: a single `data(sensor_id,
//! measurement)` table with the prepared-transaction surface of a real
//! database connection:
//!
//! - `begin` / `execute` / `rollback` for the one open transaction
//! - `prepare_transaction <gid>` makes the open transaction durable but
//!   invisible, bound to a name, and frees the connection
//! - `commit_prepared <gid>` / `rollback_prepared <gid>` finalize it,
//!   possibly from a different process incarnation
//!
//! Durable state (the table plus all prepared transactions) is held in a
//! single snapshot file rewritten via temp-file-then-rename, so a crash
//! never exposes a partial state.

use crate::sql::{self, SqlError, Statement};
use crate::types::SqlValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Store file magic number
const STORE_MAGIC: u32 = 0x5041_4344;

/// Store format version
const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] SqlError),
    #[error("no transaction in progress")]
    NoTransaction,
    #[error("a transaction is already in progress")]
    TransactionInProgress,
    #[error("duplicate key '{0}'")]
    DuplicateKey(String),
    #[error("prepared transaction '{0}' already exists")]
    GidExists(String),
    #[error("prepared transaction '{0}' does not exist")]
    UnknownGid(String),
    #[error("snapshot i/o: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot codec: {0}")]
    Codec(String),
}

/// One row mutation, replayed at commit time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowOp {
    Upsert { sensor_id: String, measurement: i64 },
    Delete { sensor_id: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    magic: u32,
    version: u32,
    rows: BTreeMap<String, i64>,
    prepared: BTreeMap<String, Vec<RowOp>>,
}

/// Embedded single-table store with prepared transactions
pub struct SqlStore {
    path: PathBuf,
    rows: BTreeMap<String, i64>,
    prepared: BTreeMap<String, Vec<RowOp>>,
    /// Row ops of the at-most-one open transaction (volatile)
    active: Option<Vec<RowOp>>,
}

impl SqlStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let mut store = SqlStore {
            path,
            rows: BTreeMap::new(),
            prepared: BTreeMap::new(),
            active: None,
        };

        if store.path.exists() {
            store.load()?;
        } else {
            store.persist()?;
        }
        Ok(store)
    }

    /// Start a transaction. The connection is single-owner: a second
    /// BEGIN without an intervening rollback/prepare is an error.
    pub fn begin(&mut self) -> Result<(), StoreError> {
        if self.active.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        self.active = Some(Vec::new());
        Ok(())
    }

    /// Execute one statement inside the open transaction.
    pub fn execute(&mut self, query: &str, args: &[SqlValue]) -> Result<(), StoreError> {
        if self.active.is_none() {
            return Err(StoreError::NoTransaction);
        }
        let statement = sql::parse(query, args)?;

        match statement {
            Statement::Insert {
                sensor_id,
                measurement,
            } => {
                if self.view_contains(&sensor_id) {
                    return Err(StoreError::DuplicateKey(sensor_id));
                }
                self.push_op(RowOp::Upsert {
                    sensor_id,
                    measurement,
                });
            }
            Statement::Update {
                sensor_id,
                measurement,
            } => {
                // Like SQL, updating a missing row affects zero rows.
                if self.view_contains(&sensor_id) {
                    self.push_op(RowOp::Upsert {
                        sensor_id,
                        measurement,
                    });
                }
            }
            Statement::Delete { sensor_id } => {
                if self.view_contains(&sensor_id) {
                    self.push_op(RowOp::Delete { sensor_id });
                }
            }
        }
        Ok(())
    }

    /// Make the open transaction durable under `gid` and free the
    /// connection. The effects stay invisible until `commit_prepared`.
    pub fn prepare_transaction(&mut self, gid: &str) -> Result<(), StoreError> {
        let ops = self.active.take().ok_or(StoreError::NoTransaction)?;
        if self.prepared.contains_key(gid) {
            self.active = Some(ops);
            return Err(StoreError::GidExists(gid.to_string()));
        }
        self.prepared.insert(gid.to_string(), ops);
        self.persist()
    }

    /// Apply a prepared transaction to the table.
    pub fn commit_prepared(&mut self, gid: &str) -> Result<(), StoreError> {
        let ops = self
            .prepared
            .remove(gid)
            .ok_or_else(|| StoreError::UnknownGid(gid.to_string()))?;

        for op in ops {
            match op {
                RowOp::Upsert {
                    sensor_id,
                    measurement,
                } => {
                    self.rows.insert(sensor_id, measurement);
                }
                RowOp::Delete { sensor_id } => {
                    self.rows.remove(&sensor_id);
                }
            }
        }
        self.persist()
    }

    /// Discard a prepared transaction.
    pub fn rollback_prepared(&mut self, gid: &str) -> Result<(), StoreError> {
        if self.prepared.remove(gid).is_none() {
            return Err(StoreError::UnknownGid(gid.to_string()));
        }
        self.persist()
    }

    /// Discard the open transaction, if any.
    pub fn rollback(&mut self) {
        self.active = None;
    }

    pub fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    pub fn has_prepared(&self, gid: &str) -> bool {
        self.prepared.contains_key(gid)
    }

    /// Committed value for a sensor id (open-transaction effects are not
    /// visible here).
    pub fn get(&self, sensor_id: &str) -> Option<i64> {
        self.rows.get(sensor_id).copied()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn push_op(&mut self, op: RowOp) {
        self.active
            .as_mut()
            .expect("checked by execute")
            .push(op);
    }

    /// Row existence as seen by the open transaction (table plus the
    /// transaction's own ops, in order).
    fn view_contains(&self, sensor_id: &str) -> bool {
        let mut present = self.rows.contains_key(sensor_id);
        if let Some(ops) = &self.active {
            for op in ops {
                match op {
                    RowOp::Upsert { sensor_id: k, .. } if k == sensor_id => present = true,
                    RowOp::Delete { sensor_id: k } if k == sensor_id => present = false,
                    _ => {}
                }
            }
        }
        present
    }

    fn persist(&self) -> Result<(), StoreError> {
        let snapshot = StoreSnapshot {
            magic: STORE_MAGIC,
            version: STORE_VERSION,
            rows: self.rows.clone(),
            prepared: self.prepared.clone(),
        };
        let bytes =
            bincode::serialize(&snapshot).map_err(|e| StoreError::Codec(e.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn load(&mut self) -> Result<(), StoreError> {
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;

        let snapshot: StoreSnapshot =
            bincode::deserialize(&bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        if snapshot.magic != STORE_MAGIC || snapshot.version != STORE_VERSION {
            return Err(StoreError::Codec("invalid store header".to_string()));
        }

        self.rows = snapshot.rows;
        self.prepared = snapshot.prepared;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> SqlStore {
        SqlStore::open(dir.path().join("data.db")).unwrap()
    }

    #[test]
    fn test_prepared_transaction_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.begin().unwrap();
        store
            .execute("insert into data values ('s1', 10)", &[])
            .unwrap();

        // Invisible until commit prepared.
        store.prepare_transaction("1").unwrap();
        assert!(!store.in_transaction());
        assert!(store.has_prepared("1"));
        assert_eq!(store.get("s1"), None);

        store.commit_prepared("1").unwrap();
        assert!(!store.has_prepared("1"));
        assert_eq!(store.get("s1"), Some(10));
    }

    #[test]
    fn test_rollback_prepared_discards() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.begin().unwrap();
        store
            .execute("insert into data values ('s1', 10)", &[])
            .unwrap();
        store.prepare_transaction("2").unwrap();
        store.rollback_prepared("2").unwrap();

        assert_eq!(store.get("s1"), None);
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn test_unknown_gid() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        assert!(matches!(
            store.commit_prepared("42"),
            Err(StoreError::UnknownGid(_))
        ));
        assert!(matches!(
            store.rollback_prepared("42"),
            Err(StoreError::UnknownGid(_))
        ));
    }

    #[test]
    fn test_prepared_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.db");

        {
            let mut store = SqlStore::open(&path).unwrap();
            store.begin().unwrap();
            store
                .execute("insert into data values ('s1', 10)", &[])
                .unwrap();
            store.prepare_transaction("3").unwrap();
        }

        let mut store = SqlStore::open(&path).unwrap();
        assert!(store.has_prepared("3"));
        store.commit_prepared("3").unwrap();
        assert_eq!(store.get("s1"), Some(10));

        // And the applied row survives another reopen.
        drop(store);
        let store = SqlStore::open(&path).unwrap();
        assert_eq!(store.get("s1"), Some(10));
    }

    #[test]
    fn test_single_owner_connection() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.begin().unwrap();
        assert!(matches!(
            store.begin(),
            Err(StoreError::TransactionInProgress)
        ));

        store.rollback();
        store.begin().unwrap();
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.begin().unwrap();
        store
            .execute("insert into data values ('s1', 10)", &[])
            .unwrap();
        assert!(matches!(
            store.execute("insert into data values ('s1', 11)", &[]),
            Err(StoreError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_update_and_delete_within_transaction() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.begin().unwrap();
        store
            .execute("insert into data values ('s1', 10)", &[])
            .unwrap();
        store
            .execute("update data set measurement = 20 where sensor_id = 's1'", &[])
            .unwrap();
        // Updating a row this transaction never created is a no-op.
        store
            .execute("update data set measurement = 5 where sensor_id = 'ghost'", &[])
            .unwrap();
        store.prepare_transaction("4").unwrap();
        store.commit_prepared("4").unwrap();

        assert_eq!(store.get("s1"), Some(20));
        assert_eq!(store.get("ghost"), None);

        store.begin().unwrap();
        store
            .execute("delete from data where sensor_id = 's1'", &[])
            .unwrap();
        store.prepare_transaction("5").unwrap();
        store.commit_prepared("5").unwrap();
        assert_eq!(store.get("s1"), None);
    }

    #[test]
    fn test_rollback_discards_open_transaction() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.begin().unwrap();
        store
            .execute("insert into data values ('s1', 10)", &[])
            .unwrap();
        store.rollback();

        assert_eq!(store.get("s1"), None);
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_execute_requires_transaction() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        assert!(matches!(
            store.execute("insert into data values ('s1', 10)", &[]),
            Err(StoreError::NoTransaction)
        ));
    }
}
