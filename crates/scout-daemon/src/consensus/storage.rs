//! redb tables shared by the log store and the state machine store.
//!
//! One database file, `raft.redb`, holds everything that must survive a
//! restart: log entries, vote, committed id, last purged id, and the latest
//! snapshot. Values are JSON.

use super::typ::NodeId;
use openraft::{AnyError, ErrorSubject, ErrorVerb, StorageError, StorageIOError};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

pub(crate) const LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("logs");
pub(crate) const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub(crate) const VOTE_KEY: &str = "vote";
pub(crate) const COMMITTED_KEY: &str = "committed";
pub(crate) const LAST_PURGED_KEY: &str = "last_purged";
pub(crate) const SNAPSHOT_KEY: &str = "snapshot";

/// File name of the database inside the data directory.
pub const DB_FILE: &str = "raft.redb";

/// Open (or create) the database and make sure both tables exist.
pub(crate) fn open_database(data_dir: &Path) -> Result<Database, redb::Error> {
    std::fs::create_dir_all(data_dir).map_err(redb::Error::Io)?;
    let db = Database::create(data_dir.join(DB_FILE))?;
    let txn = db.begin_write()?;
    {
        txn.open_table(LOGS)?;
        txn.open_table(META)?;
    }
    txn.commit()?;
    Ok(db)
}

pub(crate) fn read_meta<T: DeserializeOwned>(
    db: &Database,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(META)?;
    match table.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        None => Ok(None),
    }
}

pub(crate) fn write_meta<T: Serialize>(db: &Database, key: &str, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(META)?;
        table.insert(key, bytes.as_slice())?;
    }
    txn.commit()?;
    Ok(())
}

pub(crate) fn remove_meta(db: &Database, key: &str) -> Result<(), StoreError> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(META)?;
        table.remove(key)?;
    }
    txn.commit()?;
    Ok(())
}

/// Anything that can go wrong talking to the database.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] redb::Error),
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("State machine rejected snapshot: {0}")]
    Restore(String),
}

// redb splits its errors per operation; funnel them all through redb::Error.
macro_rules! from_redb {
    ($($ty:ty),*) => {
        $(impl From<$ty> for StoreError {
            fn from(e: $ty) -> Self {
                StoreError::Db(e.into())
            }
        })*
    };
}

from_redb!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);

impl StoreError {
    pub(crate) fn into_storage(self, subject: ErrorSubject<NodeId>, verb: ErrorVerb) -> StorageError<NodeId> {
        StorageIOError::new(subject, verb, AnyError::new(&self)).into()
    }
}

/// Convenience for iterating a log range and decoding entries.
pub(crate) fn read_log_range<T: DeserializeOwned>(db: &Database) -> Result<Vec<(u64, T)>, StoreError> {
    let txn = db.begin_read()?;
    let table = txn.open_table(LOGS)?;
    let mut out = Vec::new();
    for item in table.iter()? {
        let (key, value) = item?;
        out.push((key.value(), serde_json::from_slice(value.value())?));
    }
    Ok(out)
}
