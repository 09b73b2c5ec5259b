//! Ordered byte store backed by redb.
//!
//! A thin layer over a single redb table of raw byte keys. Keys iterate in
//! byte-lexicographic order, which is what makes prefix scans over encoded
//! entity keys return exactly the descendants of a namespace. Every write is
//! its own redb write transaction; [`OrderedByteStore::batch`] groups several
//! mutations into one.

use crate::options::{Durability, StoreOptions};
use crate::tables;
use lakemeta_common::{Error, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the database inside the store directory
pub const DB_FILE_NAME: &str = "entities.redb";

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("redb compaction error: {0}")]
    Compaction(#[from] redb::CompactionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<KvError> for Error {
    fn from(e: KvError) -> Self {
        Self::StorageIo(e.to_string())
    }
}

pub type KvResult<T> = std::result::Result<T, KvError>;

type EntryTable<'txn> = redb::Table<'txn, &'static [u8], &'static [u8]>;

/// One mutation of an atomic batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Write `value` under `key`, replacing any previous value
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Write `value` under `key`; the whole batch is abandoned if `key` exists
    Insert { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key` if present
    Delete { key: Vec<u8> },
    /// Remove every key starting with `prefix`
    DeletePrefix { prefix: Vec<u8> },
}

impl BatchOp {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn insert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::Insert {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn delete_prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self::DeletePrefix {
            prefix: prefix.into(),
        }
    }
}

/// Persistent ordered key-value store over raw bytes.
pub struct OrderedByteStore {
    db: Database,
    path: PathBuf,
    durability: Durability,
}

impl OrderedByteStore {
    /// Open (or create) the store inside directory `dir`.
    ///
    /// Only one handle may own a directory at a time: opening a directory that
    /// is already open, in this process or another, fails with
    /// [`Error::StoreAlreadyOpen`].
    pub fn open(dir: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE_NAME);

        let mut builder = redb::Builder::new();
        if let Some(bytes) = options.cache_size_bytes {
            builder.set_cache_size(bytes);
        }
        if options.repair_on_open_log {
            builder.set_repair_callback(|session: &mut redb::RepairSession| {
                info!("Repairing store: {:.0}%", session.progress() * 100.0);
            });
        }

        let mut db = match builder.create(&path) {
            Ok(db) => db,
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                return Err(Error::StoreAlreadyOpen(path.display().to_string()));
            }
            Err(e) => return Err(KvError::from(e).into()),
        };

        if options.compact_on_open {
            let compacted = db.compact().map_err(KvError::from)?;
            debug!("Compaction on open of {:?}: compacted={}", path, compacted);
        }

        let store = Self {
            db,
            path,
            durability: options.durability,
        };
        // Create the table eagerly so later read txns don't fail
        store.create_tables()?;

        info!("Opened ordered byte store at {:?}", store.path);
        Ok(store)
    }

    /// Path of the database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.try_get(key)?)
    }

    /// Store `value` under `key`, replacing any previous value
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(|table| {
            table.insert(key, value)?;
            Ok(true)
        })?;
        Ok(())
    }

    /// Store `value` under `key` unless the key exists. Returns whether the
    /// value was written.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.batch(vec![BatchOp::insert(key, value)])
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut existed = false;
        self.write(|table| {
            existed = table.remove(key)?.is_some();
            Ok(true)
        })?;
        Ok(existed)
    }

    /// All entries whose key starts with `prefix`, in key order
    pub fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_limit(prefix, usize::MAX)
    }

    /// At most `limit` entries whose key starts with `prefix`, in key order
    pub fn scan_limit(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut result = Vec::new();
        if limit == 0 {
            return Ok(result);
        }
        self.scan_with(prefix, |key, value| {
            result.push((key.to_vec(), value.to_vec()));
            result.len() < limit
        })?;
        Ok(result)
    }

    /// Stream the entries whose key starts with `prefix` through `visit`, in
    /// key order, without buffering them. Stops early once `visit` returns
    /// `false`. Returns the number of entries visited.
    pub fn scan_with<F>(&self, prefix: &[u8], visit: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        Ok(self.try_scan_with(prefix, visit)?)
    }

    /// Entry with the greatest key starting with `prefix`
    pub fn last_with_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.try_last(prefix)?)
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    pub fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut removed = 0;
        self.write(|table| {
            removed = remove_prefix(table, prefix)?;
            Ok(true)
        })?;
        Ok(removed)
    }

    /// Apply `ops` atomically, in order.
    ///
    /// Returns `false` without writing anything when an [`BatchOp::Insert`]
    /// finds its key already present.
    pub fn batch(&self, ops: Vec<BatchOp>) -> Result<bool> {
        if ops.is_empty() {
            return Ok(true);
        }
        let count = ops.len();
        let applied = self.write(|table| {
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Insert { key, value } => {
                        let exists = table.get(key.as_slice())?.is_some();
                        if exists {
                            return Ok(false);
                        }
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_slice())?;
                    }
                    BatchOp::DeletePrefix { prefix } => {
                        remove_prefix(table, prefix)?;
                    }
                }
            }
            Ok(true)
        })?;
        debug!("batch: {} ops, applied={}", count, applied);
        Ok(applied)
    }

    /// Number of stored keys
    pub fn len(&self) -> Result<u64> {
        Ok(self.try_len()?)
    }

    /// Check if the store holds no keys
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // ---- Engine helpers ----

    fn create_tables(&self) -> KvResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::ENTRIES)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn try_get(&self, key: &[u8]) -> KvResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn try_scan_with<F>(&self, prefix: &[u8], mut visit: F) -> KvResult<usize>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        let mut visited = 0;
        for entry in table.range(prefix..)? {
            let (k, v) = entry?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            visited += 1;
            if !visit(key, v.value()) {
                break;
            }
        }
        Ok(visited)
    }

    fn try_last(&self, prefix: &[u8]) -> KvResult<Option<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        let mut range = match prefix_successor(prefix) {
            Some(end) => table.range(prefix..end.as_slice())?,
            None => table.range(prefix..)?,
        };
        match range.next_back() {
            Some(entry) => {
                let (k, v) = entry?;
                Ok(Some((k.value().to_vec(), v.value().to_vec())))
            }
            None => Ok(None),
        }
    }

    fn try_len(&self) -> KvResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        Ok(table.len()?)
    }

    /// Run `f` inside one write transaction. The transaction commits when `f`
    /// returns `Ok(true)` and is abandoned on `Ok(false)` or an error.
    fn write<F>(&self, f: F) -> KvResult<bool>
    where
        F: FnOnce(&mut EntryTable<'_>) -> KvResult<bool>,
    {
        let mut write_txn = self.db.begin_write()?;
        write_txn.set_durability(self.durability.to_redb());
        let commit = {
            let mut table = write_txn.open_table(tables::ENTRIES)?;
            f(&mut table)?
        };
        if commit {
            write_txn.commit()?;
        } else if let Err(e) = write_txn.abort() {
            warn!("Failed to abort write transaction on {:?}: {}", self.path, e);
        }
        Ok(commit)
    }
}

/// Smallest key greater than every key starting with `prefix`, `None` when
/// no such key exists (empty or all-0xff prefix)
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn remove_prefix(table: &mut EntryTable<'_>, prefix: &[u8]) -> KvResult<usize> {
    let mut removed = 0;
    let mut drop_entry = |_: &[u8], _: &[u8]| {
        removed += 1;
        false
    };
    match prefix_successor(prefix) {
        Some(end) => table.retain_in(prefix..end.as_slice(), &mut drop_entry)?,
        None => table.retain_in(prefix.., &mut drop_entry)?,
    }
    Ok(removed)
}
