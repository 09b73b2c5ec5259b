//! Entity store on top of the key encoder, mapping service and transaction
//! id generator.
//!
//! Payloads are opaque bytes. Each stored value is wrapped in a
//! [`VersionedValue`] stamped with the transaction id of the write.

use crate::encoder::{BinaryEntityKeyEncoder, descendant_prefix};
use crate::id::RandomIdGenerator;
use crate::mapping::NameMappingService;
use crate::options::StoreOptions;
use crate::store::{BatchOp, OrderedByteStore};
use crate::txn::TransactionIdGenerator;
use lakemeta_common::{EntityKind, Error, KvConfig, NamePath, Result, WILDCARD};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Stored form of an entity
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Transaction id of the write that produced this value
    pub version: u64,
    pub payload: Vec<u8>,
}

impl VersionedValue {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::internal(format!("encode value: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::CorruptValue(e.to_string()))
    }
}

/// Result of an update callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    /// New leaf name, if the entity is renamed
    pub rename_to: Option<String>,
    pub payload: Vec<u8>,
}

impl Update {
    /// Replace the payload, keep the name
    pub fn payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            rename_to: None,
            payload: payload.into(),
        }
    }

    /// Replace the payload and rename the entity
    pub fn rename(name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            rename_to: Some(name.into()),
            payload: payload.into(),
        }
    }
}

/// Key-value entity store
pub struct KvEntityStore {
    store: Arc<OrderedByteStore>,
    encoder: BinaryEntityKeyEncoder,
    txn_ids: TransactionIdGenerator,
    /// Serialises read-modify-write sequences
    write_lock: Mutex<()>,
}

impl KvEntityStore {
    /// Open the store described by `config` and start its transaction ids
    pub fn open(config: &KvConfig) -> Result<Self> {
        config.validate()?;
        let options = StoreOptions::from_map(&config.store.options)?;
        let store = Arc::new(OrderedByteStore::open(&config.store.path, &options)?);

        let mapping = NameMappingService::new(
            Arc::clone(&store),
            Arc::new(RandomIdGenerator),
            &config.mapping,
        );
        let encoder = BinaryEntityKeyEncoder::new(Arc::new(mapping));
        let txn_ids = TransactionIdGenerator::new(store.clone(), config.transaction.clone());
        Self::from_parts(store, encoder, txn_ids)
    }

    /// Assemble a store from pre-built components. Starts `txn_ids` if needed.
    pub fn from_parts(
        store: Arc<OrderedByteStore>,
        encoder: BinaryEntityKeyEncoder,
        txn_ids: TransactionIdGenerator,
    ) -> Result<Self> {
        txn_ids.start()?;
        info!("Entity store ready at {:?}", store.path());
        Ok(Self {
            store,
            encoder,
            txn_ids,
            write_lock: Mutex::new(()),
        })
    }

    /// Write `payload` at `path`. Returns the version stamped on the value.
    ///
    /// Without `overwrite` an existing entity is an
    /// [`Error::EntityAlreadyExists`].
    pub fn put(
        &self,
        path: &NamePath,
        kind: EntityKind,
        payload: impl Into<Vec<u8>>,
        overwrite: bool,
    ) -> Result<u64> {
        reject_wildcard(path)?;
        let _guard = self.write_lock.lock();
        let key = self.encoder.encode(path, kind)?;

        let value = VersionedValue {
            version: self.txn_ids.next_id()?,
            payload: payload.into(),
        };
        let bytes = value.to_bytes()?;
        if overwrite {
            self.store.put(&key, &bytes)?;
        } else if !self.store.put_if_absent(&key, &bytes)? {
            return Err(Error::EntityAlreadyExists(path.to_string()));
        }
        debug!("put {} {} at version {}", kind, path, value.version);
        Ok(value.version)
    }

    pub fn get(&self, path: &NamePath, kind: EntityKind) -> Result<VersionedValue> {
        reject_wildcard(path)?;
        self.load(path, kind)?
            .map(|(_, value)| value)
            .ok_or_else(|| Error::NoSuchEntity(path.to_string()))
    }

    /// Whether an entity exists at `path`. Never allocates ids.
    pub fn exists(&self, path: &NamePath, kind: EntityKind) -> Result<bool> {
        reject_wildcard(path)?;
        Ok(self.load(path, kind)?.is_some())
    }

    /// Up to `limit` entities of `kind` directly under `namespace`, in key
    /// order
    pub fn list(
        &self,
        namespace: &[String],
        kind: EntityKind,
        limit: usize,
    ) -> Result<Vec<(NamePath, VersionedValue)>> {
        let pattern = NamePath::new(namespace.iter().cloned(), WILDCARD);
        let Some(prefix) = self.encoder.encode_existing(&pattern, kind)? else {
            return Ok(Vec::new());
        };

        self.store
            .scan_limit(&prefix, limit)?
            .into_iter()
            .map(|(key, bytes)| {
                let (_, path) = self.encoder.decode(&key)?;
                Ok((path, VersionedValue::from_bytes(&bytes)?))
            })
            .collect()
    }

    /// Rewrite the entity at `path` through `f`.
    ///
    /// The new value gets a fresh version. A rename keeps the binary key (and
    /// with it every descendant key) and only moves the name mapping, in the
    /// same batch as the value.
    pub fn update<F>(&self, path: &NamePath, kind: EntityKind, f: F) -> Result<VersionedValue>
    where
        F: FnOnce(&VersionedValue) -> Result<Update>,
    {
        reject_wildcard(path)?;
        let _guard = self.write_lock.lock();

        let (key, current) = self
            .load(path, kind)?
            .ok_or_else(|| Error::NoSuchEntity(path.to_string()))?;
        let update = f(&current)?;

        let rename = match update.rename_to {
            Some(name) if name != path.name() => Some(self.prepare_rename(path, kind, &name)?),
            _ => None,
        };

        let value = VersionedValue {
            version: self.txn_ids.next_id()?,
            payload: update.payload,
        };
        let write = BatchOp::put(key.to_vec(), value.to_bytes()?);

        match rename {
            Some(Rename { old, new, stale }) => {
                if !self.encoder.mapping().rename_with(&old, &new, stale, vec![write])? {
                    return Err(Error::NoSuchEntity(path.to_string()));
                }
                info!("Renamed {} '{}' via mapping '{}' -> '{}'", kind, path, old, new);
            }
            None => {
                self.store.batch(vec![write])?;
            }
        }
        Ok(value)
    }

    /// Delete the entity at `path`. Returns `false` if it did not exist.
    ///
    /// Entities with sub-entities are only removed with `cascade`, in which
    /// case everything below them goes in the same batch.
    pub fn delete(&self, path: &NamePath, kind: EntityKind, cascade: bool) -> Result<bool> {
        reject_wildcard(path)?;
        let _guard = self.write_lock.lock();

        let Some((key, _)) = self.load(path, kind)? else {
            return Ok(false);
        };

        if !cascade && self.has_descendants(&key, kind)? {
            return Err(Error::NonEmptyEntity(path.to_string()));
        }

        let mut ops: Vec<BatchOp> = kind
            .descendant_kinds()
            .into_iter()
            .map(|child| BatchOp::delete_prefix(descendant_prefix(&key, child).to_vec()))
            .collect();
        ops.push(BatchOp::delete(key.to_vec()));
        self.store.batch(ops)?;

        debug!("deleted {} {} (cascade={})", kind, path, cascade);
        Ok(true)
    }

    /// Stop the transaction id generator, flushing its mark
    pub fn close(&self) -> Result<()> {
        self.txn_ids.stop()
    }

    pub const fn encoder(&self) -> &BinaryEntityKeyEncoder {
        &self.encoder
    }

    pub fn store(&self) -> &OrderedByteStore {
        &self.store
    }

    fn load(&self, path: &NamePath, kind: EntityKind) -> Result<Option<(bytes::Bytes, VersionedValue)>> {
        let Some(key) = self.encoder.encode_existing(path, kind)? else {
            return Ok(None);
        };
        match self.store.get(&key)? {
            Some(bytes) => Ok(Some((key, VersionedValue::from_bytes(&bytes)?))),
            None => Ok(None),
        }
    }

    /// Whether anything is stored underneath the entity at `key`
    fn has_descendants(&self, key: &[u8], kind: EntityKind) -> Result<bool> {
        for child in kind.descendant_kinds() {
            if self.store.scan_with(&descendant_prefix(key, child), |_, _| false)? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Check that `path` can be renamed to `name`.
    ///
    /// The target name may still be bound to a deleted entity. That binding
    /// is only given up when nothing is stored underneath it.
    fn prepare_rename(&self, path: &NamePath, kind: EntityKind, name: &str) -> Result<Rename> {
        if name.is_empty() || name == WILDCARD {
            return Err(Error::invalid_argument(format!("invalid new name '{name}'")));
        }
        let target = path.with_name(name);
        if self.exists(&target, kind)? {
            return Err(Error::EntityAlreadyExists(target.to_string()));
        }

        let old = self.encoder.mapping_key(path, kind)?;
        let new = self.encoder.mapping_key(&target, kind)?;
        let (Some(old), Some(new)) = (old, new) else {
            return Err(Error::NoSuchEntity(path.to_string()));
        };

        let stale = match self.encoder.encode_existing(&target, kind)? {
            Some(target_key) => {
                if self.has_descendants(&target_key, kind)? {
                    return Err(Error::NameAlreadyMapped(target.to_string()));
                }
                self.encoder.mapping().get_id(&new)?
            }
            None => None,
        };
        Ok(Rename { old, new, stale })
    }
}

/// Mapping move planned by an update
struct Rename {
    old: String,
    new: String,
    /// Leftover id still bound to the new name
    stale: Option<u64>,
}

fn reject_wildcard(path: &NamePath) -> Result<()> {
    if path.is_wildcard() {
        return Err(Error::invalid_argument(format!(
            "{path} addresses many entities"
        )));
    }
    Ok(())
}
