//! Name to surrogate id mapping.
//!
//! Every mapped name owns two rows in the byte store, written in one batch:
//!
//! - `name_<name>` -> id (8 bytes BE)
//! - `id_<id 8 bytes BE>` -> name
//!
//! Ids are never handed out twice. A rename moves the forward row and rewrites
//! the reverse row, keeping the id. An unbind drops only the forward row so the
//! reverse row keeps the id reserved.

use crate::cache::{CacheStats, IdleCache};
use crate::id::IdGenerator;
use crate::store::{BatchOp, OrderedByteStore};
use crate::tables::{ID_PREFIX, NAME_PREFIX};
use lakemeta_common::{Error, MappingConfig, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Number of lock stripes guarding allocation
const LOCK_STRIPES: usize = 64;

/// Fresh ids tried before giving up on an allocation
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Persisted, cached mapping from names to surrogate ids
pub struct NameMappingService {
    store: Arc<OrderedByteStore>,
    id_generator: Arc<dyn IdGenerator>,
    cache: IdleCache<String, u64>,
    locks: Vec<Mutex<()>>,
}

impl NameMappingService {
    pub fn new(
        store: Arc<OrderedByteStore>,
        id_generator: Arc<dyn IdGenerator>,
        config: &MappingConfig,
    ) -> Self {
        Self {
            store,
            id_generator,
            cache: IdleCache::new(config.cache_capacity, config.cache_idle()),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Id bound to `name`, allocating and persisting a new one on first use.
    ///
    /// Concurrent first resolutions of one name all observe the same id.
    pub fn resolve(&self, name: &str) -> Result<u64> {
        if let Some(id) = self.cache.get(name) {
            return Ok(id);
        }

        let _guard = self.lock(name);
        if let Some(id) = self.load_id(name)? {
            self.cache.insert(name.to_string(), id);
            return Ok(id);
        }

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let id = self.id_generator.next_id();
            let ops = vec![
                BatchOp::insert(name_key(name), id.to_be_bytes()),
                BatchOp::insert(id_key(id), name.as_bytes()),
            ];
            if self.store.batch(ops)? {
                debug!("Allocated id {} for '{}'", id, name);
                self.cache.insert(name.to_string(), id);
                return Ok(id);
            }

            // Either the name got bound through another handle or the id is
            // already taken
            if let Some(existing) = self.load_id(name)? {
                self.cache.insert(name.to_string(), existing);
                return Ok(existing);
            }
            warn!("Surrogate id {} is already taken, retrying '{}'", id, name);
        }

        Err(Error::internal(format!(
            "could not allocate an id for '{name}' after {MAX_ALLOCATION_ATTEMPTS} attempts"
        )))
    }

    /// Id bound to `name`, never allocating
    pub fn get_id(&self, name: &str) -> Result<Option<u64>> {
        if let Some(id) = self.cache.get(name) {
            return Ok(Some(id));
        }

        let _guard = self.lock(name);
        let id = self.load_id(name)?;
        if let Some(id) = id {
            self.cache.insert(name.to_string(), id);
        }
        Ok(id)
    }

    /// Move the id bound to `old` over to `new`.
    ///
    /// Returns `false` when `old` is not mapped. Fails with
    /// [`Error::NameAlreadyMapped`] when `new` is already bound.
    pub fn rename(&self, old: &str, new: &str) -> Result<bool> {
        self.rename_with(old, new, None, Vec::new())
    }

    /// Like [`rename`](Self::rename), committing `ops` in the same batch.
    ///
    /// `new` may still be bound to `replace`; that binding is dropped and its
    /// id stays reserved. Nothing is written when `old` is unmapped or the
    /// rename fails.
    pub fn rename_with(
        &self,
        old: &str,
        new: &str,
        replace: Option<u64>,
        mut ops: Vec<BatchOp>,
    ) -> Result<bool> {
        let _guards = self.lock_pair(old, new);

        let Some(id) = self.load_id(old)? else {
            return Ok(false);
        };
        if old != new {
            match self.load_id(new)? {
                None => {}
                Some(bound) if Some(bound) == replace => {
                    debug!("Dropping stale mapping '{}' (id {})", new, bound);
                    ops.push(BatchOp::delete(name_key(new)));
                }
                Some(_) => return Err(Error::NameAlreadyMapped(new.to_string())),
            }
            ops.push(BatchOp::delete(name_key(old)));
            ops.push(BatchOp::insert(name_key(new), id.to_be_bytes()));
            ops.push(BatchOp::put(id_key(id), new.as_bytes()));
        }

        // Evict before committing: a cache miss waits on the locks held here
        self.cache.remove(old);
        self.cache.remove(new);
        if !self.store.batch(ops)? {
            return Err(Error::NameAlreadyMapped(new.to_string()));
        }

        if old != new {
            info!("Renamed mapping '{}' -> '{}' (id {})", old, new, id);
        }
        Ok(true)
    }

    /// Name currently recorded for `id`
    pub fn lookup(&self, id: u64) -> Result<Option<String>> {
        self.store
            .get(&id_key(id))?
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| Error::CorruptValue(format!("mapping of id {id} is not UTF-8")))
            })
            .transpose()
    }

    /// Drop the binding of `name`. The id stays reserved.
    pub fn unbind(&self, name: &str) -> Result<bool> {
        let _guard = self.lock(name);
        self.cache.remove(name);
        let removed = self.store.delete(&name_key(name))?;
        if removed {
            debug!("Unbound '{}'", name);
        }
        Ok(removed)
    }

    /// Highest id ever allocated, for seeding a sequential generator
    pub fn highest_allocated_id(&self) -> Result<Option<u64>> {
        self.store
            .last_with_prefix(ID_PREFIX)?
            .map(|(key, _)| decode_id(&key[ID_PREFIX.len()..]))
            .transpose()
    }

    /// Every bound name with its id, in name order
    pub fn entries(&self) -> Result<Vec<(String, u64)>> {
        self.store
            .scan(NAME_PREFIX)?
            .into_iter()
            .map(|(key, value)| {
                let name = String::from_utf8(key[NAME_PREFIX.len()..].to_vec())
                    .map_err(|_| Error::CorruptKey("mapping name is not UTF-8".to_string()))?;
                Ok((name, decode_id(&value)?))
            })
            .collect()
    }

    pub const fn cache_stats(&self) -> &CacheStats {
        self.cache.stats()
    }

    fn load_id(&self, name: &str) -> Result<Option<u64>> {
        self.store
            .get(&name_key(name))?
            .map(|bytes| decode_id(&bytes))
            .transpose()
    }

    fn stripe(&self, name: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        // Modulo keeps the value below LOCK_STRIPES
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % LOCK_STRIPES as u64) as usize;
        index
    }

    fn lock(&self, name: &str) -> MutexGuard<'_, ()> {
        self.locks[self.stripe(name)].lock()
    }

    /// Lock the stripes of two names in index order
    fn lock_pair(&self, a: &str, b: &str) -> (MutexGuard<'_, ()>, Option<MutexGuard<'_, ()>>) {
        let (first, second) = {
            let (x, y) = (self.stripe(a), self.stripe(b));
            (x.min(y), x.max(y))
        };
        let first_guard = self.locks[first].lock();
        let second_guard = (second != first).then(|| self.locks[second].lock());
        (first_guard, second_guard)
    }
}

fn name_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(NAME_PREFIX.len() + name.len());
    key.extend_from_slice(NAME_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

fn id_key(id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_PREFIX.len() + 8);
    key.extend_from_slice(ID_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::CorruptValue(format!("expected an 8-byte id, got {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}
