//! Binary entity key encoding.
//!
//! A key is the kind's two-byte code followed by one `/`-prefixed, 8-byte
//! big-endian surrogate id per path segment:
//!
//! ```text
//! ta / id(metalake) / id(catalog) / id(schema) / id(table)
//! ```
//!
//! A wildcard leaf drops the last id but keeps its separator, so the result is
//! a strict prefix of every child key. Segments are resolved top-down through
//! the [`NameMappingService`], each scoped by the ids of its ancestors, which is
//! why renaming a parent never changes the keys of its children.

use crate::mapping::NameMappingService;
use bytes::{BufMut, Bytes, BytesMut};
use lakemeta_common::{EntityKind, Error, NamePath, Result};
use std::fmt::Write as _;
use std::sync::Arc;

/// Separator preceding every id
pub const SEPARATOR: u8 = b'/';
/// Width of one encoded id
pub const ID_WIDTH: usize = 8;
/// Width of the leading kind code
pub const CODE_WIDTH: usize = 2;

const SEGMENT_WIDTH: usize = 1 + ID_WIDTH;

/// Builds binary store keys from name paths
pub struct BinaryEntityKeyEncoder {
    mapping: Arc<NameMappingService>,
}

impl BinaryEntityKeyEncoder {
    pub const fn new(mapping: Arc<NameMappingService>) -> Self {
        Self { mapping }
    }

    pub const fn mapping(&self) -> &Arc<NameMappingService> {
        &self.mapping
    }

    /// Encode `path` as a key of `kind`, allocating ids for unseen segments.
    pub fn encode(&self, path: &NamePath, kind: EntityKind) -> Result<Bytes> {
        let levels = check_path(path, kind)?;
        let mut ids = Vec::with_capacity(levels.len() + 1);
        for (level, segment) in levels.iter().zip(path.namespace()) {
            let id = self.mapping.resolve(&mapping_key_for(&ids, *level, segment))?;
            ids.push(id);
        }
        if !path.is_wildcard() {
            let id = self.mapping.resolve(&mapping_key_for(&ids, kind, path.name()))?;
            ids.push(id);
        }
        Ok(build_key(kind, &ids, path.is_wildcard()))
    }

    /// Like [`encode`](Self::encode) but never allocates. `None` when any
    /// segment is unmapped.
    pub fn encode_existing(&self, path: &NamePath, kind: EntityKind) -> Result<Option<Bytes>> {
        let levels = check_path(path, kind)?;
        let Some(mut ids) = self.namespace_ids(path, levels)? else {
            return Ok(None);
        };
        if !path.is_wildcard() {
            match self.mapping.get_id(&mapping_key_for(&ids, kind, path.name()))? {
                Some(id) => ids.push(id),
                None => return Ok(None),
            }
        }
        Ok(Some(build_key(kind, &ids, path.is_wildcard())))
    }

    /// Mapping key of the leaf of `path`, e.g. `0/2/sc:schema3`.
    ///
    /// The leaf itself need not be mapped; `None` when a namespace segment is.
    pub fn mapping_key(&self, path: &NamePath, kind: EntityKind) -> Result<Option<String>> {
        let levels = check_path(path, kind)?;
        if path.is_wildcard() {
            return Err(Error::invalid_argument(format!(
                "wildcard path {path} has no mapping key"
            )));
        }
        Ok(self
            .namespace_ids(path, levels)?
            .map(|ids| mapping_key_for(&ids, kind, path.name())))
    }

    /// Recover the kind and path of an encoded key or wildcard prefix.
    pub fn decode(&self, key: &[u8]) -> Result<(EntityKind, NamePath)> {
        let (kind, ids, wildcard) = split_key(key)?;
        let levels = kind
            .ancestors()
            .ok_or(Error::UnsupportedEntityKind { kind })?;

        let mut names = Vec::with_capacity(ids.len());
        for (depth, id) in ids.iter().enumerate() {
            let level = levels.get(depth).copied().unwrap_or(kind);
            let mapped = self
                .mapping
                .lookup(*id)?
                .ok_or_else(|| Error::CorruptKey(format!("id {id} has no mapping")))?;
            let scope = mapping_key_for(&ids[..depth], level, "");
            let name = mapped.strip_prefix(&scope).ok_or_else(|| {
                Error::CorruptKey(format!("mapping '{mapped}' of id {id} is not scoped by '{scope}'"))
            })?;
            names.push(name.to_string());
        }

        let name = if wildcard {
            lakemeta_common::WILDCARD.to_string()
        } else {
            // split_key guarantees one id per namespace level plus the leaf
            names.pop().unwrap_or_default()
        };
        Ok((kind, NamePath::new(names, name)))
    }

    fn namespace_ids(&self, path: &NamePath, levels: &[EntityKind]) -> Result<Option<Vec<u64>>> {
        let mut ids = Vec::with_capacity(levels.len() + 1);
        for (level, segment) in levels.iter().zip(path.namespace()) {
            match self.mapping.get_id(&mapping_key_for(&ids, *level, segment))? {
                Some(id) => ids.push(id),
                None => return Ok(None),
            }
        }
        Ok(Some(ids))
    }
}

/// Prefix of every `kind` key stored underneath the entity at `key`
#[must_use]
pub fn descendant_prefix(key: &[u8], kind: EntityKind) -> Bytes {
    let mut prefix = BytesMut::with_capacity(key.len() + 1);
    prefix.put_slice(kind.short_code());
    prefix.put_slice(key.get(CODE_WIDTH..).unwrap_or_default());
    prefix.put_u8(SEPARATOR);
    prefix.freeze()
}

/// Validate `path` against the level rules of `kind`, returning the kinds of
/// its namespace levels.
fn check_path(path: &NamePath, kind: EntityKind) -> Result<&'static [EntityKind]> {
    let levels = kind
        .ancestors()
        .ok_or(Error::UnsupportedEntityKind { kind })?;
    if path.namespace().len() != levels.len() {
        return Err(Error::InvalidNamespace {
            kind,
            expected: levels.len(),
            actual: path.namespace().len(),
        });
    }
    if path
        .namespace()
        .iter()
        .any(|s| s.is_empty() || s == lakemeta_common::WILDCARD)
    {
        return Err(Error::invalid_argument(format!(
            "namespace of {path} must consist of concrete names"
        )));
    }
    if path.name().is_empty() {
        return Err(Error::invalid_argument("entity name must not be empty"));
    }
    Ok(levels)
}

/// `<id>/<id>/.../<code>:<name>`
fn mapping_key_for(ancestor_ids: &[u64], kind: EntityKind, name: &str) -> String {
    let mut key = String::with_capacity(ancestor_ids.len() * 20 + name.len() + 3);
    for id in ancestor_ids {
        // Writing to a String cannot fail
        let _ = write!(key, "{id}/");
    }
    key.push_str(kind.short_name());
    key.push(':');
    key.push_str(name);
    key
}

fn build_key(kind: EntityKind, ids: &[u64], wildcard: bool) -> Bytes {
    let mut key = BytesMut::with_capacity(CODE_WIDTH + SEGMENT_WIDTH * ids.len() + 1);
    key.put_slice(kind.short_code());
    for id in ids {
        key.put_u8(SEPARATOR);
        key.put_u64(*id);
    }
    if wildcard {
        key.put_u8(SEPARATOR);
    }
    key.freeze()
}

/// Split a key into kind, ids and wildcard flag, checking every separator
/// position and the id count against the kind's depth.
fn split_key(key: &[u8]) -> Result<(EntityKind, Vec<u64>, bool)> {
    let code = key
        .get(..CODE_WIDTH)
        .ok_or_else(|| Error::CorruptKey(format!("key of {} bytes is too short", key.len())))?;
    let kind = EntityKind::from_short_code(code)
        .ok_or_else(|| Error::CorruptKey(format!("unknown kind code {code:?}")))?;
    let depth = kind
        .namespace_depth()
        .ok_or(Error::UnsupportedEntityKind { kind })?;

    let body = &key[CODE_WIDTH..];
    let (segments, wildcard) = match body.len() % SEGMENT_WIDTH {
        0 => (body, false),
        1 if body.last() == Some(&SEPARATOR) => (&body[..body.len() - 1], true),
        _ => {
            return Err(Error::CorruptKey(format!(
                "key body of {} bytes is not a sequence of ids",
                body.len()
            )));
        }
    };

    let expected = if wildcard { depth } else { depth + 1 };
    let count = segments.len() / SEGMENT_WIDTH;
    if count != expected {
        return Err(Error::CorruptKey(format!(
            "{kind} key holds {count} id(s), expected {expected}"
        )));
    }

    let mut ids = Vec::with_capacity(count);
    for chunk in segments.chunks_exact(SEGMENT_WIDTH) {
        if chunk[0] != SEPARATOR {
            return Err(Error::CorruptKey(format!(
                "expected separator, found byte {:#04x}",
                chunk[0]
            )));
        }
        let mut raw = [0u8; ID_WIDTH];
        raw.copy_from_slice(&chunk[1..]);
        ids.push(u64::from_be_bytes(raw));
    }
    Ok((kind, ids, wildcard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SequentialIdGenerator;
    use crate::options::{Durability, StoreOptions};
    use crate::store::OrderedByteStore;
    use lakemeta_common::MappingConfig;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        store: Arc<OrderedByteStore>,
        encoder: BinaryEntityKeyEncoder,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let options = StoreOptions {
            durability: Durability::None,
            ..Default::default()
        };
        let store = Arc::new(OrderedByteStore::open(dir.path(), &options).unwrap());
        let mapping = NameMappingService::new(
            Arc::clone(&store),
            Arc::new(SequentialIdGenerator::new(0)),
            &MappingConfig::default(),
        );
        Fixture {
            _dir: dir,
            store,
            encoder: BinaryEntityKeyEncoder::new(Arc::new(mapping)),
        }
    }

    fn key(code: &[u8], ids: &[u64], wildcard: bool) -> Vec<u8> {
        let mut key = code.to_vec();
        for id in ids {
            key.push(b'/');
            key.extend_from_slice(&id.to_be_bytes());
        }
        if wildcard {
            key.push(b'/');
        }
        key
    }

    fn path(s: &str) -> NamePath {
        s.parse().unwrap()
    }

    #[test]
    fn test_encode_literal_bytes() {
        let f = fixture();
        let e = &f.encoder;

        // metalake1=0, catalog1=1, catalog2=2, schema3=3, table4=4, fileset5=5
        assert_eq!(
            e.encode(&path("metalake1"), EntityKind::Metalake).unwrap().as_ref(),
            b"ml/\x00\x00\x00\x00\x00\x00\x00\x00"
        );
        e.encode(&path("metalake1.catalog1"), EntityKind::Catalog).unwrap();
        assert_eq!(
            e.encode(&path("metalake1.catalog2"), EntityKind::Catalog).unwrap().as_ref(),
            b"ca/\x00\x00\x00\x00\x00\x00\x00\x00/\x00\x00\x00\x00\x00\x00\x00\x02"
        );
        assert_eq!(
            e.encode(&path("metalake1.catalog2.schema3"), EntityKind::Schema)
                .unwrap()
                .as_ref(),
            key(b"sc", &[0, 2, 3], false).as_slice()
        );
        assert_eq!(
            e.encode(&path("metalake1.catalog2.schema3.table4"), EntityKind::Table)
                .unwrap()
                .as_ref(),
            key(b"ta", &[0, 2, 3, 4], false).as_slice()
        );
        assert_eq!(
            e.encode(&path("metalake1.catalog2.schema3.fileset5"), EntityKind::Fileset)
                .unwrap()
                .as_ref(),
            key(b"fi", &[0, 2, 3, 5], false).as_slice()
        );

        // Same name, different kind: separate id
        assert_eq!(
            e.encode(&path("metalake1.catalog2.schema3.table4"), EntityKind::Topic)
                .unwrap()
                .as_ref(),
            key(b"to", &[0, 2, 3, 6], false).as_slice()
        );
        assert_eq!(
            e.encode(&path("metalake1.user7"), EntityKind::User).unwrap().as_ref(),
            key(b"us", &[0, 7], false).as_slice()
        );

        // Repeated encodes are byte-identical and allocate nothing new
        for _ in 0..3 {
            assert_eq!(
                e.encode(&path("metalake1.catalog2.schema3.table4"), EntityKind::Table)
                    .unwrap()
                    .as_ref(),
                key(b"ta", &[0, 2, 3, 4], false).as_slice()
            );
        }
        assert_eq!(e.mapping().highest_allocated_id().unwrap(), Some(7));
    }

    #[test]
    fn test_encode_wildcard() {
        let f = fixture();
        let e = &f.encoder;

        assert_eq!(
            e.encode(&NamePath::wildcard(Vec::<String>::new()), EntityKind::Metalake)
                .unwrap()
                .as_ref(),
            b"ml/"
        );
        assert_eq!(
            e.encode(&path("metalake1.*"), EntityKind::Catalog).unwrap().as_ref(),
            b"ca/\x00\x00\x00\x00\x00\x00\x00\x00/"
        );
        // The wildcard leaf allocates nothing
        assert_eq!(e.mapping().entries().unwrap().len(), 1);
    }

    #[test]
    fn test_prefix_scan_returns_exactly_children() {
        let f = fixture();
        let e = &f.encoder;

        let schema = path("lake.cat.sales");
        let other_schema = path("lake.cat.hr");
        let mut expected = Vec::new();
        for table in ["orders", "items", "refunds"] {
            let key = e.encode(&schema.child(table), EntityKind::Table).unwrap();
            f.store.put(&key, table.as_bytes()).unwrap();
            expected.push(key.to_vec());
        }
        for table in ["people", "orders"] {
            let key = e.encode(&other_schema.child(table), EntityKind::Table).unwrap();
            f.store.put(&key, b"other").unwrap();
        }
        let fileset = e.encode(&schema.child("orders"), EntityKind::Fileset).unwrap();
        f.store.put(&fileset, b"fileset").unwrap();
        let schema_key = e.encode(&schema, EntityKind::Schema).unwrap();
        f.store.put(&schema_key, b"schema").unwrap();

        let prefix = e
            .encode(&NamePath::wildcard(schema.segments()), EntityKind::Table)
            .unwrap();
        for key in &expected {
            assert!(key.starts_with(&prefix));
            assert!(key.len() > prefix.len());
        }

        let mut found: Vec<Vec<u8>> = f.store.scan(&prefix).unwrap().into_iter().map(|(k, _)| k).collect();
        found.sort();
        expected.sort();
        assert_eq!(found, expected);

        // Every table below the catalog, at any schema
        let catalog_key = e.encode(&path("lake.cat"), EntityKind::Catalog).unwrap();
        let all_tables = descendant_prefix(&catalog_key, EntityKind::Table);
        assert_eq!(f.store.scan(&all_tables).unwrap().len(), 5);
    }

    #[test]
    fn test_rename_keeps_descendant_keys() {
        let f = fixture();
        let e = &f.encoder;

        let table = path("lake.cat.db.events");
        let before = e.encode(&table, EntityKind::Table).unwrap();
        let catalog_id = e
            .mapping()
            .get_id(&e.mapping_key(&path("lake.cat"), EntityKind::Catalog).unwrap().unwrap())
            .unwrap()
            .unwrap();

        let old = e.mapping_key(&path("lake.cat"), EntityKind::Catalog).unwrap().unwrap();
        let new = e.mapping_key(&path("lake.warehouse"), EntityKind::Catalog).unwrap().unwrap();
        assert!(e.mapping().rename(&old, &new).unwrap());

        let after = e.encode(&path("lake.warehouse.db.events"), EntityKind::Table).unwrap();
        assert_eq!(before, after);
        assert_eq!(
            e.encode(&path("lake.warehouse"), EntityKind::Catalog).unwrap().as_ref(),
            key(b"ca", &[0, catalog_id], false).as_slice()
        );
        assert_eq!(
            e.encode_existing(&table, EntityKind::Table).unwrap(),
            None,
            "the old name no longer resolves"
        );
    }

    #[test]
    fn test_unsupported_kinds_and_bad_namespaces() {
        let f = fixture();
        let e = &f.encoder;

        for kind in [EntityKind::Column, EntityKind::Audit] {
            let err = e.encode(&path("lake.cat.db.events.col"), kind).unwrap_err();
            assert!(matches!(err, Error::UnsupportedEntityKind { kind: k } if k == kind));
        }
        let err = e.encode(&path("lake.events"), EntityKind::Table).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidNamespace {
                expected: 3,
                actual: 1,
                ..
            }
        ));
        let err = e.encode(&path("lake.*.db"), EntityKind::Schema).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // Nothing was allocated by the failed calls
        assert!(e.mapping().entries().unwrap().is_empty());
    }

    #[test]
    fn test_encode_existing_never_allocates() {
        let f = fixture();
        let e = &f.encoder;

        assert_eq!(e.encode_existing(&path("lake.cat"), EntityKind::Catalog).unwrap(), None);
        assert!(e.mapping().entries().unwrap().is_empty());

        let key = e.encode(&path("lake.cat"), EntityKind::Catalog).unwrap();
        assert_eq!(
            e.encode_existing(&path("lake.cat"), EntityKind::Catalog).unwrap(),
            Some(key)
        );
        assert_eq!(
            e.mapping_key(&path("lake.cat.db"), EntityKind::Schema).unwrap().as_deref(),
            Some("0/1/sc:db")
        );
        assert_eq!(
            e.mapping_key(&path("lake.other.db"), EntityKind::Schema).unwrap(),
            None
        );
    }

    #[test]
    fn test_decode() {
        let f = fixture();
        let e = &f.encoder;

        let table = path("lake.cat.db.we/ird:name");
        let key = e.encode(&table, EntityKind::Table).unwrap();
        assert_eq!(e.decode(&key).unwrap(), (EntityKind::Table, table.clone()));

        let prefix = e.encode(&path("lake.cat.db.*"), EntityKind::Table).unwrap();
        let (kind, decoded) = e.decode(&prefix).unwrap();
        assert_eq!(kind, EntityKind::Table);
        assert!(decoded.is_wildcard());
        assert_eq!(decoded.namespace(), ["lake", "cat", "db"]);

        let (_, all) = e.decode(b"ml/").unwrap();
        assert!(all.is_wildcard() && all.namespace().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed_keys() {
        let f = fixture();
        let e = &f.encoder;
        e.encode(&path("lake"), EntityKind::Metalake).unwrap();

        for bad in [
            &b"m"[..],
            b"zz/\x00\x00\x00\x00\x00\x00\x00\x00",
            b"ml|\x00\x00\x00\x00\x00\x00\x00\x00",
            b"ml/\x00\x00\x00",
            b"ca/\x00\x00\x00\x00\x00\x00\x00\x00",
        ] {
            assert!(matches!(e.decode(bad).unwrap_err(), Error::CorruptKey(_)), "{bad:?}");
        }
        assert!(matches!(
            e.decode(b"co/").unwrap_err(),
            Error::UnsupportedEntityKind { .. }
        ));
        // Well formed, but the id was never allocated
        assert!(matches!(
            e.decode(&key(b"ml", &[42], false)).unwrap_err(),
            Error::CorruptKey(_)
        ));
    }
}
