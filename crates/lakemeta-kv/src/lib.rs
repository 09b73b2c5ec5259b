//! LakeMeta KV - Embedded key-value entity store
//!
//! This crate maps hierarchical entity names onto compact binary keys in an
//! embedded redb database and stamps every write with a transaction id.
//!
//! - [`store`]: ordered byte store over redb
//! - [`id`]: surrogate id generators
//! - [`mapping`]: persisted, cached name to id mapping
//! - [`encoder`]: name path to binary key encoding
//! - [`txn`]: transaction id generator with a persisted high-water mark
//! - [`entity_store`]: versioned entity operations built from the above

pub mod cache;
pub mod encoder;
pub mod entity_store;
pub mod id;
pub mod mapping;
pub mod options;
pub mod store;
pub mod tables;
pub mod txn;

// Re-exports
pub use encoder::BinaryEntityKeyEncoder;
pub use entity_store::{KvEntityStore, Update, VersionedValue};
pub use id::{IdGenerator, RandomIdGenerator, SequentialIdGenerator};
pub use mapping::NameMappingService;
pub use options::{Durability, StoreOptions};
pub use store::{BatchOp, OrderedByteStore};
pub use txn::{Clock, MarkStore, SystemClock, TransactionIdGenerator};
