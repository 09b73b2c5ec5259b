//! Redb table definitions and reserved key prefixes.
//!
//! Everything lives in one ordered table of raw byte keys. Entity keys start
//! with a two-letter kind code followed by `/`; the bookkeeping rows below use
//! prefixes that no kind code can produce.

use redb::TableDefinition;

// Key: encoded entity key or bookkeeping key, Value: raw bytes
pub const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

// Name mapping, e.g. "name_0/ca:catalog2" -> id (8 bytes BE)
pub const NAME_PREFIX: &[u8] = b"name_";
// Reverse mapping, "id_" ++ id (8 bytes BE) -> mapping key
pub const ID_PREFIX: &[u8] = b"id_";
// Transaction id high-water mark (8 bytes BE)
pub const LAST_TIMESTAMP: &[u8] = b"last_timestamp";
