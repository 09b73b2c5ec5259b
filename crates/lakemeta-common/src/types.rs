//! Core type definitions for LakeMeta
//!
//! This module defines the entity kinds stored in the catalog and the
//! hierarchical name paths that address them.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Leaf name matching every direct child of a namespace.
pub const WILDCARD: &str = "*";

/// Delimiter used when rendering a path, e.g. `metalake1.catalog2.schema3`.
pub const PATH_DELIMITER: char = '.';

/// Kind of entity stored in the catalog.
///
/// Every kind owns a two-byte ASCII short code that leads its binary keys,
/// so all entities of one kind live in a contiguous key range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum EntityKind {
    #[display("metalake")]
    Metalake,
    #[display("catalog")]
    Catalog,
    #[display("schema")]
    Schema,
    #[display("table")]
    Table,
    #[display("fileset")]
    Fileset,
    #[display("topic")]
    Topic,
    #[display("column")]
    Column,
    #[display("user")]
    User,
    #[display("group")]
    Group,
    #[display("role")]
    Role,
    #[display("audit")]
    Audit,
}

impl EntityKind {
    /// All entity kinds.
    pub const ALL: [Self; 11] = [
        Self::Metalake,
        Self::Catalog,
        Self::Schema,
        Self::Table,
        Self::Fileset,
        Self::Topic,
        Self::Column,
        Self::User,
        Self::Group,
        Self::Role,
        Self::Audit,
    ];

    /// Two-letter short name of this kind, e.g. `ml` for metalakes.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::Metalake => "ml",
            Self::Catalog => "ca",
            Self::Schema => "sc",
            Self::Table => "ta",
            Self::Fileset => "fi",
            Self::Topic => "to",
            Self::Column => "co",
            Self::User => "us",
            Self::Group => "gr",
            Self::Role => "ro",
            Self::Audit => "au",
        }
    }

    /// Two-byte code leading every key of this kind.
    #[must_use]
    pub const fn short_code(self) -> &'static [u8] {
        self.short_name().as_bytes()
    }

    /// Look up a kind by its short code.
    #[must_use]
    pub fn from_short_code(code: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.short_code() == code)
    }

    /// Kinds of the namespace levels enclosing an entity of this kind,
    /// outermost first.
    ///
    /// Returns `None` for kinds that cannot be addressed on their own
    /// (columns live inside a table payload, audit info inside every entity).
    #[must_use]
    pub const fn ancestors(self) -> Option<&'static [Self]> {
        match self {
            Self::Metalake => Some(&[]),
            Self::Catalog | Self::User | Self::Group | Self::Role => Some(&[Self::Metalake]),
            Self::Schema => Some(&[Self::Metalake, Self::Catalog]),
            Self::Table | Self::Fileset | Self::Topic => {
                Some(&[Self::Metalake, Self::Catalog, Self::Schema])
            }
            Self::Column | Self::Audit => None,
        }
    }

    /// Number of namespace levels an entity of this kind sits under.
    #[must_use]
    pub fn namespace_depth(self) -> Option<usize> {
        self.ancestors().map(<[Self]>::len)
    }

    /// Whether keys of this kind can be encoded.
    #[must_use]
    pub fn is_encodable(self) -> bool {
        self.ancestors().is_some()
    }

    /// Kinds stored underneath an entity of this kind, at any depth.
    #[must_use]
    pub fn descendant_kinds(self) -> Vec<Self> {
        let Some(depth) = self.namespace_depth() else {
            return Vec::new();
        };
        Self::ALL
            .into_iter()
            .filter(|k| {
                k.ancestors()
                    .is_some_and(|a| a.len() > depth && a[depth] == self)
            })
            .collect()
    }
}

impl FromStr for EntityKind {
    type Err = crate::Error;

    /// Accepts the display name (`table`) or the short name (`ta`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.to_string() == s || k.short_name() == s)
            .ok_or_else(|| crate::Error::invalid_argument(format!("unknown entity kind '{s}'")))
    }
}

/// Hierarchical name of an entity: namespace levels plus a leaf name.
///
/// A leaf equal to [`WILDCARD`] addresses every direct child of the
/// namespace and encodes to a scan prefix.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamePath {
    namespace: Vec<String>,
    name: String,
}

impl NamePath {
    /// Create a path from namespace levels and a leaf name
    pub fn new<I, S>(namespace: I, name: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.into_iter().map(Into::into).collect(),
            name: name.into(),
        }
    }

    /// Create a path in the root namespace
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            namespace: Vec::new(),
            name: name.into(),
        }
    }

    /// Create a wildcard path matching every child of `namespace`
    pub fn wildcard<I, S>(namespace: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(namespace, WILDCARD)
    }

    /// Namespace levels, outermost first
    #[must_use]
    pub fn namespace(&self) -> &[String] {
        &self.namespace
    }

    /// Leaf name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the leaf is the wildcard marker
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.name == WILDCARD
    }

    /// All segments: namespace levels followed by the leaf
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.namespace
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.name.as_str()))
    }

    /// Path of a child named `name` under this path
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            namespace: self.segments().map(str::to_string).collect(),
            name: name.into(),
        }
    }

    /// Same namespace, different leaf
    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            name: name.into(),
        }
    }

    /// Path of the enclosing entity, `None` at the root
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (name, namespace) = self.namespace.split_last()?;
        Some(Self {
            namespace: namespace.to_vec(),
            name: name.clone(),
        })
    }
}

impl fmt::Display for NamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for level in &self.namespace {
            write!(f, "{level}{PATH_DELIMITER}")?;
        }
        f.write_str(&self.name)
    }
}

impl fmt::Debug for NamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamePath({self})")
    }
}

impl FromStr for NamePath {
    type Err = crate::Error;

    /// Parse a dotted path. The last segment becomes the leaf name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments: Vec<String> = s.split(PATH_DELIMITER).map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(crate::Error::invalid_argument(format!(
                "path '{s}' contains an empty segment"
            )));
        }
        // split() always yields at least one element
        let name = segments.pop().unwrap_or_default();
        Ok(Self {
            namespace: segments,
            name,
        })
    }
}
