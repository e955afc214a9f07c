//! # Domain Types for revstore
//!
//! This module defines the core types used throughout revstore: revisions,
//! key patterns, and the history record that every mutation appends.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Revisions are wrapped in [`Revision`] rather than passed around as raw
//! `i64`. A revision and a per-key version are both small integers, and mixing
//! them up is exactly the kind of bug that optimistic concurrency makes hard
//! to notice. The compiler catches it instead.
//!
//! ## Invariants
//!
//! - [`Revision`]: strictly increasing across the whole store, never reused,
//!   zero means "none"
//! - [`KeyValue::version`]: starts at 1 per chain, +1 per mutation of that key
//! - [`KeyValue::create_revision`]: identical along one key's chain

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Marker that turns a key into a prefix pattern when it is the last character.
///
/// `"config/%"` matches every key starting with `"config/"`; `"config/a"`
/// matches exactly one key.
pub const KEY_WILDCARD: char = '%';

/// Row ceiling used when a listing asks for `limit == 0` ("unbounded").
pub const UNBOUNDED_LIST_LIMIT: usize = 1_000_000;

// =============================================================================
// Revision
// =============================================================================

/// A point in the store's global history.
///
/// Every accepted put or delete gets the next revision. Reads can target any
/// past revision to see the store as it was at that moment.
///
/// # Why i64?
///
/// SQLite `INTEGER` is a signed 64-bit value, and the list API uses
/// `revision <= 0` to mean "the live view". Keeping the raw type signed means
/// no casts at the storage boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    /// No revision: an unconditional write, a first version's `old_revision`,
    /// or "list the live view".
    pub const NONE: Revision = Revision(0);

    /// The first revision an empty store hands out.
    pub const FIRST: Revision = Revision(1);

    /// Creates a revision from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns true for [`Revision::NONE`] and negative values.
    pub fn is_none(&self) -> bool {
        self.0 <= 0
    }

    /// Returns the revision after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Revision {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// =============================================================================
// Key Patterns
// =============================================================================

/// Which keys a read or watch applies to.
///
/// Point mutations only accept [`KeyPattern::Exact`]; handing them a prefix is
/// rejected with [`Error::InvalidOperation`](crate::Error::InvalidOperation).
///
/// # Example
///
/// ```rust
/// use revstore::types::KeyPattern;
///
/// assert_eq!(KeyPattern::parse("a%"), KeyPattern::prefix("a"));
/// assert_eq!(KeyPattern::parse("a"), KeyPattern::exact("a"));
/// assert!(KeyPattern::parse("a%").matches("a2"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Exactly one key.
    Exact(String),
    /// Every key starting with this prefix. An empty prefix matches everything.
    Prefix(String),
}

impl KeyPattern {
    /// Parses the string convention: a trailing [`KEY_WILDCARD`] means prefix.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix(KEY_WILDCARD) {
            Some(prefix) => KeyPattern::Prefix(prefix.to_string()),
            None => KeyPattern::Exact(pattern.to_string()),
        }
    }

    /// Matches exactly `key`.
    pub fn exact(key: impl Into<String>) -> Self {
        KeyPattern::Exact(key.into())
    }

    /// Matches every key beginning with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyPattern::Prefix(prefix.into())
    }

    /// Matches every key in the store.
    pub fn all() -> Self {
        KeyPattern::Prefix(String::new())
    }

    /// Returns true if this pattern can match more than one key.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, KeyPattern::Prefix(_))
    }

    /// Returns the key (exact) or the prefix (wildcard) without the marker.
    pub fn as_str(&self) -> &str {
        match self {
            KeyPattern::Exact(key) => key,
            KeyPattern::Prefix(prefix) => prefix,
        }
    }

    /// Returns true if `key` falls under this pattern.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(exact) => exact == key,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Exact(key) => write!(f, "{key}"),
            KeyPattern::Prefix(prefix) => write!(f, "{prefix}{KEY_WILDCARD}"),
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<String> for KeyPattern {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&String> for KeyPattern {
    fn from(s: &String) -> Self {
        Self::parse(s)
    }
}

// =============================================================================
// History Record
// =============================================================================

/// One historical version of a key: a single row of the append-only log.
///
/// # Denormalized Before/After
///
/// Each row carries both the new payload and the payload it replaced
/// (`old_value`, `old_revision`). A watcher gets a full diff from one row, and
/// "what did this key look like before?" never needs a self-join.
///
/// ```text
/// key "a":  rev 1  v1  value "1"  old ""   old_rev 0   create 1
///           rev 2  v2  value "2"  old "1"  old_rev 1   create 1
///           rev 3  v3  value ""   old "2"  old_rev 2   create 1  del
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    /// Backend row id. Storage-internal ordering only.
    pub id: i64,

    /// The logical key.
    pub key: String,

    /// Payload of this version (empty for tombstones).
    pub value: Vec<u8>,

    /// Payload of the previous version (empty for version 1).
    pub old_value: Vec<u8>,

    /// Global revision at which this row was written.
    pub revision: Revision,

    /// Revision of the previous version (`NONE` for version 1).
    pub old_revision: Revision,

    /// Revision of the first row of this key's chain.
    pub create_revision: Revision,

    /// Per-key mutation counter, starting at 1.
    pub version: i64,

    /// Absolute expiry as unix seconds, 0 for "never".
    pub ttl: i64,

    /// Tombstone flag: this version records a deletion.
    pub del: bool,
}

impl KeyValue {
    /// Builds the row that follows `prior` in its key's chain, or the first row
    /// of a fresh chain when `prior` is `None`.
    ///
    /// A non-zero `ttl` overrides the inherited one; zero carries it forward.
    pub fn next_version(
        key: impl Into<String>,
        prior: Option<&KeyValue>,
        value: Vec<u8>,
        revision: Revision,
        ttl: i64,
        del: bool,
    ) -> Self {
        let mut row = KeyValue {
            id: 0,
            key: key.into(),
            value,
            old_value: Vec::new(),
            revision,
            old_revision: Revision::NONE,
            create_revision: revision,
            version: 1,
            ttl,
            del,
        };

        if let Some(prior) = prior {
            row.old_value = prior.value.clone();
            row.old_revision = prior.revision;
            row.create_revision = prior.create_revision;
            row.version = prior.version + 1;
            if ttl == 0 {
                row.ttl = prior.ttl;
            }
        }

        row
    }

    /// Returns true if this row records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.del
    }

    /// Returns true if this row started its key's chain.
    pub fn is_created(&self) -> bool {
        self.version == 1
    }

    /// Reconstructs the version this row replaced from its denormalized
    /// `old_*` fields. Returns `None` for the first row of a chain.
    ///
    /// The reconstruction knows the prior payload and revision but not the
    /// prior row's own predecessor, so its `old_*` fields are left empty.
    pub fn previous(&self) -> Option<KeyValue> {
        if self.version <= 1 {
            return None;
        }

        Some(KeyValue {
            id: 0,
            key: self.key.clone(),
            value: self.old_value.clone(),
            old_value: Vec::new(),
            revision: self.old_revision,
            old_revision: Revision::NONE,
            create_revision: self.create_revision,
            version: self.version - 1,
            ttl: self.ttl,
            del: false,
        })
    }

    /// Returns true if the sweep would remove this row at `now_secs`.
    pub fn is_expired(&self, now_secs: i64) -> bool {
        self.ttl > 0 && self.ttl < now_secs
    }
}

// =============================================================================
// Operation Results
// =============================================================================

/// Result of a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// The version that was current before the put, if any.
    pub prior: Option<KeyValue>,
    /// The row the put appended.
    pub record: KeyValue,
}

impl PutResult {
    /// True when the put started a new chain rather than updating one.
    pub fn created(&self) -> bool {
        self.record.is_created()
    }
}

/// Result of a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    /// The records removed from the live view (empty if the key was absent).
    pub prior: Vec<KeyValue>,
    /// The tombstone row, or `None` when the key was already absent and
    /// nothing was written.
    pub record: Option<KeyValue>,
}

impl DeleteResult {
    /// Number of keys removed from the live view.
    pub fn deleted(&self) -> usize {
        self.prior.len()
    }
}

/// Result of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListResult {
    /// Matching current records, ordered by key.
    pub kvs: Vec<KeyValue>,
    /// True when more matching keys exist beyond `kvs`.
    pub more: bool,
    /// Store revision the listing was served at.
    pub revision: Revision,
}

impl ListResult {
    /// Key of the last record, to pass as the next page's resume cursor.
    pub fn next_cursor(&self) -> Option<&str> {
        if self.more {
            self.kvs.last().map(|kv| kv.key.as_str())
        } else {
            None
        }
    }
}

// =============================================================================
// Time
// =============================================================================

/// Returns the current unix time in seconds.
pub fn current_time_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
