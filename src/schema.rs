//! # SQLite Schema for revstore
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  key_value (append-only history)         revstore_metadata              │
//! │  ┌──────────────────────┐                ┌──────────────────────┐       │
//! │  │ id (PK, autoinc)     │                │ key (PK)             │       │
//! │  │ name        ─────────┼── idx          │ value                │       │
//! │  │ value / old_value    │                └──────────────────────┘       │
//! │  │ revision    ─────────┼── unique idx     schema_version               │
//! │  │ old_revision         │                  revision (high-water)        │
//! │  │ create_revision      │                  compacted_revision           │
//! │  │ version / ttl / del  │                                               │
//! │  └──────────────────────┘                                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why a High-Water Mark in Metadata?
//!
//! `MAX(revision)` over `key_value` is not safe on its own: the ttl sweep and
//! compaction physically delete rows, and if they remove the newest rows a
//! restart would hand out a revision that was already used. The writer
//! updates `revision` in the same transaction as each insert, so the stored
//! mark never goes backwards.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Metadata key holding the revision high-water mark.
pub(crate) const META_REVISION: &str = "revision";

/// Metadata key holding the compacted revision.
pub(crate) const META_COMPACTED: &str = "compacted_revision";

// =============================================================================
// DDL Statements
// =============================================================================

/// The `key_value` table: one row per historical version of a key.
///
/// # Columns
///
/// - `id`: Storage row id, monotonic, never exposed as the logical revision
/// - `name`: The logical key
/// - `value` / `old_value`: Payload after and before this version
/// - `revision`: Global revision of this row
/// - `old_revision`: Revision of the previous version (0 for the first)
/// - `create_revision`: Revision of the chain's first row
/// - `version`: Per-key counter, 1-based
/// - `ttl`: Expiry as unix seconds, 0 = never
/// - `del`: 1 for tombstones
///
/// Rows are never updated. Only the ttl sweep and compaction delete them.
const CREATE_KEY_VALUE: &str = r#"
CREATE TABLE IF NOT EXISTS key_value (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT    NOT NULL,
    value           BLOB    NOT NULL,
    old_value       BLOB    NOT NULL,
    revision        INTEGER NOT NULL,
    old_revision    INTEGER NOT NULL DEFAULT 0,
    create_revision INTEGER NOT NULL,
    version         INTEGER NOT NULL,
    ttl             INTEGER NOT NULL DEFAULT 0,
    del             INTEGER NOT NULL DEFAULT 0
)
"#;

/// Lookup by key. Supports prefix ranges (`name >= ?`) and exact matches.
const CREATE_NAME_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS key_value_name
ON key_value(name)
"#;

/// Revisions are unique across the store. Besides the as-of-revision
/// queries, this turns any revision reuse into a hard insert failure.
const CREATE_REVISION_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS key_value_revision
ON key_value(revision)
"#;

/// Covers "latest revision per key" (`GROUP BY name` with `MAX(revision)`).
const CREATE_NAME_REVISION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS key_value_name_revision
ON key_value(name, revision)
"#;

/// Partial index so the sweep only visits rows that can expire.
const CREATE_TTL_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS key_value_ttl
ON key_value(ttl) WHERE ttl > 0
"#;

/// Metadata table: schema version and engine bookkeeping.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS revstore_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the revstore schema applied.
///
/// Owning the `Connection` means the schema is guaranteed to exist for as long
/// as the wrapper lives. Use [`Database::into_connection`] to hand the raw
/// connection to a backend once initialization is done.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use revstore::Database;
    ///
    /// let db = Database::open("state.db")?;
    /// # Ok::<(), revstore::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(true)?;
        Ok(db)
    }

    /// Creates an in-memory database, for tests and ephemeral stores.
    ///
    /// ```rust
    /// use revstore::Database;
    ///
    /// let db = Database::open_in_memory()?;
    /// # Ok::<(), revstore::Error>(())
    /// ```
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(false)?;
        Ok(db)
    }

    /// Creates tables, verifies the schema version, and sets pragmas.
    fn initialize(&mut self, file_backed: bool) -> Result<()> {
        // WAL lets read-only connections see committed rows while the writer
        // keeps appending. In-memory databases don't support it.
        if file_backed {
            self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
            self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        }
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_KEY_VALUE)?;
        self.conn.execute_batch(CREATE_NAME_INDEX)?;
        self.conn.execute_batch(CREATE_REVISION_INDEX)?;
        self.conn.execute_batch(CREATE_NAME_REVISION_INDEX)?;
        self.conn.execute_batch(CREATE_TTL_INDEX)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = match self.conn.query_row(
            "SELECT value FROM revstore_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        ) {
            Ok(s) => Some(s.parse().unwrap_or(0)),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO revstore_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this revstore version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Consumes the wrapper and returns the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Borrows the underlying connection.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Reads an integer metadata value, 0 if unset.
pub(crate) fn read_meta_i64(conn: &Connection, key: &str) -> Result<i64> {
    match conn.query_row(
        "SELECT value FROM revstore_metadata WHERE key = ?",
        [key],
        |row| row.get::<_, String>(0),
    ) {
        Ok(s) => s
            .parse()
            .map_err(|_| Error::Schema(format!("metadata '{key}' is not an integer: {s}"))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Writes an integer metadata value.
pub(crate) fn write_meta_i64(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO revstore_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, value.to_string()],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
