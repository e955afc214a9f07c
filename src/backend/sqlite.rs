//! # SQLite Backend
//!
//! The default [`Backend`]: the append-only `key_value` table from
//! [`crate::schema`] behind one writer connection and a small pool of
//! read-only connections.
//!
//! ## Connection Layout
//!
//! ```text
//!   insert / sweep / compact          list / replay / max_revision
//!            │                                   │
//!            ▼                                   ▼
//!   ┌─────────────────┐            ┌───────────────────────────────┐
//!   │ writer (R/W)    │            │ readers[0..N] (READ_ONLY)     │
//!   │ Mutex<Conn>     │            │ Mutex<Conn>, round-robin      │
//!   └────────┬────────┘            └───────────────┬───────────────┘
//!            └───────────────┬─────────────────────┘
//!                            ▼
//!                     SQLite file (WAL)
//! ```
//!
//! WAL mode lets readers see every committed row without blocking the writer.
//! In-memory databases can't be shared across connections, so they run every
//! statement on the writer connection.
//!
//! ## "Latest Row per Key"
//!
//! All three listing variants share one query shape:
//!
//! ```sql
//! SELECT kv.* FROM key_value kv
//! INNER JOIN (SELECT MAX(revision) revision, name FROM key_value
//!             WHERE <pattern> [AND revision <= :revision] [AND name > :resume]
//!             GROUP BY name) r
//!   ON r.name = kv.name AND r.revision = kv.revision
//! WHERE kv.del = 0 ORDER BY kv.name LIMIT :limit
//! ```
//!
//! Tombstones are dropped after the latest row is chosen (a deleted key has a
//! tombstone as its latest row) but before `LIMIT`, so they never use up a
//! page slot.
//!
//! Prefix patterns use a range plus `substr` instead of `LIKE`: SQLite's
//! `LIKE` is case-insensitive for ASCII and would treat `_` in keys as a
//! wildcard.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OpenFlags, Row, ToSql};
use tracing::debug;

use super::{sql_limit, Backend};
use crate::error::{Error, Result};
use crate::schema::{read_meta_i64, write_meta_i64, Database, META_COMPACTED, META_REVISION};
use crate::types::{KeyPattern, KeyValue, Revision};

// =============================================================================
// SQL
// =============================================================================

const SELECT_COLUMNS: &str = "kv.id, kv.name, kv.value, kv.old_value, kv.old_revision, \
                              kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del";

const INSERT_ROW: &str = r#"
INSERT INTO key_value
    (name, value, old_value, old_revision, create_revision, revision, ttl, version, del)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
"#;

/// Every row of a key whose latest row has expired, so an older version can't
/// resurface as the current value.
const SWEEP_EXPIRED_KEYS: &str = r#"
DELETE FROM key_value
WHERE name IN (
    SELECT kv.name
    FROM key_value kv
    JOIN (SELECT name, MAX(revision) AS revision FROM key_value GROUP BY name) latest
      ON latest.name = kv.name AND latest.revision = kv.revision
    WHERE kv.ttl > 0 AND kv.ttl < ?1
)
"#;

/// Expired history rows left behind a live latest row.
const SWEEP_EXPIRED_ROWS: &str = "DELETE FROM key_value WHERE ttl > 0 AND ttl < ?1";

/// Rows at or below the compaction point that a newer row (also at or below
/// it) has superseded.
const COMPACT_SUPERSEDED: &str = r#"
DELETE FROM key_value
WHERE revision < ?1
  AND EXISTS (
      SELECT 1 FROM key_value newer
      WHERE newer.name = key_value.name
        AND newer.revision > key_value.revision
        AND newer.revision <= ?1
  )
"#;

/// Tombstones that are the latest row as of the compaction point. Once the
/// rows they shadow are gone they carry no information.
const COMPACT_TOMBSTONES: &str = "DELETE FROM key_value WHERE del = 1 AND revision <= ?1";

/// Builds the name filter for `pattern` against table alias `alias`.
fn name_clause(pattern: &KeyPattern, alias: &str) -> String {
    match pattern {
        KeyPattern::Exact(_) => format!("{alias}.name = :key"),
        KeyPattern::Prefix(_) => {
            format!("{alias}.name >= :key AND substr({alias}.name, 1, length(:key)) = :key")
        }
    }
}

/// Builds the latest-row-per-key query described in the module docs.
fn latest_per_key_sql(pattern: &KeyPattern, at_revision: bool, resume: bool) -> String {
    let mut filters = vec![name_clause(pattern, "kvi")];
    if at_revision {
        filters.push("kvi.revision <= :revision".to_string());
    }
    if resume {
        filters.push("kvi.name > :resume".to_string());
    }

    format!(
        "SELECT {SELECT_COLUMNS}
         FROM key_value kv
         INNER JOIN (
             SELECT MAX(kvi.revision) AS revision, kvi.name
             FROM key_value kvi
             WHERE {}
             GROUP BY kvi.name
         ) AS r ON r.name = kv.name AND r.revision = kv.revision
         WHERE kv.del = 0
         ORDER BY kv.name
         LIMIT :limit",
        filters.join(" AND ")
    )
}

fn replay_sql(pattern: &KeyPattern) -> String {
    format!(
        "SELECT {SELECT_COLUMNS}
         FROM key_value kv
         WHERE {} AND kv.revision <= :revision
         ORDER BY kv.revision",
        name_clause(pattern, "kv")
    )
}

/// Maps one result row (in `SELECT_COLUMNS` order) to a record.
fn scan_row(row: &Row<'_>) -> rusqlite::Result<KeyValue> {
    Ok(KeyValue {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        old_value: row.get(3)?,
        old_revision: Revision::from_raw(row.get(4)?),
        create_revision: Revision::from_raw(row.get(5)?),
        revision: Revision::from_raw(row.get(6)?),
        ttl: row.get(7)?,
        version: row.get(8)?,
        del: row.get::<_, i64>(9)? != 0,
    })
}

// =============================================================================
// SqliteBackend
// =============================================================================

/// [`Backend`] over a SQLite database.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use revstore::backend::{Backend, SqliteBackend};
///
/// let backend: Arc<dyn Backend> = Arc::new(SqliteBackend::open("state.db", 4)?);
/// # Ok::<(), revstore::Error>(())
/// ```
pub struct SqliteBackend {
    /// The only connection allowed to write.
    writer: Mutex<Connection>,

    /// Read-only connections. Empty for in-memory databases.
    readers: Vec<Mutex<Connection>>,

    /// Round-robin cursor into `readers`.
    next_reader: AtomicUsize,
}

impl SqliteBackend {
    /// Opens (or creates) a database file with `reader_count` read-only
    /// connections. A `reader_count` of 0 runs reads on the writer.
    pub fn open(path: impl AsRef<Path>, reader_count: usize) -> Result<Self> {
        let path = path.as_ref();

        // Schema first: read-only connections can't create tables.
        let db = Database::open(path)?;

        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            readers.push(Mutex::new(conn));
        }

        debug!(path = %path.display(), readers = reader_count, "opened sqlite backend");

        Ok(Self {
            writer: Mutex::new(db.into_connection()),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// Creates a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    /// Wraps an already-initialized database. All statements run on its
    /// connection.
    pub fn from_database(db: Database) -> Self {
        Self {
            writer: Mutex::new(db.into_connection()),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        }
    }

    /// Number of dedicated read-only connections.
    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        conn.lock()
            .map_err(|_| Error::Backend("sqlite connection lock poisoned".to_string()))
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = Self::lock(&self.writer)?;
        f(&mut conn)
    }

    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.readers.is_empty() {
            return self.with_writer(|conn| f(conn));
        }

        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = Self::lock(&self.readers[idx])?;
        f(&conn)
    }

    fn query_latest(
        &self,
        pattern: &KeyPattern,
        revision: Option<Revision>,
        resume_from_key: Option<&str>,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        let sql = latest_per_key_sql(pattern, revision.is_some(), resume_from_key.is_some());

        let key = pattern.as_str();
        let limit = sql_limit(limit);
        let revision = revision.map(|r| r.as_raw());

        let mut bound: Vec<(&str, &dyn ToSql)> =
            vec![(":key", &key as &dyn ToSql), (":limit", &limit as &dyn ToSql)];
        if let Some(revision) = revision.as_ref() {
            bound.push((":revision", revision as &dyn ToSql));
        }
        if let Some(resume) = resume_from_key.as_ref() {
            bound.push((":resume", resume as &dyn ToSql));
        }

        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(bound.as_slice(), scan_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

impl Backend for SqliteBackend {
    fn max_revision(&self) -> Result<Revision> {
        self.with_reader(|conn| {
            let stored = read_meta_i64(conn, META_REVISION)?;
            let rows: i64 = conn.query_row(
                "SELECT COALESCE(MAX(revision), 0) FROM key_value",
                [],
                |row| row.get(0),
            )?;
            Ok(Revision::from_raw(stored.max(rows)))
        })
    }

    fn insert(&self, row: &KeyValue) -> Result<i64> {
        self.with_writer(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                INSERT_ROW,
                params![
                    row.key,
                    row.value,
                    row.old_value,
                    row.old_revision.as_raw(),
                    row.create_revision.as_raw(),
                    row.revision.as_raw(),
                    row.ttl,
                    row.version,
                    row.del as i64,
                ],
            )?;
            let id = tx.last_insert_rowid();

            let high_water = read_meta_i64(&tx, META_REVISION)?;
            if row.revision.as_raw() > high_water {
                write_meta_i64(&tx, META_REVISION, row.revision.as_raw())?;
            }

            tx.commit()?;
            Ok(id)
        })
    }

    fn list_current(&self, pattern: &KeyPattern, limit: usize) -> Result<Vec<KeyValue>> {
        self.query_latest(pattern, None, None, limit)
    }

    fn list_at_revision(
        &self,
        revision: Revision,
        pattern: &KeyPattern,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        self.query_latest(pattern, Some(revision), None, limit)
    }

    fn list_resume_at_revision(
        &self,
        revision: Revision,
        pattern: &KeyPattern,
        resume_from_key: &str,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        self.query_latest(pattern, Some(revision), Some(resume_from_key), limit)
    }

    fn replay_history(&self, pattern: &KeyPattern, up_to: Revision) -> Result<Vec<KeyValue>> {
        let sql = replay_sql(pattern);
        let key = pattern.as_str();
        let up_to = up_to.as_raw();
        let bound: [(&str, &dyn ToSql); 2] = [
            (":key", &key as &dyn ToSql),
            (":revision", &up_to as &dyn ToSql),
        ];

        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(&bound[..], scan_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn sweep(&self, cutoff_secs: i64) -> Result<usize> {
        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            let keys = tx.execute(SWEEP_EXPIRED_KEYS, [cutoff_secs])?;
            let rows = tx.execute(SWEEP_EXPIRED_ROWS, [cutoff_secs])?;
            tx.commit()?;
            Ok(keys + rows)
        })
    }

    fn compact(&self, revision: Revision) -> Result<usize> {
        let revision = revision.as_raw();

        self.with_writer(|conn| {
            let tx = conn.transaction()?;

            let superseded = tx.execute(COMPACT_SUPERSEDED, [revision])?;
            let tombstones = tx.execute(COMPACT_TOMBSTONES, [revision])?;

            // The revision high-water mark is untouched: every insert already
            // recorded it, so removing the newest rows can't lower it.
            if revision > read_meta_i64(&tx, META_COMPACTED)? {
                write_meta_i64(&tx, META_COMPACTED, revision)?;
            }

            tx.commit()?;
            Ok(superseded + tombstones)
        })
    }

    fn compacted_revision(&self) -> Result<Revision> {
        self.with_reader(|conn| Ok(Revision::from_raw(read_meta_i64(conn, META_COMPACTED)?)))
    }
}

// =============================================================================
// Tests
// =============================================================================
