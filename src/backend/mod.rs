//! # Storage Backend Contract
//!
//! The MVCC engine never talks SQL. Everything it needs from storage goes
//! through the [`Backend`] trait, so the relational engine underneath can be
//! swapped out without touching revision allocation or the change feed.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ MVCC writer  │   │ Query layer  │
//! └──────┬───────┘   └──────┬───────┘
//!        │  spawn_blocking  │
//!        └────────┬─────────┘
//!                 ▼
//!        ┌─────────────────┐
//!        │ Arc<dyn Backend>│
//!        └────────┬────────┘
//!        ┌────────┴─────────┐
//!        ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐
//! │SqliteBackend │   │MemoryBackend │
//! │ (WAL, pool)  │   │ (Vec + lock) │
//! └──────────────┘   └──────────────┘
//! ```
//!
//! ## Rust Pattern: Sync Trait, Async Callers
//!
//! The trait is deliberately synchronous. `rusqlite` is a blocking library,
//! and an `async fn` in a trait object would still have to block somewhere.
//! Callers run backend methods inside `tokio::task::spawn_blocking`, which is
//! why implementations must be `Send + Sync + 'static`.
//!
//! ## Listing Contract
//!
//! Every listing variant returns, for each key matching the pattern, the
//! key's latest row (at or below the target revision for snapshots) with
//! tombstones removed, ordered by key and capped at `limit` rows. Callers pass
//! `limit + 1` when they want to detect truncation.

use crate::error::{Error, Result};
use crate::types::{KeyPattern, KeyValue, Revision};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Storage operations the engine depends on.
pub trait Backend: Send + Sync + 'static {
    /// Highest revision ever persisted, [`Revision::NONE`] for an empty store.
    ///
    /// Must not go backwards when rows are physically removed by the sweep or
    /// by compaction.
    fn max_revision(&self) -> Result<Revision>;

    /// Appends one history row and returns its backend row id.
    ///
    /// Atomic: the row (and the revision high-water mark) is either fully
    /// visible afterwards or not at all. Inserting a revision that already
    /// exists is an error.
    fn insert(&self, row: &KeyValue) -> Result<i64>;

    /// Latest live row per matching key.
    fn list_current(&self, pattern: &KeyPattern, limit: usize) -> Result<Vec<KeyValue>>;

    /// Latest row per matching key as of `revision`.
    fn list_at_revision(
        &self,
        revision: Revision,
        pattern: &KeyPattern,
        limit: usize,
    ) -> Result<Vec<KeyValue>>;

    /// Same as [`Backend::list_at_revision`], restricted to keys strictly
    /// greater than `resume_from_key`.
    fn list_resume_at_revision(
        &self,
        revision: Revision,
        pattern: &KeyPattern,
        resume_from_key: &str,
        limit: usize,
    ) -> Result<Vec<KeyValue>>;

    /// Every row of every matching key with `revision <= up_to`, tombstones
    /// included, ascending by revision.
    fn replay_history(&self, pattern: &KeyPattern, up_to: Revision) -> Result<Vec<KeyValue>>;

    /// Deletes rows whose ttl expired before `cutoff_secs`. A key whose latest
    /// row expired loses its whole chain, so an older version never becomes
    /// current again. Returns the number of rows removed.
    fn sweep(&self, cutoff_secs: i64) -> Result<usize>;

    /// Removes history that no snapshot at or after `revision` can observe,
    /// and records `revision` as the compacted revision. Returns the number of
    /// rows removed.
    fn compact(&self, revision: Revision) -> Result<usize>;

    /// The revision passed to the most recent [`Backend::compact`], or
    /// [`Revision::NONE`].
    fn compacted_revision(&self) -> Result<Revision>;
}

/// Runs a blocking backend call on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Backend(format!("backend task failed: {e}")))?
}

/// Clamps a caller-supplied row count to what a SQL `LIMIT` accepts.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share. Each implementation's test module
    //! runs these against a fresh instance.

    use super::*;

    pub fn row(key: &str, value: &str, revision: i64, prior: Option<&KeyValue>, del: bool) -> KeyValue {
        KeyValue::next_version(
            key,
            prior,
            value.as_bytes().to_vec(),
            Revision::from_raw(revision),
            0,
            del,
        )
    }

    /// Seeds: a@1, a@2, b@3, a1@4, a@5 (tombstone), a2@6
    pub fn seed(backend: &dyn Backend) -> Vec<KeyValue> {
        let a1 = row("a", "1", 1, None, false);
        let a2 = row("a", "2", 2, Some(&a1), false);
        let b = row("b", "x", 3, None, false);
        let a1k = row("a1", "y", 4, None, false);
        let a_del = row("a", "", 5, Some(&a2), true);
        let a2k = row("a2", "z", 6, None, false);

        let rows = vec![a1, a2, b, a1k, a_del, a2k];
        for r in &rows {
            backend.insert(r).expect("insert should succeed");
        }
        rows
    }

    fn keys(rows: &[KeyValue]) -> Vec<&str> {
        rows.iter().map(|r| r.key.as_str()).collect()
    }

    pub fn max_revision_tracks_inserts(backend: &dyn Backend) {
        assert_eq!(backend.max_revision().unwrap(), Revision::NONE);
        seed(backend);
        assert_eq!(backend.max_revision().unwrap(), Revision::from_raw(6));
    }

    pub fn duplicate_revision_rejected(backend: &dyn Backend) {
        backend.insert(&row("a", "1", 1, None, false)).unwrap();
        assert!(backend.insert(&row("b", "1", 1, None, false)).is_err());
    }

    pub fn list_current_hides_tombstones(backend: &dyn Backend) {
        seed(backend);

        let all = backend.list_current(&KeyPattern::all(), 100).unwrap();
        assert_eq!(keys(&all), vec!["a1", "a2", "b"]);

        let a = backend.list_current(&KeyPattern::exact("a"), 1).unwrap();
        assert!(a.is_empty(), "tombstoned key must not be listed");

        let prefix = backend.list_current(&KeyPattern::prefix("a"), 100).unwrap();
        assert_eq!(keys(&prefix), vec!["a1", "a2"]);

        let limited = backend.list_current(&KeyPattern::prefix("a"), 1).unwrap();
        assert_eq!(keys(&limited), vec!["a1"]);
    }

    pub fn list_at_revision_is_snapshot(backend: &dyn Backend) {
        seed(backend);

        let at2 = backend
            .list_at_revision(Revision::from_raw(2), &KeyPattern::all(), 100)
            .unwrap();
        assert_eq!(keys(&at2), vec!["a"]);
        assert_eq!(at2[0].value, b"2");

        let at4 = backend
            .list_at_revision(Revision::from_raw(4), &KeyPattern::prefix("a"), 100)
            .unwrap();
        assert_eq!(keys(&at4), vec!["a", "a1"]);
    }

    pub fn list_resume_is_exclusive(backend: &dyn Backend) {
        seed(backend);

        let rest = backend
            .list_resume_at_revision(Revision::from_raw(6), &KeyPattern::all(), "a1", 100)
            .unwrap();
        assert_eq!(keys(&rest), vec!["a2", "b"]);
    }

    pub fn prefix_match_is_case_sensitive(backend: &dyn Backend) {
        backend.insert(&row("Abc", "1", 1, None, false)).unwrap();
        backend.insert(&row("abc", "1", 2, None, false)).unwrap();

        let lower = backend.list_current(&KeyPattern::prefix("a"), 100).unwrap();
        assert_eq!(keys(&lower), vec!["abc"]);
    }

    pub fn replay_includes_tombstones(backend: &dyn Backend) {
        seed(backend);

        let chain = backend
            .replay_history(&KeyPattern::exact("a"), Revision::from_raw(5))
            .unwrap();
        let revs: Vec<i64> = chain.iter().map(|r| r.revision.as_raw()).collect();
        assert_eq!(revs, vec![1, 2, 5]);
        assert!(chain[2].del);

        let upto2 = backend
            .replay_history(&KeyPattern::exact("a"), Revision::from_raw(2))
            .unwrap();
        assert_eq!(upto2.len(), 2);

        let prefix = backend
            .replay_history(&KeyPattern::prefix("a"), Revision::from_raw(6))
            .unwrap();
        let revs: Vec<i64> = prefix.iter().map(|r| r.revision.as_raw()).collect();
        assert_eq!(revs, vec![1, 2, 4, 5, 6]);
    }

    pub fn sweep_removes_expired_rows(backend: &dyn Backend) {
        let forever = row("forever", "1", 1, None, false);
        let mut long = row("long", "1", 2, None, false);
        long.ttl = 10_000;
        let mut short = row("short", "1", 3, None, false);
        short.ttl = 100;

        for r in [&forever, &long, &short] {
            backend.insert(r).unwrap();
        }

        assert_eq!(backend.sweep(100).unwrap(), 0, "cutoff is exclusive");
        assert_eq!(backend.sweep(101).unwrap(), 1);

        let left = backend.list_current(&KeyPattern::all(), 100).unwrap();
        assert_eq!(keys(&left), vec!["forever", "long"]);
        assert_eq!(
            backend.max_revision().unwrap(),
            Revision::from_raw(3),
            "sweep never lowers the high-water mark"
        );
    }

    pub fn sweep_drops_chain_of_expired_key(backend: &dyn Backend) {
        let a1 = row("a", "1", 1, None, false);
        let mut a2 = row("a", "2", 2, Some(&a1), false);
        a2.ttl = 100;
        let b = row("b", "1", 3, None, false);
        let mut c1 = row("c", "1", 4, None, false);
        c1.ttl = 50;
        let mut c2 = row("c", "2", 5, Some(&c1), false);
        c2.ttl = 10_000;

        for r in [&a1, &a2, &b, &c1, &c2] {
            backend.insert(r).unwrap();
        }

        // a loses its whole chain; c only its expired older row.
        assert_eq!(backend.sweep(101).unwrap(), 3);

        let left = backend.list_current(&KeyPattern::all(), 100).unwrap();
        assert_eq!(keys(&left), vec!["b", "c"]);
        assert_eq!(left[1].value, b"2");
        assert!(backend
            .replay_history(&KeyPattern::exact("a"), Revision::from_raw(5))
            .unwrap()
            .is_empty());
    }

    pub fn compact_keeps_snapshot_at_revision(backend: &dyn Backend) {
        seed(backend);

        let before = backend
            .list_at_revision(Revision::from_raw(4), &KeyPattern::all(), 100)
            .unwrap();

        let removed = backend.compact(Revision::from_raw(4)).unwrap();
        assert_eq!(removed, 1, "a@1 is superseded by a@2");
        assert_eq!(backend.compacted_revision().unwrap(), Revision::from_raw(4));

        let after = backend
            .list_at_revision(Revision::from_raw(4), &KeyPattern::all(), 100)
            .unwrap();
        assert_eq!(before, after);

        let live = backend.list_current(&KeyPattern::all(), 100).unwrap();
        assert_eq!(keys(&live), vec!["a1", "a2", "b"]);
    }

    pub fn compact_drops_settled_tombstones(backend: &dyn Backend) {
        seed(backend);

        // Through 6 the whole chain of "a" ends in its tombstone at 5.
        let removed = backend.compact(Revision::from_raw(6)).unwrap();
        assert_eq!(removed, 3);

        let history = backend
            .replay_history(&KeyPattern::exact("a"), Revision::from_raw(6))
            .unwrap();
        assert!(history.is_empty());
        assert_eq!(backend.max_revision().unwrap(), Revision::from_raw(6));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panicking_backend_task_is_a_backend_failure() {
        let err = run_blocking(|| -> Result<()> { panic!("backend crashed") })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(err.is_backend_failure());
    }
}
