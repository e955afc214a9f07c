//! # MVCC Writer
//!
//! Puts and deletes go through one path, [`Writer::mutate`]: read the key's
//! current record, check the caller's expected revision, build the next row of
//! the key's chain, persist it, publish it on the change feed.
//!
//! ## The Gate
//!
//! ```text
//!   put ─┐
//! delete ┼──► gate: Mutex<RevisionCounter> ──► read ► check ► reserve ► insert ► publish
//!   put ─┘        (one writer at a time)
//! ```
//!
//! The revision counter lives *inside* the store-wide mutex, so holding the
//! gate is the only way to allocate a revision. "Read current, compare,
//! append" is therefore linearizable across all keys, even though the
//! backend itself offers no compare-and-swap. Reads never take the gate.
//!
//! ## Prepare, Then Commit
//!
//! A write is split at its commit point:
//!
//! | Phase | Steps | Cancellable? |
//! |-------|-------|--------------|
//! | prepare | lock gate, read current, CAS check, reserve feed slot | yes (timeout, shutdown, caller drop) |
//! | commit | insert row, advance counter, send into reserved slot | no, runs in its own task |
//!
//! Abandoning a write during prepare leaves nothing behind: no row, no
//! revision, no feed entry. Once the row is about to be inserted the commit
//! runs in a spawned task that owns the gate guard and the feed permit, so
//! dropping the caller's future can't strand a persisted row that was never
//! published.
//!
//! ## Revision Allocation
//!
//! The counter holds the last revision handed out. A mutation uses `last + 1`
//! and the counter only moves after the insert succeeded, so a backend failure
//! never burns a revision.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{run_blocking, Backend};
use crate::error::{Error, Result};
use crate::types::{DeleteResult, KeyPattern, KeyValue, PutResult, Revision};

// =============================================================================
// Revision Bookkeeping
// =============================================================================

/// Revisions readers may observe without taking the gate.
#[derive(Debug, Default)]
pub(crate) struct RevisionMarks {
    current: AtomicI64,
    compacted: AtomicI64,
}

impl RevisionMarks {
    pub(crate) fn new(current: Revision, compacted: Revision) -> Self {
        Self {
            current: AtomicI64::new(current.as_raw()),
            compacted: AtomicI64::new(compacted.as_raw()),
        }
    }

    /// Last committed revision.
    pub(crate) fn current(&self) -> Revision {
        Revision::from_raw(self.current.load(Ordering::Acquire))
    }

    pub(crate) fn compacted(&self) -> Revision {
        Revision::from_raw(self.compacted.load(Ordering::Acquire))
    }

    fn advance(&self, revision: Revision) {
        self.current.fetch_max(revision.as_raw(), Ordering::AcqRel);
    }

    pub(crate) fn set_compacted(&self, revision: Revision) {
        self.compacted.fetch_max(revision.as_raw(), Ordering::AcqRel);
    }
}

/// State guarded by the gate.
#[derive(Debug)]
struct RevisionCounter {
    last: Revision,
}

// =============================================================================
// Mutations
// =============================================================================

/// One point mutation.
#[derive(Debug, Clone)]
pub(crate) struct Mutation {
    pub key: String,
    pub value: Vec<u8>,
    pub expected: Revision,
    pub ttl: i64,
    pub delete: bool,
}

impl Mutation {
    fn operation(&self) -> &'static str {
        if self.delete {
            "delete"
        } else {
            "put"
        }
    }
}

/// Output of a mutation: what was current before, and the appended row.
/// `record` is `None` only for a delete of an absent key.
type Applied = (Option<KeyValue>, Option<KeyValue>);

enum Prepared {
    /// Nothing to write.
    Noop,
    Commit(Commit),
}

struct Commit {
    gate: OwnedMutexGuard<RevisionCounter>,
    permit: mpsc::OwnedPermit<KeyValue>,
    prior: Option<KeyValue>,
    record: KeyValue,
}

// =============================================================================
// Writer
// =============================================================================

/// The write half of a store.
pub(crate) struct Writer {
    backend: Arc<dyn Backend>,
    gate: Arc<Mutex<RevisionCounter>>,
    publisher: mpsc::Sender<KeyValue>,
    marks: Arc<RevisionMarks>,
    write_timeout: Duration,
    shutdown: CancellationToken,
}

impl Writer {
    /// `last` is the highest revision the backend has ever persisted.
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        last: Revision,
        publisher: mpsc::Sender<KeyValue>,
        marks: Arc<RevisionMarks>,
        write_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backend,
            gate: Arc::new(Mutex::new(RevisionCounter { last })),
            publisher,
            marks,
            write_timeout,
            shutdown,
        }
    }

    pub(crate) async fn put(
        &self,
        key: String,
        value: Vec<u8>,
        expected: Revision,
        ttl: i64,
    ) -> Result<PutResult> {
        let (prior, record) = self
            .mutate(Mutation {
                key,
                value,
                expected,
                ttl,
                delete: false,
            })
            .await?;

        let record =
            record.ok_or_else(|| Error::Internal("put produced no record".to_string()))?;
        Ok(PutResult { prior, record })
    }

    pub(crate) async fn delete(&self, key: String, expected: Revision) -> Result<DeleteResult> {
        let (prior, record) = self
            .mutate(Mutation {
                key,
                value: Vec::new(),
                expected,
                ttl: 0,
                delete: true,
            })
            .await?;

        Ok(DeleteResult {
            prior: prior.into_iter().collect(),
            record,
        })
    }

    /// Applies one mutation under the gate.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` for a wildcard key (also a debug assertion)
    /// - `NotExists` / `RevisionMismatch` when the expected revision fails
    /// - `Timeout` / `Cancelled` / `Closed` before the commit point
    /// - backend errors from the read or the insert
    pub(crate) async fn mutate(&self, mutation: Mutation) -> Result<Applied> {
        let wildcard = KeyPattern::parse(&mutation.key).is_wildcard();
        debug_assert!(!wildcard, "point mutation on wildcard key '{}'", mutation.key);
        if wildcard {
            return Err(Error::InvalidOperation(format!(
                "cannot {} wildcard key '{}'",
                mutation.operation(),
                mutation.key
            )));
        }

        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let operation = mutation.operation();
        let prepared = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
            prepared = tokio::time::timeout(self.write_timeout, self.prepare(mutation)) => {
                match prepared {
                    Ok(prepared) => prepared?,
                    Err(_) => {
                        return Err(Error::Timeout {
                            operation,
                            after: self.write_timeout,
                        })
                    }
                }
            }
        };

        match prepared {
            Prepared::Noop => Ok((None, None)),
            Prepared::Commit(commit) => {
                let task = tokio::spawn(commit_mutation(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.marks),
                    commit,
                ));
                let (prior, record) = task
                    .await
                    .map_err(|e| Error::Internal(format!("commit task failed: {e}")))??;
                Ok((prior, Some(record)))
            }
        }
    }

    /// Everything up to the commit point.
    async fn prepare(&self, mutation: Mutation) -> Result<Prepared> {
        let gate = Arc::clone(&self.gate).lock_owned().await;

        let backend = Arc::clone(&self.backend);
        let pattern = KeyPattern::exact(mutation.key.clone());
        let current = run_blocking(move || backend.list_current(&pattern, 1))
            .await?
            .into_iter()
            .next();

        if !mutation.expected.is_none() {
            match &current {
                None => {
                    return Err(Error::NotExists {
                        key: mutation.key,
                    })
                }
                Some(current) if current.revision != mutation.expected => {
                    return Err(Error::RevisionMismatch {
                        key: mutation.key,
                        expected: mutation.expected,
                        actual: current.revision,
                    })
                }
                Some(_) => {}
            }
        }

        if mutation.delete && current.is_none() {
            return Ok(Prepared::Noop);
        }

        // A full feed blocks here, before anything is persisted.
        let permit = self
            .publisher
            .clone()
            .reserve_owned()
            .await
            .map_err(|_| Error::Closed)?;

        let record = KeyValue::next_version(
            mutation.key,
            current.as_ref(),
            mutation.value,
            gate.last.next(),
            mutation.ttl,
            mutation.delete,
        );

        Ok(Prepared::Commit(Commit {
            gate,
            permit,
            prior: current,
            record,
        }))
    }

    /// Waits until no write is in flight. Later writes still queue normally.
    pub(crate) async fn quiesce(&self) {
        let _gate = self.gate.lock().await;
    }
}

/// Persist, advance the counter, publish. Runs to completion once started.
async fn commit_mutation(
    backend: Arc<dyn Backend>,
    marks: Arc<RevisionMarks>,
    commit: Commit,
) -> Result<(Option<KeyValue>, KeyValue)> {
    let Commit {
        mut gate,
        permit,
        prior,
        mut record,
    } = commit;

    let row = record.clone();
    record.id = run_blocking(move || backend.insert(&row)).await?;

    gate.last = record.revision;
    marks.advance(record.revision);
    permit.send(record.clone());

    debug!(
        key = %record.key,
        revision = %record.revision,
        version = record.version,
        del = record.del,
        "mutation committed"
    );

    drop(gate);
    Ok((prior, record))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::backend::MemoryBackend;

    fn writer_with(
        backend: Arc<dyn Backend>,
        capacity: usize,
        timeout: Duration,
    ) -> (Writer, mpsc::Receiver<KeyValue>, Arc<RevisionMarks>) {
        let (tx, rx) = mpsc::channel(capacity);
        let marks = Arc::new(RevisionMarks::default());
        let writer = Writer::new(
            backend,
            Revision::NONE,
            tx,
            Arc::clone(&marks),
            timeout,
            CancellationToken::new(),
        );
        (writer, rx, marks)
    }

    /// Memory backend whose next insert fails once when armed.
    #[derive(Default)]
    struct FailingInsert {
        inner: MemoryBackend,
        fail_next: AtomicBool,
    }

    impl FailingInsert {
        fn arm(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    impl Backend for FailingInsert {
        fn max_revision(&self) -> Result<Revision> {
            self.inner.max_revision()
        }

        fn insert(&self, row: &KeyValue) -> Result<i64> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::Backend("disk full".to_string()));
            }
            self.inner.insert(row)
        }

        fn list_current(&self, pattern: &KeyPattern, limit: usize) -> Result<Vec<KeyValue>> {
            self.inner.list_current(pattern, limit)
        }

        fn list_at_revision(
            &self,
            revision: Revision,
            pattern: &KeyPattern,
            limit: usize,
        ) -> Result<Vec<KeyValue>> {
            self.inner.list_at_revision(revision, pattern, limit)
        }

        fn list_resume_at_revision(
            &self,
            revision: Revision,
            pattern: &KeyPattern,
            resume_from_key: &str,
            limit: usize,
        ) -> Result<Vec<KeyValue>> {
            self.inner
                .list_resume_at_revision(revision, pattern, resume_from_key, limit)
        }

        fn replay_history(&self, pattern: &KeyPattern, up_to: Revision) -> Result<Vec<KeyValue>> {
            self.inner.replay_history(pattern, up_to)
        }

        fn sweep(&self, cutoff_secs: i64) -> Result<usize> {
            self.inner.sweep(cutoff_secs)
        }

        fn compact(&self, revision: Revision) -> Result<usize> {
            self.inner.compact(revision)
        }

        fn compacted_revision(&self) -> Result<Revision> {
            self.inner.compacted_revision()
        }
    }

    fn writer() -> (Writer, mpsc::Receiver<KeyValue>, Arc<RevisionMarks>) {
        writer_with(
            Arc::new(MemoryBackend::new()),
            64,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_first_put_starts_chain_at_one() {
        let (writer, mut rx, marks) = writer();

        let result = writer
            .put("a".into(), b"1".to_vec(), Revision::NONE, 0)
            .await
            .unwrap();

        assert!(result.prior.is_none());
        assert!(result.created());
        assert_eq!(result.record.revision, Revision::FIRST);
        assert_eq!(result.record.create_revision, Revision::FIRST);
        assert_eq!(marks.current(), Revision::FIRST);
        assert_eq!(rx.recv().await.unwrap(), result.record);
    }

    #[tokio::test]
    async fn test_cas_checks() {
        let (writer, _rx, _) = writer();

        let missing = writer
            .put("a".into(), b"1".to_vec(), Revision::from_raw(3), 0)
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::NotExists { .. }));

        writer
            .put("a".into(), b"1".to_vec(), Revision::NONE, 0)
            .await
            .unwrap();

        let stale = writer
            .put("a".into(), b"2".to_vec(), Revision::from_raw(7), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            stale,
            Error::RevisionMismatch { actual, .. } if actual == Revision::FIRST
        ));

        let ok = writer
            .put("a".into(), b"2".to_vec(), Revision::FIRST, 0)
            .await
            .unwrap();
        assert_eq!(ok.record.revision.as_raw(), 2, "failed CAS burned no revision");
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_noop() {
        let (writer, mut rx, marks) = writer();

        let result = writer.delete("ghost".into(), Revision::NONE).await.unwrap();
        assert_eq!(result.deleted(), 0);
        assert!(result.record.is_none());
        assert_eq!(marks.current(), Revision::NONE);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_writes_tombstone() {
        let (writer, _rx, _) = writer();
        writer
            .put("a".into(), b"1".to_vec(), Revision::NONE, 42)
            .await
            .unwrap();

        let result = writer.delete("a".into(), Revision::FIRST).await.unwrap();
        let tombstone = result.record.unwrap();
        assert!(tombstone.del);
        assert_eq!(tombstone.version, 2);
        assert_eq!(tombstone.ttl, 42);
        assert_eq!(result.prior.len(), 1);
        assert_eq!(result.prior[0].value, b"1");
    }

    #[tokio::test]
    async fn test_full_feed_times_out_without_writing() {
        let backend = Arc::new(MemoryBackend::new());
        let (writer, _rx, marks) = writer_with(backend.clone(), 1, Duration::from_millis(50));

        writer
            .put("a".into(), b"1".to_vec(), Revision::NONE, 0)
            .await
            .unwrap();

        let err = writer
            .put("b".into(), b"1".to_vec(), Revision::NONE, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "put", .. }));
        assert_eq!(backend.len(), 1);
        assert_eq!(marks.current(), Revision::FIRST);
    }

    #[tokio::test]
    async fn test_closed_writer_rejects() {
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        let writer = Writer::new(
            Arc::new(MemoryBackend::new()),
            Revision::NONE,
            tx,
            Arc::new(RevisionMarks::default()),
            Duration::from_secs(1),
            token.clone(),
        );

        token.cancel();
        let err = writer
            .put("a".into(), Vec::new(), Revision::NONE, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn test_failed_insert_burns_no_revision() {
        let backend = Arc::new(FailingInsert::default());
        let (writer, mut rx, marks) = writer_with(backend.clone(), 8, Duration::from_secs(5));

        let first = writer
            .put("a".into(), b"1".to_vec(), Revision::NONE, 0)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), first.record);

        backend.arm();
        let err = writer
            .put("a".into(), b"2".to_vec(), Revision::NONE, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(err.is_backend_failure());
        assert_eq!(marks.current(), first.record.revision);
        assert!(rx.try_recv().is_err());

        let next = writer
            .put("a".into(), b"3".to_vec(), Revision::NONE, 0)
            .await
            .unwrap();
        assert_eq!(next.record.revision, first.record.revision.next());
        assert_eq!(next.record.version, 2);
        assert_eq!(next.record.old_value, b"1");
        assert_eq!(rx.recv().await.unwrap(), next.record);
    }

    #[tokio::test]
    async fn test_counter_resumes_from_last() {
        let (tx, _rx) = mpsc::channel(4);
        let writer = Writer::new(
            Arc::new(MemoryBackend::new()),
            Revision::from_raw(41),
            tx,
            Arc::new(RevisionMarks::default()),
            Duration::from_secs(1),
            CancellationToken::new(),
        );

        let result = writer
            .put("a".into(), b"x".to_vec(), Revision::NONE, 0)
            .await
            .unwrap();
        assert_eq!(result.record.revision.as_raw(), 42);
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "wildcard")]
    async fn test_wildcard_mutation_asserts() {
        let (writer, _rx, _) = writer();
        let _ = writer.put("a%".into(), Vec::new(), Revision::NONE, 0).await;
    }

    #[cfg(not(debug_assertions))]
    #[tokio::test]
    async fn test_wildcard_mutation_rejected() {
        let (writer, _rx, _) = writer();
        let err = writer
            .delete("a%".into(), Revision::NONE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }
}
