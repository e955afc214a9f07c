//! # Async API for revstore
//!
//! [`RevStore`] is the entry point: it owns the backend, the write gate, the
//! change feed and the background sweep, and exposes them as async methods.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        RevStore (Clone)                             │
//! │                                                                     │
//! │  put/delete ──► Writer ──gate──► Backend::insert ──► ChangeFeed ──┐ │
//! │                                                                   │ │
//! │  get/list/replay ──► Reader ──────► Backend::list_*               │ │
//! │                                                                   ▼ │
//! │  subscribe/watch ◄───────────────────────────────── drain task      │
//! │                                                                     │
//! │  sweep task (every 60s) ──► Backend::sweep                          │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! There is no global instance. Open a store, share clones of the handle,
//! and call [`RevStore::close`] when done. Close stops the background tasks,
//! waits for any in-flight write to commit, and ends every subscription.
//! Dropping the last handle without closing stops the tasks as well, but
//! doesn't wait for them.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{run_blocking, Backend, SqliteBackend};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::feed::{CatchUpSubscription, ChangeFeed, Subscription};
use crate::reader::Reader;
use crate::types::{
    current_time_secs, DeleteResult, KeyPattern, KeyValue, ListResult, PutResult, Revision,
};
use crate::writer::{RevisionMarks, Writer};

// =============================================================================
// RevStore
// =============================================================================

/// Handle to an open store.
///
/// `RevStore` is `Clone`, `Send` and `Sync`; clones share the same store.
///
/// # Example
///
/// ```rust,no_run
/// use revstore::{RevStore, Revision};
///
/// # async fn example() -> revstore::Result<()> {
/// let store = RevStore::open("state.db").await?;
///
/// let created = store.put("config/a", b"1".to_vec(), Revision::NONE, 0).await?;
/// let updated = store
///     .put("config/a", b"2".to_vec(), created.record.revision, 0)
///     .await?;
/// assert_eq!(updated.record.version, 2);
///
/// let page = store.list("config/%", Revision::NONE, 10, None).await?;
/// assert_eq!(page.kvs.len(), 1);
///
/// store.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RevStore {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    writer: Writer,
    reader: Reader,
    feed: ChangeFeed,
    marks: Arc<RevisionMarks>,
    shutdown: CancellationToken,

    /// Feed drain and sweep tasks, joined on close.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RevStore {
    /// Opens or creates a SQLite-backed store at `path`, configured from the
    /// `REVSTORE_*` environment variables.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::from_env()?).await
    }

    /// Opens or creates a SQLite-backed store at `path`.
    pub async fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let path = path.as_ref().to_path_buf();
        let readers = config.reader_count;
        let backend = run_blocking(move || SqliteBackend::open(path, readers)).await?;

        Self::open_with_backend(Arc::new(backend), config).await
    }

    /// Creates a store over a private in-memory SQLite database.
    pub async fn open_in_memory() -> Result<Self> {
        let backend = SqliteBackend::open_in_memory()?;
        Self::open_with_backend(Arc::new(backend), StoreConfig::default()).await
    }

    /// Creates a store over any [`Backend`].
    ///
    /// The revision counter resumes from the backend's highest persisted
    /// revision.
    pub async fn open_with_backend(backend: Arc<dyn Backend>, config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let (last, compacted) = {
            let backend = Arc::clone(&backend);
            run_blocking(move || Ok((backend.max_revision()?, backend.compacted_revision()?)))
                .await?
        };

        let marks = Arc::new(RevisionMarks::new(last, compacted));
        let shutdown = CancellationToken::new();

        let (feed, drain_task) = ChangeFeed::spawn(
            config.feed_capacity,
            config.subscriber_buffer,
            shutdown.clone(),
        );
        let mut tasks = vec![drain_task];

        if !config.sweep_interval.is_zero() {
            tasks.push(spawn_sweep_task(
                Arc::clone(&backend),
                config.sweep_interval,
                shutdown.clone(),
            ));
        }

        let writer = Writer::new(
            Arc::clone(&backend),
            last,
            feed.publisher(),
            Arc::clone(&marks),
            config.write_timeout,
            shutdown.clone(),
        );
        let reader = Reader::new(Arc::clone(&backend), Arc::clone(&marks), config.read_timeout);

        info!(revision = %last, compacted = %compacted, "store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                writer,
                reader,
                feed,
                marks,
                shutdown,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Writes `value` under `key`.
    ///
    /// With `expected_revision > 0` the put only succeeds if that is the
    /// key's current revision. A non-zero `ttl` (absolute unix seconds) sets
    /// the expiry; zero keeps the previous version's.
    ///
    /// # Errors
    ///
    /// - `Error::NotExists` / `Error::RevisionMismatch` on a failed condition
    /// - `Error::InvalidOperation` if `key` ends with the wildcard marker
    /// - `Error::Timeout` if the write couldn't reach its commit point in time
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        expected_revision: Revision,
        ttl: i64,
    ) -> Result<PutResult> {
        self.inner
            .writer
            .put(key.into(), value.into(), expected_revision, ttl)
            .await
    }

    /// Deletes `key` by appending a tombstone.
    ///
    /// Deleting a key that doesn't exist (without an expected revision) is a
    /// no-op: nothing is written and no revision is consumed.
    pub async fn delete(
        &self,
        key: impl Into<String>,
        expected_revision: Revision,
    ) -> Result<DeleteResult> {
        self.inner.writer.delete(key.into(), expected_revision).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current record of `key`, or `None` if absent or deleted.
    pub async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.ensure_open()?;
        self.inner.reader.get(key).await
    }

    /// Lists current records whose keys match `pattern`, ordered by key.
    ///
    /// - `revision <= 0` reads the live view, `revision > 0` a snapshot.
    /// - `limit == 0` returns everything; otherwise `more` reports whether
    ///   keys were left out.
    /// - `resume_from_key` continues after that key (exclusive). Pass
    ///   [`ListResult::next_cursor`] from the previous page.
    pub async fn list(
        &self,
        pattern: impl Into<KeyPattern>,
        revision: Revision,
        limit: usize,
        resume_from_key: Option<&str>,
    ) -> Result<ListResult> {
        self.ensure_open()?;
        self.inner
            .reader
            .list(
                pattern.into(),
                revision,
                limit,
                resume_from_key.map(str::to_string),
            )
            .await
    }

    /// Full history of every key matching `pattern` up to `up_to_revision`
    /// (`<= 0` for "now"), tombstones included, oldest first.
    pub async fn replay(
        &self,
        pattern: impl Into<KeyPattern>,
        up_to_revision: Revision,
    ) -> Result<Vec<KeyValue>> {
        self.ensure_open()?;
        self.inner.reader.replay(pattern.into(), up_to_revision).await
    }

    /// Last committed revision.
    pub fn current_revision(&self) -> Revision {
        self.inner.marks.current()
    }

    /// Revision history has been compacted through.
    pub fn compacted_revision(&self) -> Revision {
        self.inner.marks.compacted()
    }

    // =========================================================================
    // Watching
    // =========================================================================

    /// Every mutation accepted from now on.
    pub fn subscribe(&self) -> Result<Subscription> {
        self.inner.feed.subscribe(None)
    }

    /// Mutations accepted from now on whose key matches `pattern`.
    pub fn subscribe_pattern(&self, pattern: impl Into<KeyPattern>) -> Result<Subscription> {
        self.inner.feed.subscribe(Some(pattern.into()))
    }

    /// Every mutation of keys matching `pattern` with revision at or after
    /// `start_revision`: first the stored history, then live.
    ///
    /// `start_revision <= 0` watches from now on.
    ///
    /// # Errors
    ///
    /// `Error::Compacted` if `start_revision` is older than the compacted
    /// revision.
    pub async fn watch(
        &self,
        pattern: impl Into<KeyPattern>,
        start_revision: Revision,
    ) -> Result<CatchUpSubscription> {
        let pattern = pattern.into();

        let compacted = self.inner.marks.compacted();
        if !start_revision.is_none() && start_revision < compacted {
            return Err(Error::Compacted {
                requested: start_revision,
                compacted,
            });
        }

        // Register before reading history so nothing falls in between.
        let live = self.inner.feed.subscribe(Some(pattern.clone()))?;
        let through = self.inner.marks.current();

        let backlog = if start_revision.is_none() || start_revision > through {
            Vec::new()
        } else {
            self.inner
                .reader
                .replay(pattern, through)
                .await?
                .into_iter()
                .filter(|kv| kv.revision >= start_revision)
                .collect()
        };

        // Live records older than the requested start are skipped too.
        let skip_through = if start_revision.is_none() {
            through
        } else {
            through.max(Revision::from_raw(start_revision.as_raw() - 1))
        };

        debug!(
            start = %start_revision,
            through = %through,
            backlog = backlog.len(),
            "watch started"
        );
        Ok(CatchUpSubscription::new(backlog, skip_through, live))
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Discards history no snapshot at or after `revision` needs. Snapshot
    /// reads below `revision` then fail with `Error::Compacted`.
    ///
    /// Returns the number of rows removed; compacting to a revision at or
    /// below the current compaction point removes nothing.
    pub async fn compact(&self, revision: Revision) -> Result<usize> {
        self.ensure_open()?;

        let current = self.inner.marks.current();
        if revision > current {
            return Err(Error::InvalidOperation(format!(
                "cannot compact to revision {revision}, store is at {current}"
            )));
        }
        if revision <= self.inner.marks.compacted() {
            return Ok(0);
        }

        let backend = Arc::clone(&self.inner.backend);
        let removed = run_blocking(move || backend.compact(revision)).await?;
        self.inner.marks.set_compacted(revision);

        info!(revision = %revision, removed, "history compacted");
        Ok(removed)
    }

    /// Runs the ttl sweep immediately. Returns the number of rows removed.
    pub async fn sweep_now(&self) -> Result<usize> {
        self.ensure_open()?;
        sweep_expired(&self.inner.backend).await
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.feed.subscriber_count()
    }

    /// Returns true once [`RevStore::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Shuts the store down.
    ///
    /// New operations fail with `Error::Closed`; writes still preparing fail
    /// with `Error::Cancelled`; a write already committing finishes first.
    /// Calling close twice is harmless.
    pub async fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        self.inner.writer.quiesce().await;

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        info!(revision = %self.current_revision(), "store closed");
    }
}

// =============================================================================
// Background Sweep
// =============================================================================

fn spawn_sweep_task(
    backend: Arc<dyn Backend>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick completes immediately.
        ticker.tick().await;

        info!(interval_secs = period.as_secs(), "ttl sweep task started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ttl sweep task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = sweep_expired(&backend).await {
                        warn!(error = %e, "ttl sweep failed");
                    }
                }
            }
        }
    })
}

async fn sweep_expired(backend: &Arc<dyn Backend>) -> Result<usize> {
    let backend = Arc::clone(backend);
    let now = current_time_secs();
    let removed = run_blocking(move || backend.sweep(now)).await?;

    if removed > 0 {
        info!(removed, cutoff = now, "ttl sweep removed expired rows");
    } else {
        debug!("ttl sweep: nothing expired");
    }
    Ok(removed)
}

// =============================================================================
// Tests
// =============================================================================
