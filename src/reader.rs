//! # Query Layer
//!
//! Reads go straight to the backend, without the write gate. A read may land
//! just before or just after a concurrent write; pass an explicit revision
//! to pin what you see.
//!
//! ## Choosing the Backend Query
//!
//! ```text
//!   revision <= 0, no cursor  ──► list_current
//!   revision  > 0, no cursor  ──► list_at_revision(revision)
//!   revision  > 0, cursor     ──► list_resume_at_revision(revision, cursor)
//!   revision <= 0, cursor     ──► list_resume_at_revision(current revision, cursor)
//! ```
//!
//! The last row lets live listings paginate too: the cursor pins the listing
//! to the revision it resolved against.
//!
//! ## Detecting Truncation
//!
//! A listing with `limit = L` asks the backend for `L + 1` rows. If the extra
//! row comes back, the result is truncated to `L` and `more` is set, with no
//! second round trip. `limit = 0` means "everything", capped at
//! [`UNBOUNDED_LIST_LIMIT`].

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{run_blocking, Backend};
use crate::error::{Error, Result};
use crate::types::{KeyPattern, KeyValue, ListResult, Revision, UNBOUNDED_LIST_LIMIT};
use crate::writer::RevisionMarks;

/// The read half of a store.
pub(crate) struct Reader {
    backend: Arc<dyn Backend>,
    marks: Arc<RevisionMarks>,
    read_timeout: Duration,
}

impl Reader {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        marks: Arc<RevisionMarks>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            marks,
            read_timeout,
        }
    }

    /// Runs `f` against the backend on the blocking pool, under the read
    /// deadline.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Backend) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        tokio::time::timeout(self.read_timeout, run_blocking(move || f(backend.as_ref())))
            .await
            .map_err(|_| Error::Timeout {
                operation,
                after: self.read_timeout,
            })?
    }

    /// Current record of exactly `key`, if it exists and isn't deleted.
    pub(crate) async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let pattern = KeyPattern::exact(key);
        let rows = self
            .run("get", move |backend| backend.list_current(&pattern, 1))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Paginated listing of current records matching `pattern`.
    pub(crate) async fn list(
        &self,
        pattern: KeyPattern,
        revision: Revision,
        limit: usize,
        resume_from_key: Option<String>,
    ) -> Result<ListResult> {
        let compacted = self.marks.compacted();
        if !revision.is_none() && revision < compacted {
            return Err(Error::Compacted {
                requested: revision,
                compacted,
            });
        }

        let fetch = if limit == 0 {
            UNBOUNDED_LIST_LIMIT
        } else {
            limit.saturating_add(1)
        };

        let at = match (&resume_from_key, revision.is_none()) {
            (Some(_), true) => Some(self.marks.current()),
            (_, true) => None,
            (_, false) => Some(revision),
        };

        let mut kvs = self
            .run("list", move |backend| match (at, resume_from_key) {
                (None, _) => backend.list_current(&pattern, fetch),
                (Some(at), None) => backend.list_at_revision(at, &pattern, fetch),
                (Some(at), Some(cursor)) => {
                    backend.list_resume_at_revision(at, &pattern, &cursor, fetch)
                }
            })
            .await?;

        let more = limit > 0 && kvs.len() > limit;
        if more {
            kvs.truncate(limit);
        }

        // A row may become visible a moment before the committed mark moves.
        let newest = kvs.iter().map(|kv| kv.revision).max().unwrap_or_default();
        let revision = self.marks.current().max(newest);

        Ok(ListResult {
            kvs,
            more,
            revision,
        })
    }

    /// Every row of every key matching `pattern` up to `up_to` (the current
    /// revision when `up_to <= 0`), tombstones included, in revision order.
    pub(crate) async fn replay(&self, pattern: KeyPattern, up_to: Revision) -> Result<Vec<KeyValue>> {
        let up_to = if up_to.is_none() {
            self.marks.current()
        } else {
            up_to
        };
        self.run("replay", move |backend| backend.replay_history(&pattern, up_to))
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
