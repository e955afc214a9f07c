//! # Error Handling for revstore
//!
//! This module defines the error types used throughout revstore. A single
//! error enum ([`Error`]) represents every failure mode, so callers match on
//! one type whether the failure came from the MVCC engine, the change feed or
//! the storage backend.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from `#[from]` attributes
//! - Source chaining comes from `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Conditional write | `NotExists`, `RevisionMismatch` | Re-read and retry |
//! | Misuse | `InvalidOperation`, `Config` | Fix the caller, never retry |
//! | Backend | `Sqlite`, `Backend`, `Schema` | Surface unchanged, investigate |
//! | Internal | `Internal` | Report a bug |
//! | Flow control | `Timeout`, `Cancelled`, `Closed` | Back off or shut down |
//! | History | `Compacted` | Read at a newer revision |

use std::time::Duration;

use thiserror::Error;

use crate::types::Revision;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in revstore operations.
///
/// # Example
///
/// ```rust,ignore
/// use revstore::{Error, Revision};
///
/// match store.put("config/a", b"v2".to_vec(), Revision::from_raw(7), 0).await {
///     Ok(result) => println!("now at {}", result.record.revision),
///     Err(Error::RevisionMismatch { actual, .. }) => {
///         // Someone else wrote first: re-read at `actual` and retry.
///     }
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conditional Write Errors (client re-reads and retries)
    // =========================================================================

    /// A conditional mutation named an expected revision, but the key has no
    /// current record (it never existed, or its latest row is a tombstone).
    #[error("key '{key}' does not exist")]
    NotExists {
        /// The key the caller tried to mutate.
        key: String,
    },

    /// Optimistic concurrency failure: the key was modified since the caller
    /// last read it.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the key to get its current revision
    /// 2. Re-apply business logic with the fresh value
    /// 3. Retry with the new expected revision
    ///
    /// The engine never retries this itself.
    #[error("revision mismatch on key '{key}': expected {expected}, but found {actual}")]
    RevisionMismatch {
        /// The key the caller tried to mutate.
        key: String,
        /// The revision the caller expected to be current.
        expected: Revision,
        /// The key's actual current revision.
        actual: Revision,
    },

    // =========================================================================
    // Misuse (programming errors)
    // =========================================================================

    /// A point mutation was issued against a wildcard pattern.
    ///
    /// This is a bug in the caller, not a runtime condition. Debug builds
    /// also trip a `debug_assert!` before this is returned.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // =========================================================================
    // Backend Errors (surfaced unchanged, not retried)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// The `#[from]` attribute lets `?` convert `rusqlite::Error` directly.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A non-SQLite backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Schema version mismatch or unreadable metadata.
    #[error("schema error: {0}")]
    Schema(String),

    /// A configuration value was missing its required shape (zero capacity,
    /// unparsable environment variable, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    // =========================================================================
    // Flow Control
    // =========================================================================

    /// An operation did not finish within its deadline.
    ///
    /// For writes this is only raised before the commit point: nothing was
    /// persisted and no revision was consumed.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Which operation timed out (`"put"`, `"list"`, ...).
        operation: &'static str,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The store is shutting down and the operation was abandoned before it
    /// committed anything.
    #[error("operation cancelled")]
    Cancelled,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// A snapshot read asked for history that compaction already removed.
    #[error("revision {requested} has been compacted (compacted through {compacted})")]
    Compacted {
        /// The revision the caller asked for.
        requested: Revision,
        /// The store's compacted revision.
        compacted: Revision,
    },

    /// The change feed dropped this subscriber.
    #[error("subscription closed")]
    SubscriptionClosed,

    // =========================================================================
    // Internal
    // =========================================================================

    /// An engine task panicked or a shared lock was poisoned. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for failures that originated in the storage backend.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Error::Sqlite(_) | Error::Backend(_) | Error::Schema(_))
    }

    /// Returns true for conditional-write failures a caller should handle by
    /// re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::NotExists { .. } | Error::RevisionMismatch { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let mismatch = Error::RevisionMismatch {
            key: "a".to_string(),
            expected: Revision::from_raw(1),
            actual: Revision::from_raw(2),
        };
        assert_eq!(
            mismatch.to_string(),
            "revision mismatch on key 'a': expected 1, but found 2"
        );

        let missing = Error::NotExists {
            key: "ghost".to_string(),
        };
        assert_eq!(missing.to_string(), "key 'ghost' does not exist");

        let compacted = Error::Compacted {
            requested: Revision::from_raw(3),
            compacted: Revision::from_raw(10),
        };
        assert_eq!(
            compacted.to_string(),
            "revision 3 has been compacted (compacted through 10)"
        );

        let timeout = Error::Timeout {
            operation: "put",
            after: Duration::from_millis(5),
        };
        assert_eq!(timeout.to_string(), "put timed out after 5ms");
    }

    /// `?` converts rusqlite errors through the `#[from]` impl.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
        assert!(our_err.is_backend_failure());
        assert!(!our_err.is_conflict());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(Error::NotExists { key: "k".into() }.is_conflict());
        assert!(!Error::InvalidOperation("k%".into()).is_conflict());
        assert!(!Error::Cancelled.is_backend_failure());
        assert!(Error::Backend("task failed".into()).is_backend_failure());
        assert!(!Error::Internal("lock poisoned".into()).is_backend_failure());
    }
}
