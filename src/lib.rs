//! # revstore - Revision-Versioned Key-Value Store
//!
//! revstore is an embeddable key-value store that keeps every version of
//! every key, on top of SQLite. It provides:
//!
//! - **MVCC history**: each mutation appends a row stamped with a store-wide
//!   revision; nothing is updated in place
//! - **Optimistic concurrency**: puts and deletes conditional on the key's
//!   current revision
//! - **Snapshot reads**: list keys as they were at any retained revision
//! - **Change feed**: subscribers see every accepted mutation, in revision
//!   order, without loss
//! - **Housekeeping**: a ttl sweep and explicit history compaction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │        (put, delete, get, list, replay, watch, compact)         │
//! └───────────────┬─────────────────────────────┬───────────────────┘
//!                 │                             │
//!                 ▼                             ▼
//! ┌───────────────────────────────┐  ┌──────────────────────────────┐
//! │            Writer             │  │            Reader            │
//! │  gate ► check ► insert ► feed │  │  get / list / replay         │
//! └───────────────┬───────────────┘  └──────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Backend (SQLite or in-memory)                  │
//! │                  append-only key_value history                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Revisions**: strictly increasing across the store, never reused,
//!    also across restarts
//! 2. **Chains**: a key's `version` grows by one per mutation and its
//!    `create_revision` stays fixed until a tombstone ends the chain
//! 3. **Durability first**: a mutation is published only after it is stored
//! 4. **Feed order**: subscribers receive records in revision order
//!
//! ## Module Organization
//!
//! - [`error`]: error type for all failure modes
//! - [`types`]: revisions, key patterns, history records
//! - [`schema`]: SQLite DDL and database initialization
//! - [`backend`]: storage contract plus SQLite and in-memory backends
//! - [`config`]: store tunables
//! - `writer`: revision allocation and conditional writes
//! - `reader`: queries
//! - [`feed`]: change feed and subscriptions
//! - [`response`]: client-facing response shapes
//! - [`api`]: async API (main entry point)

pub mod error;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Domain types: revisions, key patterns and history records.
pub mod types;

/// Storage backends.
///
/// [`SqliteBackend`] is the production backend; [`MemoryBackend`] keeps the
/// history in a `Vec` and is meant for tests.
pub mod backend;

pub mod config;

/// Revision allocation and conditional writes.
///
/// Every put and delete passes through one gate, so revisions are handed out
/// in the same order rows are persisted and published.
pub(crate) mod writer;

pub(crate) mod reader;

/// Change feed and subscriptions.
///
/// See [`Subscription`] for live-only subscriptions and
/// [`CatchUpSubscription`] for history followed by live records.
pub mod feed;

pub mod response;

/// Async API for revstore.
///
/// The main entry point is [`RevStore`](api::RevStore).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::RevStore;
pub use backend::{Backend, MemoryBackend, SqliteBackend};
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use feed::{CatchUpSubscription, Subscription};
pub use schema::Database;

pub use types::{
    DeleteResult, KeyPattern, KeyValue, ListResult, PutResult, Revision, KEY_WILDCARD,
    UNBOUNDED_LIST_LIMIT,
};

pub use response::{
    DeleteResponse, EventType, PutResponse, RangeResponse, ResponseHeader, ResponseKeyValue,
    WatchEvent,
};
