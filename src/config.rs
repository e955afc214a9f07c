//! # Store Configuration
//!
//! Tunables for a [`RevStore`](crate::RevStore). Every field has a default;
//! override with the `with_*` builders or from `REVSTORE_*` environment
//! variables via [`StoreConfig::from_env`].
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `REVSTORE_FEED_CAPACITY` | `feed_capacity` | 1024 |
//! | `REVSTORE_SUBSCRIBER_BUFFER` | `subscriber_buffer` | 256 |
//! | `REVSTORE_WRITE_TIMEOUT_MS` | `write_timeout` | 30 000 ms |
//! | `REVSTORE_READ_TIMEOUT_MS` | `read_timeout` | 30 000 ms |
//! | `REVSTORE_SWEEP_INTERVAL_SECS` | `sweep_interval` | 60 s |
//! | `REVSTORE_READERS` | `reader_count` | CPU count, 1..=16 |

use std::env;
use std::str::FromStr;
use std::thread::available_parallelism;
use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Pending records the change feed holds before writers block.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Records buffered per subscriber before the feed waits on it.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Deadline for a write to reach its commit point.
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 30_000;

/// Deadline for a read.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;

/// Period of the background ttl sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Minimum number of read-only connections for file databases.
const MIN_READERS: usize = 1;

/// Maximum number of read-only connections for file databases.
const MAX_READERS: usize = 16;

const ENV_FEED_CAPACITY: &str = "REVSTORE_FEED_CAPACITY";
const ENV_SUBSCRIBER_BUFFER: &str = "REVSTORE_SUBSCRIBER_BUFFER";
const ENV_WRITE_TIMEOUT_MS: &str = "REVSTORE_WRITE_TIMEOUT_MS";
const ENV_READ_TIMEOUT_MS: &str = "REVSTORE_READ_TIMEOUT_MS";
const ENV_SWEEP_INTERVAL_SECS: &str = "REVSTORE_SWEEP_INTERVAL_SECS";
const ENV_READERS: &str = "REVSTORE_READERS";

// =============================================================================
// StoreConfig
// =============================================================================

/// Configuration for a store.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use revstore::StoreConfig;
///
/// let config = StoreConfig::default()
///     .with_feed_capacity(64)
///     .with_write_timeout(Duration::from_secs(5));
/// assert_eq!(config.feed_capacity, 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Capacity of the change feed queue. When it is full, writers wait.
    pub feed_capacity: usize,

    /// Capacity of each subscriber's buffer.
    pub subscriber_buffer: usize,

    /// How long a put or delete may wait for the gate, the current-record
    /// read and a feed slot before failing with `Error::Timeout`.
    pub write_timeout: Duration,

    /// How long a get, list or replay may take.
    pub read_timeout: Duration,

    /// Period of the ttl sweep. `Duration::ZERO` disables the background task
    /// (`RevStore::sweep_now` still works).
    pub sweep_interval: Duration,

    /// Read-only connections opened for file databases.
    pub reader_count: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let reader_count = available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_READERS)
            .clamp(MIN_READERS, MAX_READERS);

        Self {
            feed_capacity: DEFAULT_FEED_CAPACITY,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            reader_count,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by any `REVSTORE_*` variables that are set.
    ///
    /// # Errors
    ///
    /// `Error::Config` if a variable is set but doesn't parse, or the result
    /// fails [`StoreConfig::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`StoreConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var::<usize>(&lookup, ENV_FEED_CAPACITY)? {
            config.feed_capacity = v;
        }
        if let Some(v) = parse_var::<usize>(&lookup, ENV_SUBSCRIBER_BUFFER)? {
            config.subscriber_buffer = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_WRITE_TIMEOUT_MS)? {
            config.write_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_READ_TIMEOUT_MS)? {
            config.read_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&lookup, ENV_SWEEP_INTERVAL_SECS)? {
            config.sweep_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<usize>(&lookup, ENV_READERS)? {
            config.reader_count = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the store can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.feed_capacity == 0 {
            return Err(Error::Config("feed_capacity must be at least 1".to_string()));
        }
        if self.subscriber_buffer == 0 {
            return Err(Error::Config(
                "subscriber_buffer must be at least 1".to_string(),
            ));
        }
        if self.write_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }

    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_reader_count(mut self, readers: usize) -> Self {
        self.reader_count = readers;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has invalid value '{raw}'"))),
    }
}

// =============================================================================
// Tests
// =============================================================================
