#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use revstore::{RevStore, StoreConfig};

/// Config for tests: no background sweep, short deadlines.
pub fn test_config() -> StoreConfig {
    StoreConfig::default()
        .with_sweep_interval(Duration::ZERO)
        .with_write_timeout(Duration::from_secs(5))
        .with_read_timeout(Duration::from_secs(5))
        .with_reader_count(2)
}

pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub async fn open_store(path: &Path) -> RevStore {
    RevStore::open_with_config(path, test_config())
        .await
        .expect("open store")
}

pub async fn open_temp_store(name: &str) -> (tempfile::TempDir, PathBuf, RevStore) {
    let (dir, path) = temp_db_path(name);
    let store = open_store(&path).await;
    (dir, path, store)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn row_count(path: &Path) -> i64 {
    open_read_only(path)
        .query_row("SELECT COUNT(*) FROM key_value", [], |row| row.get(0))
        .expect("count rows")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
