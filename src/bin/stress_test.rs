//! revstore Stress Test Binary
//!
//! A standalone binary for stress testing revstore under high concurrency.
//! Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! This is separate from the regular test suite because:
//! 1. It can take a long time to run
//! 2. It's configurable via command-line arguments
//! 3. It reports detailed metrics
//!
//! # Examples
//!
//! ```bash
//! # Default test: 100 keys, 1000 writes, 10 concurrent tasks
//! cargo run --release --bin stress_test
//!
//! # High concurrency test
//! cargo run --release --bin stress_test -- --keys 500 --writes 10000 --concurrency 50
//!
//! # Same-key contention with compare-and-swap retries
//! cargo run --release --bin stress_test -- --cas --writes 1000 --concurrency 20
//! ```
//!
//! Set `RUST_LOG=revstore=debug` to see every committed mutation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use revstore::{KeyPattern, RevStore, Revision, StoreConfig};
use tracing_subscriber::EnvFilter;

/// Stress test configuration
struct Config {
    /// Number of unique keys to write to
    num_keys: usize,
    /// Total number of writes
    num_writes: usize,
    /// Number of concurrent writer tasks
    concurrency: usize,
    /// All tasks update one key with compare-and-swap
    cas: bool,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_keys: 100,
            num_writes: 1000,
            concurrency: 10,
            cas: false,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--keys" | "-k" => {
                i += 1;
                config.num_keys = args[i].parse().expect("Invalid --keys value");
            }
            "--writes" | "-w" => {
                i += 1;
                config.num_writes = args[i].parse().expect("Invalid --writes value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("Invalid --concurrency value");
            }
            "--cas" => {
                config.cas = true;
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"revstore Stress Test

Usage: stress_test [OPTIONS]

Options:
  -k, --keys <N>        Number of unique keys (default: 100)
  -w, --writes <N>      Total writes (default: 1000)
  -c, --concurrency <N> Concurrent writer tasks (default: 10)
  --cas                 Same-key contention with compare-and-swap
  -d, --db <PATH>       Database path (default: temp file)
  -h, --help            Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

/// Writes one value, retrying on a lost compare-and-swap race.
async fn cas_put(store: &RevStore, key: &str, value: Vec<u8>, conflicts: &AtomicU64) {
    loop {
        let expected = match store.get(key).await.expect("read current value") {
            Some(current) => current.revision,
            None => Revision::NONE,
        };
        match store.put(key, value.clone(), expected, 0).await {
            Ok(_) => return,
            Err(e) if e.is_conflict() => {
                conflicts.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => panic!("cas put failed: {e}"),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = parse_args();

    println!("revstore Stress Test");
    println!("====================");
    println!("Keys:        {}", config.num_keys);
    println!("Writes:      {}", config.num_writes);
    println!("Concurrency: {}", config.concurrency);
    println!(
        "Mode:        {}",
        if config.cas {
            "Same-key compare-and-swap"
        } else {
            "Multi-key"
        }
    );
    println!();

    // Setup database
    let temp_dir = std::env::temp_dir().join(format!("revstore-stress-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("stress.db").to_string_lossy().to_string());

    println!("Database:    {}", db_path);
    println!();

    let store = RevStore::open_with_config(&db_path, StoreConfig::from_env().expect("config"))
        .await
        .expect("open store");
    let start_revision = store.current_revision();

    // Count what the change feed delivers while the writers run.
    let mut feed = store.subscribe().expect("subscribe");
    let delivered = Arc::new(AtomicU64::new(0));
    let feed_task = tokio::spawn({
        let delivered = delivered.clone();
        async move {
            let mut last = start_revision;
            while let Some(record) = feed.next().await {
                assert!(
                    record.revision > last,
                    "feed out of order: {} after {}",
                    record.revision,
                    last
                );
                last = record.revision;
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    // Metrics
    let writes_done = Arc::new(AtomicU64::new(0));
    let conflicts = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    println!("Starting stress test...");
    let start = Instant::now();

    let mut handles = Vec::new();
    let writes_per_task = config.num_writes / config.concurrency;

    for task_id in 0..config.concurrency {
        let store = store.clone();
        let writes_done = writes_done.clone();
        let conflicts = conflicts.clone();
        let errors = errors.clone();
        let num_keys = config.num_keys;
        let cas = config.cas;

        let handle = tokio::spawn(async move {
            for i in 0..writes_per_task {
                let value = format!("stress-{}-{}", task_id, i).into_bytes();

                if cas {
                    cas_put(&store, "stress/contended", value, &conflicts).await;
                    writes_done.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let key = format!("stress/key-{}", (task_id * writes_per_task + i) % num_keys);
                match store.put(key, value, Revision::NONE, 0).await {
                    Ok(_) => {
                        writes_done.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        eprintln!("put failed: {e}");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });
        handles.push(handle);
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = start.elapsed();

    let written = writes_done.load(Ordering::Relaxed);
    let conflict_count = conflicts.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Writes:          {}", written);
    println!("CAS retries:     {}", conflict_count);
    println!("Errors:          {}", error_count);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} writes/sec",
        written as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");

    let end_revision = store.current_revision();
    assert_eq!(
        (end_revision.as_raw() - start_revision.as_raw()) as u64,
        written,
        "revision advanced by {} for {} writes",
        end_revision.as_raw() - start_revision.as_raw(),
        written
    );
    println!("  Revisions:         one per accepted write ✓");

    // Every key's chain: versions step by one, old_revision links back.
    let history = store
        .replay(KeyPattern::prefix("stress/"), Revision::NONE)
        .await
        .expect("replay");
    let mut heads: HashMap<&str, (i64, Revision, Revision)> = HashMap::new();
    let mut last = Revision::NONE;
    for record in history.iter().filter(|r| r.revision > start_revision) {
        assert!(record.revision > last, "history out of order");
        last = record.revision;

        if let Some((version, revision, create)) = heads.get(record.key.as_str()) {
            assert_eq!(record.version, version + 1, "version gap on {}", record.key);
            assert_eq!(record.old_revision, *revision, "broken link on {}", record.key);
            assert_eq!(record.create_revision, *create, "create_revision moved on {}", record.key);
        }
        heads.insert(
            record.key.as_str(),
            (record.version, record.revision, record.create_revision),
        );
    }
    println!("  Key chains:        intact across {} keys ✓", heads.len());

    // Closing ends the feed, so let it catch up first.
    let deadline = Instant::now() + Duration::from_secs(10);
    while delivered.load(Ordering::Relaxed) < written && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    store.close().await;
    feed_task.await.unwrap();

    let delivered = delivered.load(Ordering::Relaxed);
    assert_eq!(delivered, written, "feed delivered {} of {}", delivered, written);
    println!("  Change feed:       {} records, in order ✓", delivered);

    println!();
    println!("Stress test PASSED ✓");
}
