//! Cursor benchmarks.
//!
//! Point searches, batch inserts inside one transaction, full scans and
//! checkpoints of a dirty tree, each on a file-backed and an in-memory
//! connection where that makes a difference.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use cellar_store::{Connection, Session};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

fn open(dir: &TempDir, in_memory: bool) -> Connection {
    let config = if in_memory { "create,cache_size=256MB,in_memory=true" } else { "create,cache_size=256MB" };
    Connection::open(dir.path(), config).expect("open connection")
}

/// Inserts `count` sequential keys in transactions of `batch_size`.
fn populate(session: &Session, count: usize, batch_size: usize) {
    let mut cursor = session.open_cursor("table:bench", "").expect("open cursor");
    for batch_start in (0..count).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(count);
        session.begin_transaction("").expect("begin");
        for i in batch_start..batch_end {
            cursor.set_key(format!("key-{i:08}"));
            cursor.set_value(format!("value-{i}"));
            cursor.insert().expect("insert");
        }
        session.commit_transaction("").expect("commit");
    }
}

// =============================================================================
// Searches
// =============================================================================

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor/search");
    group.throughput(Throughput::Elements(1));

    for count in [1_000, 10_000, 100_000] {
        let dir = TempDir::new().expect("create temp dir");
        let conn = open(&dir, false);
        let session = conn.open_session("").expect("open session");
        session.create("table:bench", "key_format=S,value_format=S").expect("create");
        populate(&session, count, 1000);
        session.checkpoint("").expect("checkpoint");

        let mut cursor = session.open_cursor("table:bench", "").expect("open cursor");
        group.bench_with_input(BenchmarkId::new("hit", format!("{}k", count / 1000)), &count, |b, &count| {
            let mut n = 0usize;
            b.iter(|| {
                n = (n + 7919) % count;
                cursor.set_key(format!("key-{n:08}"));
                black_box(cursor.search().is_ok())
            });
        });
        group.bench_with_input(BenchmarkId::new("miss", format!("{}k", count / 1000)), &count, |b, &count| {
            let mut n = 0usize;
            b.iter(|| {
                n = (n + 7919) % count;
                cursor.set_key(format!("key-{n:08}x"));
                black_box(cursor.search().is_ok())
            });
        });
    }

    group.finish();
}

// =============================================================================
// Inserts
// =============================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor/insert");

    for batch_size in [1, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        for in_memory in [false, true] {
            let label = if in_memory { "memory" } else { "file" };
            let dir = TempDir::new().expect("create temp dir");
            let conn = open(&dir, in_memory);
            let session = conn.open_session("").expect("open session");
            session.create("table:bench", "key_format=q,value_format=S").expect("create");
            let mut cursor = session.open_cursor("table:bench", "").expect("open cursor");
            let value = "v".repeat(100);

            group.bench_with_input(BenchmarkId::new(label, batch_size), &batch_size, |b, &batch_size| {
                let mut next = 0i64;
                b.iter(|| {
                    session.begin_transaction("").expect("begin");
                    for _ in 0..batch_size {
                        cursor.set_key(next);
                        cursor.set_value(value.as_str());
                        cursor.insert().expect("insert");
                        next += 1;
                    }
                    session.commit_transaction("").expect("commit");
                });
            });
        }
    }

    group.finish();
}

// =============================================================================
// Scans
// =============================================================================

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor/scan");

    let count = 10_000;
    let dir = TempDir::new().expect("create temp dir");
    let conn = open(&dir, false);
    let session = conn.open_session("").expect("open session");
    session.create("table:bench", "key_format=S,value_format=S").expect("create");
    populate(&session, count, 1000);
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function("in_memory_updates", |b| {
        b.iter(|| {
            let mut cursor = session.open_cursor("table:bench", "").expect("open cursor");
            let mut n = 0;
            while cursor.next().is_ok() {
                n += 1;
            }
            black_box(n)
        });
    });

    session.checkpoint("").expect("checkpoint");
    group.bench_function("checkpointed", |b| {
        b.iter(|| {
            let mut cursor = session.open_cursor("table:bench", "").expect("open cursor");
            let mut n = 0;
            while cursor.prev().is_ok() {
                n += 1;
            }
            black_box(n)
        });
    });

    group.finish();
}

// =============================================================================
// Checkpoints
// =============================================================================

fn bench_checkpoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint");

    let dir = TempDir::new().expect("create temp dir");
    let conn = open(&dir, false);
    let session = conn.open_session("").expect("open session");
    session.create("table:bench", "key_format=q,value_format=S").expect("create");
    let mut cursor = session.open_cursor("table:bench", "").expect("open cursor");
    let value = "c".repeat(200);

    group.bench_function("1k_dirty_keys", |b| {
        let mut round = 0i64;
        b.iter(|| {
            for key in 0..1000 {
                cursor.set_key(key);
                cursor.set_value(format!("{value}{round}"));
                cursor.insert().expect("insert");
            }
            round += 1;
            session.checkpoint("").expect("checkpoint");
        });
    });

    group.bench_function("idle", |b| {
        b.iter(|| session.checkpoint("").expect("checkpoint"));
    });

    group.finish();
}

criterion_group! {
    name = search_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_search
}

criterion_group! {
    name = write_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_insert
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_scan
}

criterion_group! {
    name = checkpoint_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(10);
    targets = bench_checkpoint
}

criterion_main!(search_benches, write_benches, scan_benches, checkpoint_benches);
