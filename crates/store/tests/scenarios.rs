//! End-to-end scenarios over the public API.
//!
//! Each test drives a connection the way an application would and checks
//! what readers at different timestamps observe:
//!
//! - snapshot reads, then rollback to stable
//! - readers meeting a prepared transaction
//! - fast truncation of whole pages, racing writers and failing midway
//! - a disaggregated follower catching up with its leader
//! - a write-write conflict after the page was pushed out of the cache

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use cellar_store::{Connection, Error, Session, Stat};
use cellar_test_utils::{TestConnConfig, TestDir};

/// Writes `value` to keys `1..=rows` in one transaction committed at `ts`.
fn write_all(session: &Session, rows: i64, value: &str, ts: u64) {
    session.begin_transaction("").unwrap();
    let mut c = session.open_cursor("table:t", "").unwrap();
    for key in 1..=rows {
        c.set_key(key);
        c.set_value(value);
        c.insert().unwrap();
    }
    session.commit_transaction(&format!("commit_timestamp={ts:x}")).unwrap();
}

/// Every (key, value) of `uri` visible at `ts`.
fn read_all_at(session: &Session, uri: &str, ts: u64) -> Vec<(i64, String)> {
    session.begin_transaction(&format!("read_timestamp={ts:x}")).unwrap();
    let mut c = session.open_cursor(uri, "").unwrap();
    let mut rows = Vec::new();
    loop {
        match c.next() {
            Ok(()) => rows.push((
                c.get_key().unwrap().as_i64().unwrap(),
                c.get_value().unwrap().as_str().unwrap().to_string(),
            )),
            Err(e) if e.is_not_found() => break,
            Err(e) => panic!("next failed: {e}"),
        }
    }
    drop(c);
    session.rollback_transaction("").unwrap();
    rows
}

/// Number of rows visible to an autocommit read of `uri`.
fn count(session: &Session, uri: &str) -> usize {
    let mut c = session.open_cursor(uri, "").unwrap();
    let mut n = 0;
    while c.next().is_ok() {
        n += 1;
    }
    n
}

// ============================================================================
// Snapshot reads and rollback to stable
// ============================================================================

#[test]
fn test_snapshot_reads_and_rollback_to_stable() {
    let dir = TestDir::new();
    // Large enough that nothing is evicted: every rolled-back update stays in memory.
    let config = TestConnConfig::builder().cache_size("1GB").build().render();
    let conn = Connection::open(dir.home(), &config).unwrap();
    let session = conn.open_session("").unwrap();
    session.create("table:t", "key_format=q,value_format=S").unwrap();
    conn.set_timestamp("oldest_timestamp=1,stable_timestamp=1").unwrap();

    for (value, ts) in [("a", 20u64), ("b", 30), ("c", 40), ("d", 50)] {
        write_all(&session, 1000, &value.repeat(500), ts);
    }

    conn.set_timestamp(&format!("stable_timestamp={:x}", 35)).unwrap();
    session.checkpoint("").unwrap();

    let rts_calls = conn.stat(Stat::TxnRts);
    let stats = conn.rollback_to_stable("").unwrap();
    assert_eq!(conn.stat(Stat::TxnRts), rts_calls + 1);
    assert!(conn.stat(Stat::TxnRtsUpdAborted) + conn.stat(Stat::TxnRtsHsRemoved) >= 2000);
    assert!(stats.upd_aborted + stats.hs_removed >= 2000);

    for (ts, expected) in [(20u64, "a"), (30, "b"), (35, "b"), (60, "b")] {
        let rows = read_all_at(&session, "table:t", ts);
        assert_eq!(rows.len(), 1000, "row count at {ts}");
        let want = expected.repeat(500);
        assert!(rows.iter().all(|(_, v)| *v == want), "values at {ts}");
    }
}

#[test]
fn test_rollback_to_stable_restores_evicted_history() {
    let dir = TestDir::new();
    // Every commit pushes its pages out: older versions live in the history store.
    let config = TestConnConfig::builder().cache_size("1GB").extra("debug_mode=(eviction=true)").build().render();
    let conn = Connection::open(dir.home(), &config).unwrap();
    let session = conn.open_session("").unwrap();
    session.create("table:t", "key_format=q,value_format=S").unwrap();
    conn.set_timestamp("oldest_timestamp=1,stable_timestamp=1").unwrap();

    for (value, ts) in [("a", 20u64), ("b", 30), ("c", 40), ("d", 50)] {
        write_all(&session, 1000, &value.repeat(500), ts);
    }
    conn.set_timestamp(&format!("stable_timestamp={:x}", 35)).unwrap();
    session.checkpoint("").unwrap();

    let stats = conn.rollback_to_stable("").unwrap();
    assert!(stats.hs_removed + stats.keys_restored > 0, "history untouched: {stats:?}");

    for (ts, expected) in [(20u64, "a"), (30, "b"), (60, "b")] {
        let rows = read_all_at(&session, "table:t", ts);
        assert_eq!(rows.len(), 1000, "row count at {ts}");
        let want = expected.repeat(500);
        assert!(rows.iter().all(|(_, v)| *v == want), "values at {ts}");
    }
}

// ============================================================================
// Prepared transactions
// ============================================================================

#[test]
fn test_prepared_update_conflicts_until_resolved() {
    let dir = TestDir::new();
    let conn = Connection::open(dir.home(), &TestConnConfig::builder().build().render()).unwrap();
    let session = conn.open_session("").unwrap();
    session.create("table:t", "key_format=q,value_format=q").unwrap();

    session.begin_transaction("").unwrap();
    let mut c = session.open_cursor("table:t", "").unwrap();
    c.set_key(1i64);
    c.set_value(1i64);
    c.insert().unwrap();
    session.commit_transaction(&format!("commit_timestamp={:x}", 100)).unwrap();
    conn.set_timestamp(&format!("stable_timestamp={:x}", 100)).unwrap();

    let writer = conn.open_session("").unwrap();
    writer.begin_transaction("").unwrap();
    let mut w = writer.open_cursor("table:t", "").unwrap();
    w.set_key(1i64);
    w.set_value(2i64);
    w.update().unwrap();
    writer.prepare_transaction(&format!("prepare_timestamp={:x}", 200)).unwrap();

    let reader = conn.open_session("").unwrap();
    reader.begin_transaction(&format!("read_timestamp={:x}", 250)).unwrap();
    let mut r = reader.open_cursor("table:t", "").unwrap();
    r.set_key(1i64);
    assert!(matches!(r.search(), Err(Error::PrepareConflict)));
    drop(r);
    reader.rollback_transaction("").unwrap();

    reader.begin_transaction(&format!("read_timestamp={:x},ignore_prepare=true", 250)).unwrap();
    let mut r = reader.open_cursor("table:t", "").unwrap();
    r.set_key(1i64);
    r.search().unwrap();
    assert_eq!(r.get_value().unwrap().as_i64(), Some(1));
    drop(r);
    reader.rollback_transaction("").unwrap();

    drop(w);
    writer
        .commit_transaction(&format!("commit_timestamp={:x},durable_timestamp={:x}", 300, 310))
        .unwrap();

    reader.begin_transaction(&format!("read_timestamp={:x}", 310)).unwrap();
    let mut r = reader.open_cursor("table:t", "").unwrap();
    r.set_key(1i64);
    r.search().unwrap();
    assert_eq!(r.get_value().unwrap().as_i64(), Some(2));
    drop(r);
    reader.rollback_transaction("").unwrap();

    // Before the prepare timestamp the old value is still the answer.
    reader.begin_transaction(&format!("read_timestamp={:x}", 150)).unwrap();
    let mut r = reader.open_cursor("table:t", "").unwrap();
    r.set_key(1i64);
    r.search().unwrap();
    assert_eq!(r.get_value().unwrap().as_i64(), Some(1));
}

#[test]
fn test_prepared_rollback_restores_previous_value() {
    let dir = TestDir::new();
    let conn = Connection::open(dir.home(), &TestConnConfig::builder().build().render()).unwrap();
    let session = conn.open_session("").unwrap();
    session.create("table:t", "key_format=q,value_format=S").unwrap();
    write_all(&session, 3, "old", 10);
    conn.set_timestamp("stable_timestamp=a").unwrap();

    session.begin_transaction("").unwrap();
    let mut c = session.open_cursor("table:t", "").unwrap();
    c.set_key(2i64);
    c.remove().unwrap();
    session.prepare_transaction("prepare_timestamp=14").unwrap();
    drop(c);
    session.rollback_transaction("").unwrap();

    let rows = read_all_at(&session, "table:t", 0x30);
    assert_eq!(rows.len(), 3);
}

// ============================================================================
// Fast truncate
// ============================================================================

#[test]
fn test_fast_truncate_removes_whole_pages() {
    let dir = TestDir::new();
    let home = dir.home();
    {
        let conn = Connection::open(&home, &TestConnConfig::builder().build().render()).unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S,leaf_page_max=4KB").unwrap();
        conn.set_timestamp("oldest_timestamp=1,stable_timestamp=1").unwrap();
        write_all(&session, 10_000, &"v".repeat(50), 10);
        conn.set_timestamp(&format!("stable_timestamp={:x}", 10)).unwrap();
        conn.close("").unwrap();
    }

    // Reopened pages are clean: whole pages are eligible for one marker.
    let conn = Connection::open(&home, "statistics=(fast)").unwrap();
    let session = conn.open_session("").unwrap();
    let size_before = TestDir::file_size(&home, "t.cdb");

    session.begin_transaction("").unwrap();
    session.timestamp_transaction(&format!("commit_timestamp={:x}", 20)).unwrap();
    let mut start = session.open_cursor("table:t", "").unwrap();
    start.set_key(1i64);
    let mut stop = session.open_cursor("table:t", "").unwrap();
    stop.set_key(5000i64);
    let outcome = session.truncate(None, Some(&start), Some(&stop), "").unwrap();
    drop(start);
    drop(stop);
    session.commit_transaction("").unwrap();
    assert!(outcome.fast_pages > 0);
    // Keys on marked pages take no tombstone of their own.
    assert!(outcome.keys < 5000, "{outcome:?}");

    assert_eq!(read_all_at(&session, "table:t", 15).len(), 10_000);
    let after = read_all_at(&session, "table:t", 20);
    assert_eq!(after.len(), 5_000);
    assert_eq!(after.first().map(|(k, _)| *k), Some(5001));

    conn.set_timestamp(&format!("stable_timestamp={:x}", 20)).unwrap();
    session.checkpoint("").unwrap();
    assert!(conn.stat(Stat::RecPageDeleteFast) > 0);

    // Once nobody can read before the truncate the pages go for good.
    conn.set_timestamp(&format!("stable_timestamp={:x},oldest_timestamp={:x}", 21, 21)).unwrap();
    session.checkpoint("").unwrap();
    session.checkpoint("").unwrap();
    let compacted = session.compact(Some("table:t"), "").unwrap();
    let size_after = TestDir::file_size(&home, "t.cdb");
    assert!(size_after <= size_before);
    assert!(compacted.files <= 1);
    assert_eq!(count(&session, "table:t"), 5_000);
}

/// Creates `table:t` holding `keys` at ts 10, then reopens so every page is
/// clean and eligible for a truncate marker.
fn reopened_table(home: &std::path::Path, keys: impl Iterator<Item = i64>) -> Connection {
    {
        let conn = Connection::open(home, &TestConnConfig::builder().build().render()).unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S,leaf_page_max=4KB").unwrap();
        conn.set_timestamp("oldest_timestamp=1,stable_timestamp=1").unwrap();
        session.begin_transaction("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for key in keys {
            c.set_key(key);
            c.set_value("v".repeat(50));
            c.insert().unwrap();
        }
        drop(c);
        session.commit_transaction(&format!("commit_timestamp={:x}", 10)).unwrap();
        conn.set_timestamp(&format!("stable_timestamp={:x}", 10)).unwrap();
        conn.close("").unwrap();
    }
    Connection::open(home, "statistics=(fast)").unwrap()
}

/// Truncates `[lower, upper]` of `table:t` inside the session's running transaction.
fn truncate_range(session: &Session, lower: i64, upper: i64) -> Result<cellar_store::TruncateOutcome, Error> {
    let mut start = session.open_cursor("table:t", "").unwrap();
    start.set_key(lower);
    let mut stop = session.open_cursor("table:t", "").unwrap();
    stop.set_key(upper);
    session.truncate(None, Some(&start), Some(&stop), "")
}

#[test]
fn test_truncate_keeps_concurrent_uncommitted_insert() {
    let dir = TestDir::new();
    let home = dir.home();
    let conn = reopened_table(&home, (1..=5000).map(|k| k * 2));

    // An uncommitted insert inside the range, made before the truncate.
    let early = conn.open_session("").unwrap();
    early.begin_transaction("").unwrap();
    let mut c = early.open_cursor("table:t", "").unwrap();
    c.set_key(101i64);
    c.set_value("early");
    c.insert().unwrap();
    drop(c);

    let session = conn.open_session("").unwrap();
    session.begin_transaction("").unwrap();
    session.timestamp_transaction(&format!("commit_timestamp={:x}", 20)).unwrap();
    let outcome = truncate_range(&session, 1, 5000).unwrap();
    assert!(outcome.fast_pages > 0);

    // A page already carrying the uncommitted marker refuses new keys.
    let late = conn.open_session("").unwrap();
    late.begin_transaction("").unwrap();
    let mut c = late.open_cursor("table:t", "").unwrap();
    c.set_key(3001i64);
    c.set_value("late");
    assert!(c.insert().unwrap_err().is_rollback());
    drop(c);
    late.rollback_transaction("").unwrap();

    session.commit_transaction("").unwrap();
    early.commit_transaction(&format!("commit_timestamp={:x}", 25)).unwrap();

    let rows = read_all_at(&session, "table:t", 30);
    assert_eq!(rows.len(), 2501);
    assert_eq!(rows.first(), Some(&(101, "early".to_string())));
    assert_eq!(rows.get(1).map(|(k, _)| *k), Some(5002));
}

#[test]
fn test_failed_truncate_rolls_back_every_page() {
    let dir = TestDir::new();
    let home = dir.home();
    {
        let conn = reopened_table(&home, 1..=2000);
        let blocker = conn.open_session("").unwrap();
        blocker.begin_transaction("").unwrap();
        let mut c = blocker.open_cursor("table:t", "").unwrap();
        c.set_key(1900i64);
        c.set_value("blocker");
        c.update().unwrap();
        drop(c);

        // Whole pages below the blocked key are marked before the conflict.
        let session = conn.open_session("").unwrap();
        session.begin_transaction("").unwrap();
        let err = truncate_range(&session, 1, 1950).unwrap_err();
        assert!(err.is_rollback(), "expected rollback, got {err}");
        session.rollback_transaction("").unwrap();
        blocker.rollback_transaction("").unwrap();

        assert_eq!(count(&session, "table:t"), 2000);
        session.checkpoint("").unwrap();
        conn.close("").unwrap();
    }

    let conn = Connection::open(&home, "").unwrap();
    let session = conn.open_session("").unwrap();
    assert_eq!(count(&session, "table:t"), 2000);
    let rows = read_all_at(&session, "table:t", 10);
    assert!(rows.iter().map(|(k, _)| *k).eq(1..=2000));
}

// ============================================================================
// Disaggregated storage
// ============================================================================

fn disagg_config(page_log: &std::path::Path, role: &str) -> String {
    format!("create,statistics=(fast),disaggregated=(page_log=\"{}\",role={role})", page_log.display())
}

#[test]
fn test_follower_catches_up_with_leader() {
    let dir = TestDir::new();
    let page_log = dir.subdir("page_log");

    let leader = Connection::open(dir.join("leader"), &disagg_config(&page_log, "leader")).unwrap();
    let ls = leader.open_session("").unwrap();
    ls.create("layered:t", "key_format=S,value_format=S").unwrap();
    ls.checkpoint("").unwrap();

    let follower = Connection::open(dir.join("follower"), &disagg_config(&page_log, "follower")).unwrap();
    let fs = follower.open_session("").unwrap();
    assert_eq!(count(&fs, "layered:t"), 0);

    let mut c = ls.open_cursor("layered:t", "").unwrap();
    for i in 0..1000 {
        c.set_key(format!("key{i:04}"));
        c.set_value(format!("value{i}"));
        c.insert().unwrap();
    }
    drop(c);
    ls.checkpoint("").unwrap();

    // Nothing moves until the follower asks.
    assert_eq!(count(&fs, "layered:t"), 0);
    let loaded = follower.advance_checkpoint().unwrap();
    assert!(loaded > 0);
    assert_eq!(count(&fs, "layered:t"), 1000);

    // Local writes land in the follower's ingest tree and read back at once.
    let mut c = fs.open_cursor("layered:t", "").unwrap();
    c.set_key("local");
    c.set_value("ingest");
    c.insert().unwrap();
    c.set_key("local");
    c.search().unwrap();
    assert_eq!(c.get_value().unwrap().as_str(), Some("ingest"));
    drop(c);
    assert_eq!(count(&fs, "layered:t"), 1001);
    assert_eq!(count(&ls, "layered:t"), 1000);

    assert!(leader.advance_checkpoint().is_err());
}

#[test]
fn test_idle_leader_checkpoint_writes_no_deltas() {
    let dir = TestDir::new();
    let page_log = dir.subdir("page_log");
    let leader = Connection::open(dir.join("leader"), &disagg_config(&page_log, "leader")).unwrap();
    let session = leader.open_session("").unwrap();
    session.create("layered:t", "key_format=S,value_format=S").unwrap();

    let mut c = session.open_cursor("layered:t", "").unwrap();
    for i in 0..200 {
        c.set_key(format!("key{i:03}"));
        c.set_value("first");
        c.insert().unwrap();
    }
    session.checkpoint("").unwrap();
    for i in 0..10 {
        c.set_key(format!("key{i:03}"));
        c.set_value("second");
        c.update().unwrap();
    }
    drop(c);
    session.checkpoint("").unwrap();

    let deltas = leader.stat(Stat::RecPageDeltaLeaf);
    session.checkpoint("").unwrap();
    assert_eq!(leader.stat(Stat::RecPageDeltaLeaf), deltas);
}

// ============================================================================
// Write-write conflicts
// ============================================================================

#[test]
fn test_write_conflict_after_eviction_rolls_back() {
    let dir = TestDir::new();
    let config = TestConnConfig::builder().extra("debug_mode=(eviction=true)").build().render();
    let conn = Connection::open(dir.home(), &config).unwrap();
    let setup = conn.open_session("").unwrap();
    setup.create("table:t", "key_format=q,value_format=S").unwrap();
    conn.set_timestamp("oldest_timestamp=1,stable_timestamp=1").unwrap();
    write_all(&setup, 1, "v0", 10);

    let t1 = conn.open_session("").unwrap();
    t1.begin_transaction(&format!("read_timestamp={:x}", 25)).unwrap();
    let mut c1 = t1.open_cursor("table:t", "").unwrap();
    c1.set_key(1i64);
    c1.search().unwrap();
    assert_eq!(c1.get_value().unwrap().as_str(), Some("v0"));

    // A second writer commits later; committing releases the page.
    let t2 = conn.open_session("").unwrap();
    t2.begin_transaction("").unwrap();
    let mut c2 = t2.open_cursor("table:t", "").unwrap();
    c2.set_key(1i64);
    c2.set_value("v2");
    c2.update().unwrap();
    drop(c2);
    t2.commit_transaction(&format!("commit_timestamp={:x}", 50)).unwrap();

    t1.timestamp_transaction(&format!("commit_timestamp={:x}", 30)).unwrap();
    c1.set_key(1i64);
    c1.set_value("v1");
    let err = c1.update().unwrap_err();
    assert!(err.is_rollback(), "expected rollback, got {err}");

    // The transaction is doomed: commit reports the rollback too.
    drop(c1);
    assert!(t1.commit_transaction("").unwrap_err().is_rollback());

    let rows = read_all_at(&setup, "table:t", 60);
    assert_eq!(rows, vec![(1, "v2".to_string())]);
}
