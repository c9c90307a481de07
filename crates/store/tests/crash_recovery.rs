//! Crash recovery tests for the metadata commit protocol and the log.
//!
//! A checkpoint becomes durable with one metadata commit:
//!
//! ```text
//! commit():
//!   1. Write the image blob                ← MetaStep::BlobWrite
//!   2. Write the secondary header slot     ← MetaStep::HeaderWrite #0
//!   3. SYNC (first)                        ← MetaStep::Sync #0
//!   4. Write the header with the god byte  ← MetaStep::HeaderWrite #1
//!   5. SYNC (second)                       ← MetaStep::Sync #1
//! ```
//!
//! Crashing before step 4 must leave the previous checkpoint; crashing at
//! step 5 finds the new one. Dropping a [`Connection`] without closing it
//! stands in for the process dying.

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::{path::Path, sync::Arc};

use cellar_store::{Connection, Error, MetaStep, Session};
use cellar_test_utils::{CrashInjector, TestConnConfig, TestDir};

fn insert_range(session: &Session, keys: std::ops::Range<i64>, value: &str) {
    let mut c = session.open_cursor("table:t", "").unwrap();
    for key in keys {
        c.set_key(key);
        c.set_value(value);
        c.insert().unwrap();
    }
}

fn count(conn: &Connection) -> usize {
    let session = conn.open_session("").unwrap();
    let mut c = session.open_cursor("table:t", "").unwrap();
    let mut n = 0;
    while c.next().is_ok() {
        n += 1;
    }
    n
}

/// Checkpoints 100 rows, writes 100 more and crashes the second
/// checkpoint at `step`/`occurrence`. Returns the rows seen after reopening.
fn crash_second_checkpoint(home: &Path, step: MetaStep, occurrence: u32) -> (bool, usize) {
    let config = TestConnConfig::builder().build().render();
    let injector = CrashInjector::new(step, occurrence);
    {
        let conn = Connection::open(home, &config).unwrap();
        let hook = injector.clone();
        conn.set_meta_hook(Some(Arc::new(move |s| hook.on_step(s))));
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        insert_range(&session, 0..100, "first");
        session.checkpoint("").unwrap();

        insert_range(&session, 100..200, "second");
        injector.arm();
        let result = session.checkpoint("");
        if injector.has_crashed() {
            assert!(matches!(result, Err(Error::Io { .. })), "crash should surface as an I/O error");
        }
        // No close: the process "dies" here.
    }
    let conn = Connection::open(home, "").unwrap();
    (injector.has_crashed(), count(&conn))
}

#[test]
fn test_crash_before_any_header_write_keeps_old_checkpoint() {
    let dir = TestDir::new();
    let (crashed, rows) = crash_second_checkpoint(&dir.home(), MetaStep::BlobWrite, 0);
    assert!(crashed);
    assert_eq!(rows, 100);
}

#[test]
fn test_crash_at_secondary_slot_keeps_old_checkpoint() {
    let dir = TestDir::new();
    let (crashed, rows) = crash_second_checkpoint(&dir.home(), MetaStep::HeaderWrite, 0);
    assert!(crashed);
    assert_eq!(rows, 100);
}

#[test]
fn test_crash_before_first_sync_keeps_old_checkpoint() {
    let dir = TestDir::new();
    let (crashed, rows) = crash_second_checkpoint(&dir.home(), MetaStep::Sync, 0);
    assert!(crashed);
    assert_eq!(rows, 100);
}

#[test]
fn test_crash_at_god_byte_flip_keeps_old_checkpoint() {
    let dir = TestDir::new();
    let (crashed, rows) = crash_second_checkpoint(&dir.home(), MetaStep::HeaderWrite, 1);
    assert!(crashed);
    assert_eq!(rows, 100);
}

#[test]
fn test_crash_before_second_sync_finds_new_checkpoint() {
    let dir = TestDir::new();
    let (crashed, rows) = crash_second_checkpoint(&dir.home(), MetaStep::Sync, 1);
    assert!(crashed);
    assert_eq!(rows, 200);
}

#[test]
fn test_unlucky_steps_never_lose_the_first_checkpoint() {
    for (step, occurrence) in
        [(MetaStep::BlobWrite, 0), (MetaStep::HeaderWrite, 0), (MetaStep::Sync, 0), (MetaStep::HeaderWrite, 1)]
    {
        let dir = TestDir::new();
        let (_, rows) = crash_second_checkpoint(&dir.home(), step, occurrence);
        assert!(rows == 100 || rows == 200, "{step:?} #{occurrence}: {rows} rows");
    }
}

#[test]
fn test_reopen_after_crash_can_checkpoint_again() {
    let dir = TestDir::new();
    let home = dir.home();
    let (_, rows) = crash_second_checkpoint(&home, MetaStep::HeaderWrite, 1);
    assert_eq!(rows, 100);

    let conn = Connection::open(&home, "").unwrap();
    let session = conn.open_session("").unwrap();
    insert_range(&session, 100..150, "third");
    session.checkpoint("").unwrap();
    drop(session);
    conn.close("").unwrap();

    let conn = Connection::open(&home, "").unwrap();
    assert_eq!(count(&conn), 150);
}

// ============================================================================
// Log recovery
// ============================================================================

#[test]
fn test_logged_writes_survive_a_crash() {
    let dir = TestDir::new();
    let home = dir.home();
    let config = TestConnConfig::builder().log(true).build().render();
    {
        let conn = Connection::open(&home, &config).unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        insert_range(&session, 0..50, "checkpointed");
        session.checkpoint("").unwrap();
        insert_range(&session, 50..120, "logged");
        session.log_flush("sync=on").unwrap();
    }

    let conn = Connection::open(&home, "log=(enabled=true)").unwrap();
    assert_eq!(count(&conn), 120);
    let session = conn.open_session("").unwrap();
    let mut c = session.open_cursor("table:t", "").unwrap();
    c.set_key(119i64);
    c.search().unwrap();
    assert_eq!(c.get_value().unwrap().as_str(), Some("logged"));
}

#[test]
fn test_recover_error_refuses_an_unclean_home() {
    let dir = TestDir::new();
    let home = dir.home();
    {
        let conn = Connection::open(&home, &TestConnConfig::builder().log(true).build().render()).unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        insert_range(&session, 0..10, "x");
    }

    let err = Connection::open(&home, "log=(enabled=true,recover=error)").unwrap_err();
    assert!(matches!(err, Error::RunRecovery), "got {err}");

    // Ordinary recovery still works afterwards.
    let conn = Connection::open(&home, "log=(enabled=true)").unwrap();
    assert_eq!(count(&conn), 10);
}

#[test]
fn test_clean_close_opens_with_recover_error() {
    let dir = TestDir::new();
    let home = dir.home();
    let conn = Connection::open(&home, &TestConnConfig::builder().log(true).build().render()).unwrap();
    let session = conn.open_session("").unwrap();
    session.create("table:t", "key_format=q,value_format=S").unwrap();
    insert_range(&session, 0..10, "x");
    drop(session);
    conn.close("").unwrap();

    let conn = Connection::open(&home, "log=(enabled=true,recover=error)").unwrap();
    assert_eq!(count(&conn), 10);
}

// ============================================================================
// Prepared transactions across a crash
// ============================================================================

#[test]
fn test_prepared_transaction_is_claimed_after_restart() {
    let dir = TestDir::new();
    let home = dir.home();
    let config = TestConnConfig::builder().extra("preserve_prepared=true").build().render();
    {
        let conn = Connection::open(&home, &config).unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        conn.set_timestamp("oldest_timestamp=1").unwrap();

        session.begin_transaction("").unwrap();
        insert_range(&session, 1..2, "base");
        session.commit_transaction("commit_timestamp=a").unwrap();
        conn.set_timestamp("stable_timestamp=a").unwrap();

        session.begin_transaction("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1i64);
        c.set_value("prepared");
        c.update().unwrap();
        drop(c);
        session.prepare_transaction("prepare_timestamp=14,prepared_id=7").unwrap();

        conn.set_timestamp("stable_timestamp=19").unwrap();
        let checkpointer = conn.open_session("").unwrap();
        checkpointer.checkpoint("").unwrap();
    }

    let conn = Connection::open(&home, "preserve_prepared=true").unwrap();
    let session = conn.open_session("").unwrap();
    {
        let mut discover = session.open_cursor("prepared_discover:", "").unwrap();
        discover.next().unwrap();
        assert_eq!(discover.get_key().unwrap().as_u64(), Some(7));
        assert!(discover.next().unwrap_err().is_not_found());
    }

    session.begin_transaction("claim_prepared=7").unwrap();
    session.commit_transaction("commit_timestamp=1e,durable_timestamp=1e").unwrap();

    session.begin_transaction("read_timestamp=1e").unwrap();
    let mut c = session.open_cursor("table:t", "").unwrap();
    c.set_key(1i64);
    c.search().unwrap();
    assert_eq!(c.get_value().unwrap().as_str(), Some("prepared"));
    drop(c);
    session.rollback_transaction("").unwrap();

    let mut discover = session.open_cursor("prepared_discover:", "").unwrap();
    assert!(discover.next().unwrap_err().is_not_found());
}

#[test]
fn test_prepared_transaction_rolls_back_without_preserve() {
    let dir = TestDir::new();
    let home = dir.home();
    {
        let conn = Connection::open(&home, &TestConnConfig::builder().build().render()).unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        conn.set_timestamp("oldest_timestamp=1").unwrap();

        session.begin_transaction("").unwrap();
        insert_range(&session, 1..2, "base");
        session.commit_transaction("commit_timestamp=a").unwrap();

        session.begin_transaction("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1i64);
        c.set_value("prepared");
        c.update().unwrap();
        drop(c);
        session.prepare_transaction("prepare_timestamp=14,prepared_id=7").unwrap();

        conn.set_timestamp("stable_timestamp=19").unwrap();
        conn.open_session("").unwrap().checkpoint("").unwrap();
    }

    let conn = Connection::open(&home, "").unwrap();
    let session = conn.open_session("").unwrap();
    let mut discover = session.open_cursor("prepared_discover:", "").unwrap();
    assert!(discover.next().unwrap_err().is_not_found());

    let mut c = session.open_cursor("table:t", "").unwrap();
    c.set_key(1i64);
    c.search().unwrap();
    assert_eq!(c.get_value().unwrap().as_str(), Some("base"));
}
