//! Property tests for snapshot reads at a timestamp.
//!
//! A reader at timestamp `t` must see, for every key, the value written by
//! the newest commit at or before `t`, whether the versions sit in memory,
//! on disk or in the history store.

// Test code is allowed to use unwrap for simplicity
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::collections::BTreeMap;

use cellar_store::{Connection, Session};
use cellar_test_utils::{
    TestConnConfig, TestDir,
    strategies::{Commit, arb_history, expected_at},
};
use proptest::prelude::*;

fn apply(session: &Session, history: &[Commit]) {
    let mut c = session.open_cursor("table:t", "").unwrap();
    for commit in history {
        session.begin_transaction("").unwrap();
        for w in &commit.writes {
            c.set_key(w.key);
            match &w.value {
                Some(v) => {
                    c.set_value(v.as_str());
                    c.insert().unwrap();
                },
                None => match c.remove() {
                    Ok(()) => {},
                    Err(e) if e.is_not_found() => {},
                    Err(e) => panic!("remove failed: {e}"),
                },
            }
        }
        session.commit_transaction(&format!("commit_timestamp={:x}", commit.ts)).unwrap();
    }
}

fn snapshot(session: &Session, read_ts: u64) -> BTreeMap<u64, String> {
    session.begin_transaction(&format!("read_timestamp={read_ts:x}")).unwrap();
    let mut c = session.open_cursor("table:t", "").unwrap();
    let mut rows = BTreeMap::new();
    while c.next().is_ok() {
        let key = c.get_key().unwrap().as_u64().unwrap();
        let value = c.get_value().unwrap().as_str().unwrap().to_string();
        rows.insert(key, value);
    }
    drop(c);
    session.rollback_transaction("").unwrap();
    rows
}

/// Read timestamps worth checking: each commit, and just before it.
fn read_points(history: &[Commit]) -> Vec<u64> {
    let mut points = vec![9];
    for commit in history {
        points.push(commit.ts - 1);
        points.push(commit.ts);
    }
    points.push(history.last().map_or(10, |c| c.ts + 100));
    points
}

fn check(history: &[Commit], extra: Option<&str>) -> Result<(), TestCaseError> {
    let dir = TestDir::new();
    let config = TestConnConfig::builder().maybe_extra(extra).build().render();
    let conn = Connection::open(dir.home(), &config).unwrap();
    let session = conn.open_session("").unwrap();
    session.create("table:t", "key_format=r,value_format=S").unwrap();
    conn.set_timestamp("oldest_timestamp=1,stable_timestamp=1").unwrap();

    apply(&session, history);
    for ts in read_points(history) {
        prop_assert_eq!(snapshot(&session, ts), expected_at(history, ts), "read at {}", ts);
    }

    // Moving stable forward and checkpointing must not change any answer.
    let last = history.last().map_or(1, |c| c.ts);
    conn.set_timestamp(&format!("stable_timestamp={last:x}")).unwrap();
    session.checkpoint("").unwrap();
    for ts in read_points(history) {
        prop_assert_eq!(snapshot(&session, ts), expected_at(history, ts), "read at {} after checkpoint", ts);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_reads_match_history(history in arb_history(20, 12)) {
        check(&history, None)?;
    }

    #[test]
    fn prop_reads_match_history_under_eviction(history in arb_history(20, 12)) {
        check(&history, Some("debug_mode=(eviction=true)"))?;
    }
}
