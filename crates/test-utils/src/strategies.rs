//! Proptest strategies for storage-engine tests.
//!
//! Generators produce keys, values and histories of timestamped writes
//! that a test replays through a table and then checks with reads at
//! each commit timestamp.
//!
//! # Usage
//!
//! ```no_run
//! use cellar_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(history in strategies::arb_history(8, 32)) {
//!         // replay history, then read back at every commit timestamp
//!     }
//! }
//! ```

use std::collections::BTreeMap;

use proptest::prelude::*;

/// Generates a string key of 1-16 characters matching `[a-z][a-z0-9]{0,15}`.
pub fn arb_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,15}"
}

/// Generates a printable string value of 0-64 characters.
pub fn arb_value() -> impl Strategy<Value = String> {
    "[ -~]{0,64}"
}

/// Generates raw bytes of 0-255 length.
pub fn arb_bytes() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..256)
}

/// One write of a history: set `key` to `value`, or remove it when
/// `value` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    /// Record number of the key, small so writes collide.
    pub key: u64,
    /// New value, `None` for a remove.
    pub value: Option<String>,
}

/// One committed transaction of a history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Commit timestamp; strictly increasing through a history.
    pub ts: u64,
    /// Writes in this transaction, at most one per key.
    pub writes: Vec<Write>,
}

fn arb_write(keys: u64) -> impl Strategy<Value = Write> {
    (1..=keys, prop::option::weighted(0.8, "[a-z]{1,12}")).prop_map(|(key, value)| Write { key, value })
}

/// Generates up to `max_commits` transactions over keys `1..=keys`.
///
/// Commit timestamps start at 10 and grow by 1-5 each time. Each
/// transaction writes 1-4 distinct keys.
pub fn arb_history(keys: u64, max_commits: usize) -> impl Strategy<Value = Vec<Commit>> {
    proptest::collection::vec((1u64..=5, proptest::collection::vec(arb_write(keys), 1..=4)), 1..=max_commits)
        .prop_map(|raw| {
            let mut ts = 10;
            raw.into_iter()
                .map(|(gap, writes)| {
                    ts += gap;
                    let mut seen = BTreeMap::new();
                    for w in writes {
                        seen.insert(w.key, w);
                    }
                    Commit { ts, writes: seen.into_values().collect() }
                })
                .collect()
        })
}

/// The value of every key as of `read_ts`, computed from the history.
///
/// Keys whose last write at or before `read_ts` was a remove, or that were
/// never written by then, are absent.
pub fn expected_at(history: &[Commit], read_ts: u64) -> BTreeMap<u64, String> {
    let mut state = BTreeMap::new();
    for commit in history.iter().take_while(|c| c.ts <= read_ts) {
        for w in &commit.writes {
            match &w.value {
                Some(v) => {
                    state.insert(w.key, v.clone());
                },
                None => {
                    state.remove(&w.key);
                },
            }
        }
    }
    state
}
