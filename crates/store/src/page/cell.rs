//! On-disk cells and their time windows.

use cellar_types::{TS_MAX, TS_NONE, Timestamp};
use serde::{Deserialize, Serialize};

use crate::txn::{TXN_MAX, TXN_NONE};

/// Validity interval of a stored value.
///
/// A value is live from its start point until its stop point. A window with
/// no stop (`stop_ts == TS_MAX` and `stop_txn == TXN_MAX`) is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ts: Timestamp,
    pub durable_start_ts: Timestamp,
    pub start_txn: u64,
    pub stop_ts: Timestamp,
    pub durable_stop_ts: Timestamp,
    pub stop_txn: u64,
    /// The newest transition (stop if present, else start) belongs to a
    /// transaction that was prepared but not resolved when written.
    pub prepared: bool,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start_ts: TS_NONE,
            durable_start_ts: TS_NONE,
            start_txn: TXN_NONE,
            stop_ts: TS_MAX,
            durable_stop_ts: TS_NONE,
            stop_txn: TXN_MAX,
            prepared: false,
        }
    }
}

impl TimeWindow {
    /// Window that starts at the given point and has no stop.
    pub fn starting(start_txn: u64, start_ts: Timestamp, durable_start_ts: Timestamp) -> Self {
        Self { start_txn, start_ts, durable_start_ts, ..Self::default() }
    }

    /// Sets the stop point.
    pub fn with_stop(mut self, stop_txn: u64, stop_ts: Timestamp, durable_stop_ts: Timestamp) -> Self {
        self.stop_txn = stop_txn;
        self.stop_ts = stop_ts;
        self.durable_stop_ts = durable_stop_ts;
        self
    }

    /// True when the window has been closed by a delete or newer value.
    pub fn has_stop(&self) -> bool {
        self.stop_ts != TS_MAX || self.stop_txn != TXN_MAX
    }

    /// Newest durable timestamp in the window.
    pub fn max_durable(&self) -> Timestamp {
        if self.has_stop() {
            self.durable_start_ts.max(self.durable_stop_ts)
        } else {
            self.durable_start_ts
        }
    }

    /// True when the start point carries the prepared flag.
    pub fn prepared_start(&self) -> bool {
        self.prepared && !self.has_stop()
    }

    /// True when the stop point carries the prepared flag.
    pub fn prepared_stop(&self) -> bool {
        self.prepared && self.has_stop()
    }
}

/// A stored key's value with its time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub tw: TimeWindow,
    pub value: Vec<u8>,
}

impl Cell {
    pub fn new(tw: TimeWindow, value: Vec<u8>) -> Self {
        Self { tw, value }
    }

    /// Approximate in-memory footprint.
    pub fn footprint(&self) -> u64 {
        self.value.len() as u64 + 56
    }
}

/// State of a prepared transaction's change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrepareState {
    /// Not part of a prepared transaction.
    #[default]
    None,
    /// Prepared, waiting for commit or rollback.
    InProgress,
    /// Committed after being prepared.
    Resolved,
}

/// A fast-truncate marker covering an entire leaf page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDel {
    pub txn_id: u64,
    pub ts: Timestamp,
    pub durable_ts: Timestamp,
    pub prepare: PrepareState,
}

impl PageDel {
    pub fn new(txn_id: u64) -> Self {
        Self { txn_id, ts: TS_NONE, durable_ts: TS_NONE, prepare: PrepareState::None }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_default_window_has_no_stop() {
        let tw = TimeWindow::starting(5, 10, 10);
        assert!(!tw.has_stop());
        assert_eq!(tw.max_durable(), 10);
        let stopped = tw.with_stop(6, 20, 25);
        assert!(stopped.has_stop());
        assert_eq!(stopped.max_durable(), 25);
    }

    #[test]
    fn test_prepared_flag_applies_to_newest_point() {
        let mut tw = TimeWindow::starting(5, 10, 10);
        tw.prepared = true;
        assert!(tw.prepared_start());
        let tw = tw.with_stop(7, 30, 30);
        assert!(tw.prepared_stop());
        assert!(!tw.prepared_start());
    }
}
