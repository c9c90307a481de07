//! Visibility rules.
//!
//! A [`Snapshot`] answers "had this transaction id committed when the
//! snapshot was taken". A [`Reader`] combines a snapshot with the reader's
//! own id, read timestamp and prepare handling, and decides what one
//! update or one stored time window means for it.

use cellar_types::{TS_NONE, Timestamp, config::IgnorePrepare};

use super::{TXN_ABORTED, TXN_MAX, TXN_NONE};
use crate::{
    page::{PageDel, PrepareState, TimeWindow},
    update::Update,
};

/// Transaction ids that had committed at some instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Snapshot {
    /// Every id below this is committed (or aborted).
    pub snap_min: u64,
    /// No id at or above this is visible.
    pub snap_max: u64,
    /// Ids between `snap_min` and `snap_max` still running at snapshot time, sorted.
    pub concurrent: Vec<u64>,
}

impl Snapshot {
    /// A snapshot that sees every committed id.
    pub fn everything() -> Self {
        Self { snap_min: TXN_MAX, snap_max: TXN_MAX, concurrent: Vec::new() }
    }

    pub fn visible(&self, id: u64) -> bool {
        if id == TXN_NONE {
            return true;
        }
        if id == TXN_ABORTED || id >= self.snap_max {
            return false;
        }
        id < self.snap_min || self.concurrent.binary_search(&id).is_err()
    }
}

/// Outcome of checking one version against a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visible {
    Yes,
    No,
    /// Prepared by another transaction and not skippable.
    Prepared,
}

/// Outcome of checking a stored cell against a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellVisible {
    /// The value is visible.
    Value,
    /// The value was deleted as of the read.
    Deleted,
    /// The value is too new; an older version may be in the history store.
    TooNew,
    /// Prepared by another transaction and not skippable.
    Prepared,
}

/// A reading (or writing) transaction's view.
#[derive(Debug, Clone)]
pub(crate) struct Reader {
    pub snapshot: Snapshot,
    /// Own transaction id (`TXN_NONE` until the first write).
    pub txn_id: u64,
    pub read_ts: Option<Timestamp>,
    pub ignore_prepare: IgnorePrepare,
    /// Read-uncommitted: every non-aborted update is visible.
    pub uncommitted: bool,
}

impl Reader {
    /// A reader that sees everything committed, with no timestamp bound.
    pub fn global() -> Self {
        Self {
            snapshot: Snapshot::everything(),
            txn_id: TXN_NONE,
            read_ts: None,
            ignore_prepare: IgnorePrepare::False,
            uncommitted: false,
        }
    }

    /// A reader bound to a snapshot and optional read timestamp.
    pub fn at(snapshot: Snapshot, read_ts: Option<Timestamp>) -> Self {
        Self { snapshot, read_ts, ..Self::global() }
    }

    fn id_visible(&self, id: u64) -> bool {
        if id == TXN_ABORTED {
            return false;
        }
        if self.txn_id != TXN_NONE && id == self.txn_id {
            return true;
        }
        self.uncommitted || self.snapshot.visible(id)
    }

    fn ts_visible(&self, ts: Timestamp) -> bool {
        match self.read_ts {
            Some(read_ts) => ts == TS_NONE || ts <= read_ts,
            None => true,
        }
    }

    fn prepared(&self, txn_id: u64, prepare_ts: Timestamp) -> Visible {
        if txn_id == self.txn_id && txn_id != TXN_NONE {
            return Visible::Yes;
        }
        if self.ignore_prepare != IgnorePrepare::False {
            return Visible::No;
        }
        match self.read_ts {
            Some(read_ts) if prepare_ts > read_ts => Visible::No,
            _ => Visible::Prepared,
        }
    }

    /// Visibility of an in-memory update.
    pub fn update(&self, upd: &Update) -> Visible {
        if upd.is_aborted() {
            return Visible::No;
        }
        if upd.prepare == PrepareState::InProgress {
            return self.prepared(upd.txn_id, upd.start_ts);
        }
        if self.id_visible(upd.txn_id) && self.ts_visible(upd.start_ts) {
            Visible::Yes
        } else {
            Visible::No
        }
    }

    /// Visibility of one transition point of a stored time window.
    fn point(&self, txn: u64, ts: Timestamp, prepared: bool) -> Visible {
        if prepared {
            return self.prepared(txn, ts);
        }
        if self.id_visible(txn) && self.ts_visible(ts) { Visible::Yes } else { Visible::No }
    }

    /// What a stored cell means for this reader.
    pub fn cell(&self, tw: &TimeWindow) -> CellVisible {
        match self.point(tw.start_txn, tw.start_ts, tw.prepared_start()) {
            Visible::Prepared => return CellVisible::Prepared,
            Visible::No => return CellVisible::TooNew,
            Visible::Yes => {},
        }
        if !tw.has_stop() {
            return CellVisible::Value;
        }
        match self.point(tw.stop_txn, tw.stop_ts, tw.prepared_stop()) {
            Visible::Yes => CellVisible::Deleted,
            Visible::No => CellVisible::Value,
            Visible::Prepared => CellVisible::Prepared,
        }
    }

    /// Visibility of a fast-truncate marker.
    pub fn page_del(&self, del: &PageDel) -> Visible {
        if del.prepare == PrepareState::InProgress {
            return self.prepared(del.txn_id, del.ts);
        }
        self.point(del.txn_id, del.ts, false)
    }

    /// Visibility used for write conflicts: committed and visible to the snapshot,
    /// ignoring the read timestamp (a newer committed timestamp still conflicts).
    pub fn committed_for_write(&self, txn_id: u64) -> bool {
        txn_id == TXN_NONE || (self.txn_id != TXN_NONE && txn_id == self.txn_id) || self.snapshot.visible(txn_id)
    }
}

/// Global visibility horizon: what no current or future reader can miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VisibleAll {
    /// Every id below this is visible to all.
    pub oldest_id: u64,
    /// Every timestamp at or below this is visible to all; `None` when no
    /// timestamp pins history.
    pub pinned_ts: Option<Timestamp>,
}

impl VisibleAll {
    /// Horizon that treats everything committed as globally visible.
    pub fn everything() -> Self {
        Self { oldest_id: TXN_MAX, pinned_ts: None }
    }

    pub fn visible(&self, txn_id: u64, ts: Timestamp) -> bool {
        if txn_id == TXN_ABORTED || txn_id >= self.oldest_id {
            return false;
        }
        match self.pinned_ts {
            Some(pinned) => ts == TS_NONE || ts <= pinned,
            None => true,
        }
    }

    pub fn update(&self, upd: &Update) -> bool {
        upd.prepare != PrepareState::InProgress && self.visible(upd.txn_id, upd.durable_ts.max(upd.start_ts))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::update::UpdateKind;

    fn snap(min: u64, max: u64, concurrent: &[u64]) -> Snapshot {
        Snapshot { snap_min: min, snap_max: max, concurrent: concurrent.to_vec() }
    }

    fn committed(txn: u64, ts: Timestamp) -> Update {
        Update::committed(txn, UpdateKind::Standard(b"v".to_vec()), ts, ts)
    }

    #[test]
    fn test_snapshot_visibility() {
        let s = snap(5, 10, &[5, 7]);
        assert!(s.visible(TXN_NONE));
        assert!(s.visible(4));
        assert!(!s.visible(5));
        assert!(s.visible(6));
        assert!(!s.visible(7));
        assert!(!s.visible(10));
        assert!(!s.visible(TXN_ABORTED));
    }

    #[test]
    fn test_read_timestamp_bounds_visibility() {
        let reader = Reader::at(Snapshot::everything(), Some(30));
        assert_eq!(reader.update(&committed(3, 20)), Visible::Yes);
        assert_eq!(reader.update(&committed(3, 30)), Visible::Yes);
        assert_eq!(reader.update(&committed(3, 31)), Visible::No);
    }

    #[test]
    fn test_prepared_update_conflicts_unless_ignored() {
        let mut upd = committed(9, 200);
        upd.prepare = PrepareState::InProgress;
        let reader = Reader::at(Snapshot::everything(), Some(250));
        assert_eq!(reader.update(&upd), Visible::Prepared);
        let early = Reader::at(Snapshot::everything(), Some(150));
        assert_eq!(early.update(&upd), Visible::No);
        let ignoring = Reader { ignore_prepare: IgnorePrepare::True, ..reader.clone() };
        assert_eq!(ignoring.update(&upd), Visible::No);
        let owner = Reader { txn_id: 9, ..reader };
        assert_eq!(owner.update(&upd), Visible::Yes);
    }

    #[test]
    fn test_cell_windows() {
        let reader = Reader::at(Snapshot::everything(), Some(25));
        let live = TimeWindow::starting(1, 20, 20);
        assert_eq!(reader.cell(&live), CellVisible::Value);
        assert_eq!(reader.cell(&live.with_stop(2, 30, 30)), CellVisible::Value);
        assert_eq!(reader.cell(&live.with_stop(2, 25, 25)), CellVisible::Deleted);
        assert_eq!(reader.cell(&TimeWindow::starting(1, 26, 26)), CellVisible::TooNew);
    }

    #[test]
    fn test_visible_all_horizon() {
        let horizon = VisibleAll { oldest_id: 10, pinned_ts: Some(50) };
        assert!(horizon.visible(9, 50));
        assert!(!horizon.visible(9, 51));
        assert!(!horizon.visible(10, 1));
        assert!(VisibleAll::everything().visible(100, 1_000));
    }
}
