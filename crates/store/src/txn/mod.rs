//! Transaction manager.
//!
//! Transaction ids are allocated lazily at a transaction's first write and
//! registered in the running set. Snapshots capture the running set; the
//! oldest running id and the oldest read timestamp together form the
//! global visibility horizon that reconciliation uses to discard history.
//!
//! Ids from earlier runs sit below the persisted id base, so every id
//! found on disk after a restart is visible to all.

mod prepare;
mod timestamp;
mod visibility;

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use cellar_types::{
    TS_NONE, Timestamp,
    config::{CommitSync, IgnorePrepare, Isolation},
};
use parking_lot::Mutex;
pub(crate) use prepare::{PreparedCatalog, PreparedEntry, RecoveredPrepared, check_prepare_timestamp};
pub use timestamp::TimestampRecord;
pub(crate) use timestamp::GlobalTimestamps;
pub(crate) use visibility::{CellVisible, Reader, Snapshot, Visible, VisibleAll};

use crate::log::LogOp;

/// Id of non-transactional writes; visible to everyone.
pub(crate) const TXN_NONE: u64 = 0;
/// Id of rolled-back updates.
pub(crate) const TXN_ABORTED: u64 = u64::MAX;
/// Largest id; marks "no stop" in time windows.
pub(crate) const TXN_MAX: u64 = u64::MAX - 1;

/// A change the transaction must resolve at commit or rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TxnOp {
    /// An update on one key.
    Update { btree: u64, key: Vec<u8> },
    /// A range removal that may have fast-truncated whole pages.
    Truncate { btree: u64, lower: Vec<u8>, upper: Option<Vec<u8>> },
}

impl TxnOp {
    pub fn btree(&self) -> u64 {
        match self {
            TxnOp::Update { btree, .. } | TxnOp::Truncate { btree, .. } => *btree,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Running {
    prepared: Option<PreparedEntry>,
}

#[derive(Debug, Clone, Copy)]
struct ReaderPin {
    snap_min: u64,
    read_ts: Timestamp,
}

#[derive(Debug, Default)]
struct ActiveSet {
    running: BTreeMap<u64, Running>,
    /// Pinned snapshots by session id.
    readers: HashMap<u64, ReaderPin>,
}

/// Connection-wide transaction state.
#[derive(Debug)]
pub(crate) struct TxnGlobal {
    next_id: AtomicU64,
    active: Mutex<ActiveSet>,
    pub ts: GlobalTimestamps,
}

impl TxnGlobal {
    /// Creates the manager; ids start at `base`.
    pub fn new(base: u64, timestamps: TimestampRecord) -> Self {
        Self {
            next_id: AtomicU64::new(base.max(1)),
            active: Mutex::new(ActiveSet::default()),
            ts: GlobalTimestamps::new(timestamps),
        }
    }

    /// Next id to be allocated; persisted as the id base at checkpoint.
    pub fn current_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Allocates an id and registers it as running.
    pub fn begin_write(&self) -> u64 {
        let mut active = self.active.lock();
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        active.running.insert(id, Running::default());
        id
    }

    /// Registers an id from an earlier run as running and prepared.
    pub fn adopt(&self, id: u64, entry: PreparedEntry) {
        let mut active = self.active.lock();
        active.running.insert(id, Running { prepared: Some(entry) });
        self.next_id.fetch_max(id + 1, Ordering::AcqRel);
    }

    /// Moves the id base forward so ids written elsewhere read as committed.
    pub fn advance_base(&self, base: u64) {
        self.next_id.fetch_max(base, Ordering::AcqRel);
    }

    /// Removes a transaction from the running set.
    pub fn finish(&self, id: u64) {
        if id != TXN_NONE {
            self.active.lock().running.remove(&id);
        }
    }

    /// Registers `id` as prepared; checkpoints capture the entry.
    pub fn set_prepared(&self, id: u64, entry: PreparedEntry) {
        let mut active = self.active.lock();
        active.running.entry(id).or_default().prepared = Some(entry);
    }

    /// Takes a snapshot excluding `own`.
    pub fn snapshot(&self, own: u64) -> Snapshot {
        let active = self.active.lock();
        let snap_max = self.next_id.load(Ordering::Acquire);
        let concurrent: Vec<u64> = active.running.keys().copied().filter(|&id| id != own).collect();
        let snap_min = concurrent.first().copied().unwrap_or(snap_max);
        Snapshot { snap_min, snap_max, concurrent }
    }

    /// Pins a session's snapshot so history it may read is retained.
    pub fn pin_reader(&self, session: u64, snap_min: u64, read_ts: Option<Timestamp>) {
        self.active
            .lock()
            .readers
            .insert(session, ReaderPin { snap_min, read_ts: read_ts.unwrap_or(TS_NONE) });
    }

    pub fn unpin_reader(&self, session: u64) {
        self.active.lock().readers.remove(&session);
    }

    /// Number of running (writing) transactions.
    pub fn running_count(&self) -> usize {
        self.active.lock().running.len()
    }

    /// Number of running or reading transactions.
    pub fn active_count(&self) -> usize {
        let active = self.active.lock();
        active.running.len() + active.readers.len()
    }

    /// Running transactions that have prepared.
    pub fn prepared(&self) -> PreparedCatalog {
        self.active
            .lock()
            .running
            .iter()
            .filter_map(|(&id, r)| r.prepared.clone().map(|entry| (id, entry)))
            .collect()
    }

    /// Oldest read timestamp of any active reader.
    pub fn oldest_reader_ts(&self) -> Option<Timestamp> {
        self.active.lock().readers.values().map(|r| r.read_ts).filter(|&ts| ts != TS_NONE).min()
    }

    /// The current global visibility horizon.
    pub fn visible_all(&self) -> VisibleAll {
        let active = self.active.lock();
        let mut oldest_id = self.next_id.load(Ordering::Acquire);
        if let Some(&id) = active.running.keys().next() {
            oldest_id = oldest_id.min(id);
        }
        for pin in active.readers.values() {
            oldest_id = oldest_id.min(pin.snap_min);
        }
        let oldest_ts = self.ts.load().oldest;
        let reader_ts = active.readers.values().map(|r| r.read_ts).filter(|&ts| ts != TS_NONE).min();
        let pinned_ts = match (oldest_ts, reader_ts) {
            (TS_NONE, None) => None,
            (TS_NONE, Some(r)) => Some(r),
            (o, None) => Some(o),
            (o, Some(r)) => Some(o.min(r)),
        };
        VisibleAll { oldest_id, pinned_ts }
    }

    /// The pinned timestamp: oldest, held back by active readers.
    pub fn pinned_ts(&self) -> Timestamp {
        self.visible_all().pinned_ts.unwrap_or(TS_NONE)
    }
}

/// Per-session transaction state.
#[derive(Debug)]
pub(crate) struct Txn {
    /// Allocated at the first write.
    pub id: u64,
    /// Started with `begin_transaction` (as opposed to an autocommit wrapper).
    pub explicit: bool,
    pub isolation: Isolation,
    pub reader: Reader,
    /// The snapshot has been taken (snapshot isolation takes it once).
    pub has_snapshot: bool,
    pub read_ts: Option<Timestamp>,
    pub commit_ts: Option<Timestamp>,
    pub first_commit_ts: Option<Timestamp>,
    pub durable_ts: Option<Timestamp>,
    pub prepare_ts: Option<Timestamp>,
    pub prepared: bool,
    pub prepared_id: Option<u64>,
    /// Adopted from the recovered prepared catalog.
    pub claimed: bool,
    pub no_timestamp: bool,
    pub roundup_read: bool,
    pub roundup_prepared: bool,
    pub sync: CommitSync,
    pub ops: Vec<TxnOp>,
    pub log_ops: Vec<LogOp>,
    /// Wrote to a logged table.
    pub wrote_logged: bool,
    /// Set after an error that requires rollback.
    pub must_rollback: Option<String>,
    pub name: Option<String>,
}

impl Txn {
    pub fn new(isolation: Isolation, ignore_prepare: IgnorePrepare) -> Self {
        let reader = Reader { ignore_prepare, uncommitted: isolation == Isolation::ReadUncommitted, ..Reader::global() };
        Self {
            id: TXN_NONE,
            explicit: false,
            isolation,
            reader,
            has_snapshot: false,
            read_ts: None,
            commit_ts: None,
            first_commit_ts: None,
            durable_ts: None,
            prepare_ts: None,
            prepared: false,
            prepared_id: None,
            claimed: false,
            no_timestamp: false,
            roundup_read: false,
            roundup_prepared: false,
            sync: CommitSync::Default,
            ops: Vec::new(),
            log_ops: Vec::new(),
            wrote_logged: false,
            must_rollback: None,
            name: None,
        }
    }

    /// True when reads may not write (ignore_prepare=true).
    pub fn read_only(&self) -> bool {
        self.reader.ignore_prepare == IgnorePrepare::True
    }

    /// True when the transaction has written anything.
    pub fn has_writes(&self) -> bool {
        !self.ops.is_empty()
    }

    /// Refreshes the snapshot as the isolation level requires before an operation.
    pub fn refresh_snapshot(&mut self, global: &TxnGlobal, session: u64) {
        if self.has_snapshot && self.isolation == Isolation::Snapshot {
            return;
        }
        let snapshot = global.snapshot(self.id);
        global.pin_reader(session, snapshot.snap_min, self.read_ts);
        self.reader.snapshot = snapshot;
        self.reader.read_ts = self.read_ts;
        self.has_snapshot = true;
    }

    /// Allocates the transaction id on first write.
    pub fn ensure_id(&mut self, global: &TxnGlobal) -> u64 {
        if self.id == TXN_NONE {
            self.id = global.begin_write();
            self.reader.txn_id = self.id;
        }
        self.id
    }
}
