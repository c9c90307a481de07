//! Sessions.
//!
//! A session runs one transaction at a time. Cursor operations outside an
//! explicit transaction run in an autocommit transaction of their own that
//! commits when the operation succeeds and rolls back when it fails.
//!
//! Commit resolves every update the transaction made while holding the
//! commit gate for reading, then removes the id from the running set.
//! Until that last step other snapshots treat the id as concurrent, so a
//! partially resolved commit is never visible.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use cellar_types::{
    TS_NONE, Timestamp,
    config::{
        BeginTransactionConfig, CheckpointConfig, CommitConfig, CommitSync, CompactConfig, ConfigSection,
        IgnorePrepare, Isolation, LogFlushConfig, ParsedConfig, PrepareConfig, QueryTimestampConfig, RollbackConfig,
        SalvageConfig, SessionConfig, SyncMethod, TimestampConfig, TimestampQuery, TimingStress, VerifyConfig,
    },
    timestamp::format_hex,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    btree::{Btree, Expect, KeyRange, Resolution, WriteCtx},
    checkpoint,
    compact::{self, CompactOutcome},
    conn::{ConnInner, DataTarget, TargetKind, TxnTimestamp},
    cursor::{self, Cursor},
    error::{Error, Result},
    evict,
    hs::HistoryStore,
    log::{LogOp, LogRecord, removal},
    metrics,
    stats::Stat,
    truncate::{self, TruncateOutcome},
    txn::{PreparedEntry, Reader, TXN_NONE, Txn, TxnOp, check_prepare_timestamp},
    update::UpdateKind,
    verify::{self, SalvageOutcome, VerifyReport},
};

/// One operation's view of the session transaction.
pub(crate) struct Op<'a> {
    pub conn: &'a Arc<ConnInner>,
    txn: &'a mut Txn,
}

impl Op<'_> {
    pub fn reader(&self) -> &Reader {
        &self.txn.reader
    }

    pub fn hs(&self) -> Option<&HistoryStore> {
        Some(&self.conn.hs)
    }

    /// True inside `begin_transaction` with snapshot isolation.
    pub fn explicit_snapshot(&self) -> bool {
        self.txn.explicit && self.txn.isolation == Isolation::Snapshot
    }

    pub fn explicit(&self) -> bool {
        self.txn.explicit
    }

    fn write_ctx(&mut self) -> (u64, Timestamp, Timestamp) {
        let txn_id = self.txn.ensure_id(&self.conn.txn);
        let commit_ts = self.txn.commit_ts.unwrap_or(TS_NONE);
        let durable_ts = self.txn.durable_ts.unwrap_or(commit_ts);
        (txn_id, commit_ts, durable_ts)
    }

    /// Writes one update on behalf of the transaction and records it for
    /// resolution and, on logged trees, for the log.
    pub fn write(&mut self, tree: &Btree, key: &[u8], kind: UpdateKind, expect: Expect) -> Result<()> {
        let log_op = if tree.is_logged() {
            match &kind {
                UpdateKind::Standard(value) => {
                    Some(LogOp::Put { btree: tree.id, key: key.to_vec(), value: value.clone() })
                },
                UpdateKind::Modify(entries) => {
                    Some(LogOp::Modify { btree: tree.id, key: key.to_vec(), entries: entries.clone() })
                },
                UpdateKind::Tombstone => Some(LogOp::Remove { btree: tree.id, key: key.to_vec() }),
                UpdateKind::Reserve => None,
            }
        } else {
            None
        };
        let (txn_id, commit_ts, durable_ts) = self.write_ctx();
        let ctx = WriteCtx { reader: Some(&self.txn.reader), txn_id, commit_ts, durable_ts };
        tree.write(key, kind, &ctx, expect)?;
        self.txn.ops.push(TxnOp::Update { btree: tree.id, key: key.to_vec() });
        if let Some(op) = log_op {
            self.txn.log_ops.push(op);
            self.txn.wrote_logged = true;
        }
        Ok(())
    }

    /// Removes `[lower, upper]` from `tree`, fast-truncating whole pages.
    pub fn truncate(&mut self, tree: &Btree, lower: &[u8], upper: Option<&[u8]>) -> Result<TruncateOutcome> {
        let (txn_id, commit_ts, durable_ts) = self.write_ctx();
        let ctx = WriteCtx { reader: Some(&self.txn.reader), txn_id, commit_ts, durable_ts };
        // Recorded first: a truncate that fails partway has already marked
        // pages, and rollback must find them.
        self.txn.ops.push(TxnOp::Truncate { btree: tree.id, lower: lower.to_vec(), upper: upper.map(<[u8]>::to_vec) });
        let out = truncate::truncate(tree, lower, upper, &ctx, &self.txn.reader, Some(&self.conn.hs))?;
        if tree.is_logged() {
            self.txn.log_ops.push(LogOp::Truncate {
                btree: tree.id,
                lower: (!lower.is_empty()).then(|| lower.to_vec()),
                upper: upper.map(<[u8]>::to_vec),
            });
            self.txn.wrote_logged = true;
        }
        Ok(out)
    }
}

/// Resolves one recorded change.
fn resolve_op(conn: &ConnInner, op: &TxnOp, txn_id: u64, res: Resolution) -> Result<()> {
    let tree = match conn.tree(op.btree()) {
        Ok(tree) => tree,
        Err(_) => {
            warn!(btree = op.btree(), "resolving a change on a dropped tree");
            return Ok(());
        },
    };
    match op {
        TxnOp::Update { key, .. } => tree.resolve_key(key, txn_id, res),
        TxnOp::Truncate { lower, upper, .. } => tree.resolve_range(lower, upper.as_deref(), txn_id, res),
    }
}

/// A thread's handle on a connection.
pub struct Session {
    conn: Arc<ConnInner>,
    id: u64,
    config: Mutex<SessionConfig>,
    txn: Mutex<Txn>,
    /// Moves whenever an explicit transaction resolves or a checkpoint
    /// runs; cursors drop their position and bounds when it does.
    epoch: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    pub(crate) fn new(conn: Arc<ConnInner>, id: u64, config: &str) -> Result<Self> {
        let config = SessionConfig::parse(config)?;
        let txn = Txn::new(config.isolation, IgnorePrepare::False);
        conn.env.stats.incr(Stat::SessionOpen);
        conn.session_swept(id);
        debug!(session = id, "session opened");
        Ok(Self { conn, id, config: Mutex::new(config), txn: Mutex::new(txn), epoch: AtomicU64::new(0) })
    }

    pub(crate) fn conn(&self) -> &Arc<ConnInner> {
        &self.conn
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn fresh_txn(&self) -> Txn {
        Txn::new(self.config.lock().isolation, IgnorePrepare::False)
    }

    /// Runs `f` inside the current transaction, or inside an autocommit
    /// transaction when none is running.
    pub(crate) fn run<R>(&self, write: bool, f: impl FnOnce(&mut Op<'_>) -> Result<R>) -> Result<R> {
        self.conn.check_open()?;
        let (max_wait, ignore_cache) = {
            let config = self.config.lock();
            (config.cache_max_wait_ms, config.ignore_cache_size)
        };
        if write && !ignore_cache {
            let has_writes = self.txn.lock().has_writes();
            evict::wait_for_space(&self.conn, max_wait, has_writes)?;
        }

        let mut txn = self.txn.lock();
        if txn.explicit {
            if txn.prepared {
                return Err(Error::invalid("the transaction is prepared; only commit or rollback are allowed"));
            }
            if let Some(reason) = &txn.must_rollback {
                return Err(Error::rollback(reason.clone()));
            }
            if write && txn.read_only() {
                return Err(Error::invalid("transactions with ignore_prepare=true are read-only"));
            }
            txn.refresh_snapshot(&self.conn.txn, self.id);
            let result = f(&mut Op { conn: &self.conn, txn: &mut txn });
            if let Err(e) = &result {
                if e.is_rollback() {
                    txn.must_rollback = Some(e.to_string());
                }
            }
            return result;
        }

        txn.refresh_snapshot(&self.conn.txn, self.id);
        let result = f(&mut Op { conn: &self.conn, txn: &mut txn });
        let outcome = match result {
            Ok(value) if txn.has_writes() => self.commit_locked(&mut txn, &CommitConfig::default()).map(|()| value),
            Ok(value) => Ok(value),
            Err(e) => {
                if txn.has_writes() {
                    if let Err(rollback) = self.rollback_locked(&mut txn) {
                        warn!(error = %rollback, "autocommit rollback failed");
                    }
                }
                Err(e)
            },
        };
        self.end_txn(&mut txn);
        outcome
    }

    fn end_txn(&self, txn: &mut Txn) {
        *txn = self.fresh_txn();
        self.conn.txn.unpin_reader(self.id);
    }

    /// Starts an explicit transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] when a transaction is already running,
    ///   for a read timestamp older than oldest (without `roundup_timestamps`)
    ///   or an unknown `claim_prepared` id
    pub fn begin_transaction(&self, config: &str) -> Result<()> {
        let cfg = BeginTransactionConfig::parse(config)?;
        self.conn.check_open()?;
        let mut txn = self.txn.lock();
        if txn.explicit {
            return Err(Error::invalid("begin_transaction: a transaction is already running"));
        }
        let isolation = cfg.isolation.unwrap_or(self.config.lock().isolation);
        let mut next = Txn::new(isolation, cfg.ignore_prepare);
        next.explicit = true;
        next.roundup_read = cfg.roundup_read;
        next.roundup_prepared = cfg.roundup_prepared;
        next.no_timestamp = cfg.no_timestamp;
        next.sync = cfg.sync;
        next.name = cfg.name.clone();
        if let Some(ts) = cfg.read_timestamp {
            self.set_read_timestamp(&mut next, ts)?;
        }
        if let Some(prepared_id) = cfg.claim_prepared {
            let claimed = self
                .conn
                .recovered
                .lock()
                .remove(&prepared_id)
                .ok_or_else(|| Error::invalid(format!("claim_prepared: no recovered prepared transaction {prepared_id}")))?;
            next.id = claimed.txn_id;
            next.reader.txn_id = claimed.txn_id;
            next.prepared = true;
            next.claimed = true;
            next.prepare_ts = Some(claimed.prepare_ts);
            next.prepared_id = Some(claimed.prepared_id);
            next.ops = claimed.ops;
            debug!(session = self.id, prepared_id, txn_id = claimed.txn_id, "claimed prepared transaction");
        }
        self.conn.txn.unpin_reader(self.id);
        *txn = next;
        self.conn.env.stats.incr(Stat::TxnBegin);
        Ok(())
    }

    /// Commits the running transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] for timestamps that break ordering rules;
    ///   the transaction is rolled back
    /// - [`Error::Rollback`] when an earlier operation already required rollback
    pub fn commit_transaction(&self, config: &str) -> Result<()> {
        let cfg = CommitConfig::parse(config)?;
        let mut txn = self.txn.lock();
        if !txn.explicit {
            return Err(Error::invalid("commit_transaction: no transaction is running"));
        }
        let result = self.commit_locked(&mut txn, &cfg);
        self.end_txn(&mut txn);
        self.bump_epoch();
        result
    }

    /// Rolls the running transaction back.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when no transaction is running, or for a
    /// `rollback_timestamp` on a transaction that is not prepared.
    pub fn rollback_transaction(&self, config: &str) -> Result<()> {
        let cfg = RollbackConfig::parse(config)?;
        let mut txn = self.txn.lock();
        if !txn.explicit {
            return Err(Error::invalid("rollback_transaction: no transaction is running"));
        }
        if let Some(ts) = cfg.rollback_timestamp {
            match txn.prepare_ts {
                Some(prepare_ts) if txn.prepared => {
                    if ts < prepare_ts {
                        return Err(Error::invalid(format!(
                            "rollback timestamp {} is older than the prepare timestamp {}",
                            format_hex(ts),
                            format_hex(prepare_ts)
                        )));
                    }
                },
                _ => return Err(Error::invalid("rollback_timestamp requires a prepared transaction")),
            }
        }
        let result = self.rollback_locked(&mut txn);
        self.end_txn(&mut txn);
        self.bump_epoch();
        result
    }

    /// Prepares the running transaction for a later commit or rollback.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] without a valid prepare timestamp, when a
    /// commit timestamp is already set, or when the transaction wrote to a
    /// logged table.
    pub fn prepare_transaction(&self, config: &str) -> Result<()> {
        let cfg = PrepareConfig::parse(config)?;
        let mut txn = self.txn.lock();
        if !txn.explicit {
            return Err(Error::invalid("prepare_transaction: no transaction is running"));
        }
        if txn.prepared {
            return Err(Error::invalid("prepare_transaction: the transaction is already prepared"));
        }
        if let Some(reason) = &txn.must_rollback {
            return Err(Error::rollback(reason.clone()));
        }
        if txn.commit_ts.is_some() {
            return Err(Error::invalid("prepare_transaction: a commit timestamp must not be set before prepare"));
        }
        if txn.wrote_logged {
            return Err(Error::invalid("prepare_transaction: the transaction wrote to a logged table"));
        }
        let requested = cfg
            .prepare_timestamp
            .or(txn.prepare_ts)
            .ok_or_else(|| Error::invalid("prepare_transaction: a prepare timestamp is required"))?;
        let record = self.conn.txn.ts.load();
        let prepare_ts = check_prepare_timestamp(&record, requested, txn.read_ts, txn.roundup_prepared)?;
        let txn_id = txn.ensure_id(&self.conn.txn);
        let prepared_id = cfg.prepared_id.or(txn.prepared_id);
        {
            let _gate = self.conn.commit_gate.read();
            for op in &txn.ops {
                resolve_op(&self.conn, op, txn_id, Resolution::Prepare { prepare_ts })?;
            }
            self.conn.txn.set_prepared(txn_id, PreparedEntry::from_ops(prepared_id, prepare_ts, &txn.ops));
        }
        txn.prepared = true;
        txn.prepare_ts = Some(prepare_ts);
        txn.prepared_id = prepared_id;
        self.conn.env.stats.incr(Stat::TxnPrepare);
        debug!(session = self.id, txn_id, prepare_ts, ?prepared_id, "prepared");
        Ok(())
    }

    fn set_read_timestamp(&self, txn: &mut Txn, ts: Timestamp) -> Result<()> {
        if txn.read_ts.is_some() && txn.has_snapshot {
            return Err(Error::invalid("read timestamp is already set"));
        }
        let oldest = self.conn.txn.ts.load().oldest;
        let ts = if oldest != TS_NONE && ts < oldest {
            if !txn.roundup_read {
                return Err(Error::invalid(format!(
                    "read timestamp {} is older than the oldest timestamp {}",
                    format_hex(ts),
                    format_hex(oldest)
                )));
            }
            oldest
        } else {
            ts
        };
        txn.read_ts = Some(ts);
        txn.reader.read_ts = Some(ts);
        if txn.has_snapshot {
            self.conn.txn.pin_reader(self.id, txn.reader.snapshot.snap_min, Some(ts));
        }
        Ok(())
    }

    fn set_commit_timestamp(&self, txn: &mut Txn, ts: Timestamp) -> Result<()> {
        let record = self.conn.txn.ts.load();
        if txn.prepared {
            let prepare_ts = txn.prepare_ts.unwrap_or(TS_NONE);
            if ts < prepare_ts {
                return Err(Error::invalid(format!(
                    "commit timestamp {} is older than the prepare timestamp {}",
                    format_hex(ts),
                    format_hex(prepare_ts)
                )));
            }
        } else {
            if record.oldest != TS_NONE && ts < record.oldest {
                return Err(Error::invalid(format!(
                    "commit timestamp {} is older than the oldest timestamp {}",
                    format_hex(ts),
                    format_hex(record.oldest)
                )));
            }
            if record.stable != TS_NONE && ts <= record.stable {
                return Err(Error::invalid(format!(
                    "commit timestamp {} must be after the stable timestamp {}",
                    format_hex(ts),
                    format_hex(record.stable)
                )));
            }
        }
        if let Some(prev) = txn.commit_ts {
            if ts < prev {
                return Err(Error::invalid(format!(
                    "commit timestamp {} is older than the transaction's earlier commit timestamp {}",
                    format_hex(ts),
                    format_hex(prev)
                )));
            }
        }
        txn.commit_ts = Some(ts);
        txn.first_commit_ts.get_or_insert(ts);
        Ok(())
    }

    /// Where the log goes on commit, or `None` to leave it buffered.
    fn sync_method(&self, sync: CommitSync) -> Option<SyncMethod> {
        let configured = self.conn.env.config().transaction_sync.clone();
        let method = match configured.method {
            SyncMethod::None => SyncMethod::Fsync,
            other => other,
        };
        match sync {
            CommitSync::Full => Some(method),
            CommitSync::Write | CommitSync::None => None,
            CommitSync::Default => configured.enabled.then_some(method),
        }
    }

    fn commit_locked(&self, txn: &mut Txn, cfg: &CommitConfig) -> Result<()> {
        if let Some(reason) = txn.must_rollback.take() {
            self.rollback_locked(txn)?;
            return Err(Error::rollback(reason));
        }
        if let Err(e) = self.check_commit(txn, cfg) {
            self.rollback_locked(txn)?;
            return Err(e);
        }
        let commit_ts = txn.commit_ts.unwrap_or(TS_NONE);
        let durable_ts = txn.durable_ts.unwrap_or(commit_ts);

        if !txn.log_ops.is_empty() {
            if let Some(log) = &self.conn.log {
                let record = LogRecord::Commit {
                    txn_id: txn.id,
                    commit_ts,
                    durable_ts,
                    ops: std::mem::take(&mut txn.log_ops),
                };
                log.append(&record)?;
                let sync = if cfg.sync == CommitSync::Default { txn.sync } else { cfg.sync };
                if let Some(method) = self.sync_method(sync) {
                    log.flush(method)?;
                }
            }
        }
        self.conn.env.stress(TimingStress::CommitTransactionSlow);

        let res = Resolution::Commit { commit_ts, durable_ts };
        let mut first_err = None;
        {
            let _gate = self.conn.commit_gate.read();
            for op in &txn.ops {
                if let Err(e) = resolve_op(&self.conn, op, txn.id, res) {
                    first_err.get_or_insert(e);
                }
            }
            if txn.id != TXN_NONE {
                self.conn.txn.finish(txn.id);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        if commit_ts != TS_NONE {
            self.conn.txn.ts.note_durable(durable_ts);
        }
        if self.conn.env.config().debug_mode.eviction {
            for op in &txn.ops {
                if let TxnOp::Update { btree, key } = op {
                    if let Ok(tree) = self.conn.tree(*btree) {
                        let _ = evict::release_page(&self.conn, &tree, key);
                    }
                }
            }
        }
        self.conn.env.stats.incr(Stat::TxnCommit);
        metrics::record_txn(true);
        Ok(())
    }

    /// Applies the commit configuration and checks every timestamp rule.
    fn check_commit(&self, txn: &mut Txn, cfg: &CommitConfig) -> Result<()> {
        if let Some(ts) = cfg.commit_timestamp {
            self.set_commit_timestamp(txn, ts)?;
        }
        if let Some(ts) = cfg.durable_timestamp {
            txn.durable_ts = Some(ts);
        }
        let commit_ts = txn.commit_ts.unwrap_or(TS_NONE);
        if let Some(durable) = txn.durable_ts {
            if durable < commit_ts {
                return Err(Error::invalid(format!(
                    "durable timestamp {} is older than the commit timestamp {}",
                    format_hex(durable),
                    format_hex(commit_ts)
                )));
            }
        }
        if txn.prepared {
            if commit_ts == TS_NONE {
                return Err(Error::invalid("commit_transaction: a prepared transaction needs a commit timestamp"));
            }
            let durable = txn.durable_ts.unwrap_or(commit_ts);
            let stable = self.conn.txn.ts.load().stable;
            if stable != TS_NONE && durable <= stable {
                return Err(Error::invalid(format!(
                    "durable timestamp {} must be after the stable timestamp {}",
                    format_hex(durable),
                    format_hex(stable)
                )));
            }
            return Ok(());
        }
        let ordered_ts = txn.first_commit_ts.unwrap_or(commit_ts);
        for op in &txn.ops {
            if let TxnOp::Update { btree, key } = op {
                if let Ok(tree) = self.conn.tree(*btree) {
                    tree.check_commit_order(key, txn.id, ordered_ts)?;
                }
            }
        }
        Ok(())
    }

    fn rollback_locked(&self, txn: &mut Txn) -> Result<()> {
        let mut first_err = None;
        {
            let _gate = self.conn.commit_gate.read();
            for op in txn.ops.iter().rev() {
                if let Err(e) = resolve_op(&self.conn, op, txn.id, Resolution::Rollback) {
                    first_err.get_or_insert(e);
                }
            }
            if txn.id != TXN_NONE {
                self.conn.txn.finish(txn.id);
            }
        }
        txn.ops.clear();
        txn.log_ops.clear();
        self.conn.env.stats.incr(Stat::TxnRollback);
        metrics::record_txn(false);
        first_err.map_or(Ok(()), Err)
    }

    /// Sets timestamps on the running transaction.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] outside a transaction or for a timestamp
    /// that breaks ordering rules.
    pub fn timestamp_transaction(&self, config: &str) -> Result<()> {
        let cfg = TimestampConfig::parse(config)?;
        let mut txn = self.txn.lock();
        if !txn.explicit {
            return Err(Error::invalid("timestamp_transaction: no transaction is running"));
        }
        if let Some(ts) = cfg.read_timestamp {
            self.set_read_timestamp(&mut txn, ts)?;
        }
        if let Some(ts) = cfg.prepare_timestamp {
            if txn.prepared {
                return Err(Error::invalid("prepare timestamp set on a prepared transaction"));
            }
            txn.prepare_ts = Some(ts);
        }
        if let Some(ts) = cfg.commit_timestamp {
            self.set_commit_timestamp(&mut txn, ts)?;
        }
        if let Some(ts) = cfg.durable_timestamp {
            txn.durable_ts = Some(ts);
        }
        Ok(())
    }

    /// Typed form of [`timestamp_transaction`](Self::timestamp_transaction).
    ///
    /// # Errors
    ///
    /// As for [`timestamp_transaction`](Self::timestamp_transaction).
    pub fn timestamp_transaction_uint(&self, which: TxnTimestamp, ts: Timestamp) -> Result<()> {
        let key = match which {
            TxnTimestamp::Commit => "commit_timestamp",
            TxnTimestamp::Durable => "durable_timestamp",
            TxnTimestamp::Prepare => "prepare_timestamp",
            TxnTimestamp::Read => "read_timestamp",
        };
        self.timestamp_transaction(&format!("{key}={}", format_hex(ts)))
    }

    /// Returns a transaction or connection timestamp as lowercase hex.
    ///
    /// # Errors
    ///
    /// Fails for unknown queries.
    pub fn query_timestamp(&self, config: &str) -> Result<String> {
        let cfg = QueryTimestampConfig::parse(config)?;
        Ok(format_hex(self.query_timestamp_uint(cfg.get)?))
    }

    /// Typed form of [`query_timestamp`](Self::query_timestamp).
    ///
    /// # Errors
    ///
    /// Fails for connection queries the connection rejects.
    pub fn query_timestamp_uint(&self, query: TimestampQuery) -> Result<Timestamp> {
        let txn = self.txn.lock();
        let ts = match query {
            TimestampQuery::Commit => txn.commit_ts,
            TimestampQuery::FirstCommit => txn.first_commit_ts,
            TimestampQuery::Prepare => txn.prepare_ts,
            TimestampQuery::Read => txn.read_ts,
            other => {
                drop(txn);
                return self.conn.query_timestamp(other);
            },
        };
        Ok(ts.unwrap_or(TS_NONE))
    }

    /// True while an explicit transaction is running.
    pub fn in_transaction(&self) -> bool {
        self.txn.lock().explicit
    }

    /// Opens a cursor.
    ///
    /// # Errors
    ///
    /// Fails for unknown objects, invalid configuration, a second backup
    /// cursor, or a statistics cursor when statistics are disabled.
    pub fn open_cursor(&self, uri: &str, config: &str) -> Result<Cursor<'_>> {
        self.conn.check_open()?;
        cursor::open(self, uri, config)
    }

    /// Creates an object.
    ///
    /// # Errors
    ///
    /// Fails for invalid configuration or an existing object with a different configuration.
    pub fn create(&self, uri: &str, config: &str) -> Result<()> {
        self.conn.check_open()?;
        self.conn.create(uri, config)
    }

    /// Changes an object's logging, application metadata or access hint.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while cursors are open on the object.
    pub fn alter(&self, uri: &str, config: &str) -> Result<()> {
        self.conn.check_open()?;
        self.conn.alter(uri, config)
    }

    /// Drops an object.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while cursors are open on the object.
    pub fn drop(&self, uri: &str, config: &str) -> Result<()> {
        self.conn.check_open()?;
        self.conn.drop_object(uri, config)
    }

    /// Renames an object and its file.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while cursors are open on the object.
    pub fn rename(&self, uri: &str, new_uri: &str, config: &str) -> Result<()> {
        self.conn.check_open()?;
        self.conn.rename(uri, new_uri, config)
    }

    /// Checks that an object exists; its files are already current.
    ///
    /// # Errors
    ///
    /// Fails for unknown objects.
    pub fn upgrade(&self, uri: &str, config: &str) -> Result<()> {
        let parsed = ParsedConfig::parse(config)?;
        parsed.reader().finish()?;
        self.conn.check_open()?;
        self.conn.data_target(uri).map(|_| ())
    }

    /// Takes a checkpoint.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] inside a transaction or for timestamp
    /// rules of precise checkpoints; [`Error::Busy`] when dropping a
    /// checkpoint that a cursor has open.
    pub fn checkpoint(&self, config: &str) -> Result<()> {
        let cfg = CheckpointConfig::parse(config)?;
        self.conn.check_open()?;
        if self.in_transaction() {
            return Err(Error::invalid("checkpoint is not permitted in a transaction"));
        }
        let result = checkpoint::checkpoint(&self.conn, &cfg);
        self.bump_epoch();
        result
    }

    /// Removes a range of keys.
    ///
    /// Either `uri` names the whole object, or `start` and/or `stop` are
    /// cursors on one object with their keys set; a missing end runs to
    /// that end of the object.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when the arguments name no object or more
    /// than one; [`Error::Unsupported`] for index and column-group objects.
    pub fn truncate(
        &self,
        uri: Option<&str>,
        start: Option<&Cursor<'_>>,
        stop: Option<&Cursor<'_>>,
        config: &str,
    ) -> Result<TruncateOutcome> {
        ParsedConfig::parse(config)?.reader().finish()?;
        self.conn.check_open()?;
        let (target, lower, upper) = match (uri, start, stop) {
            (Some(uri), None, None) => (self.conn.data_target(uri)?, Vec::new(), None),
            (Some(_), ..) => return Err(Error::invalid("truncate: give either a URI or cursors, not both")),
            (None, None, None) => return Err(Error::invalid("truncate: a URI or a cursor is required")),
            (None, start, stop) => {
                let target = start
                    .or(stop)
                    .and_then(Cursor::data_target)
                    .ok_or_else(|| Error::invalid("truncate: cursors must be on a table or file"))?
                    .clone();
                if let (Some(a), Some(b)) = (start, stop) {
                    if a.uri() != b.uri() {
                        return Err(Error::invalid("truncate: start and stop cursors are on different objects"));
                    }
                }
                let lower = start.map(Cursor::packed_key).transpose()?.unwrap_or_default();
                let upper = stop.map(Cursor::packed_key).transpose()?;
                (target, lower, upper)
            },
        };
        if upper.as_deref().is_some_and(|u| u < lower.as_slice()) {
            return Ok(TruncateOutcome::default());
        }
        let out = self.run(true, |op| truncate_target(op, &target, &lower, upper.as_deref()))?;
        debug!(uri = %target.uri, fast_pages = out.fast_pages, keys = out.keys, "truncated");
        Ok(out)
    }

    /// Verifies an object's pages and cells.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] for damage (unless `read_corrupt`);
    /// [`Error::Busy`] while cursors are open on the object.
    pub fn verify(&self, uri: &str, config: &str) -> Result<VerifyReport> {
        let cfg = VerifyConfig::parse(config)?;
        self.conn.check_open()?;
        verify::verify(&self.conn, uri, &cfg)
    }

    /// Rebuilds an object from its readable blocks.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while cursors are open on the object.
    pub fn salvage(&self, uri: &str, config: &str) -> Result<SalvageOutcome> {
        let cfg = SalvageConfig::parse(config)?;
        self.conn.check_open()?;
        verify::salvage(&self.conn, uri, &cfg)
    }

    /// Compacts an object, or with `background=…` starts or stops
    /// background compaction.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] on timeout or while background compaction runs.
    pub fn compact(&self, uri: Option<&str>, config: &str) -> Result<CompactOutcome> {
        let cfg = CompactConfig::parse(config)?;
        compact::compact(&self.conn, uri, &cfg)
    }

    /// Flushes the log.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when logging is disabled.
    pub fn log_flush(&self, config: &str) -> Result<()> {
        let cfg = LogFlushConfig::parse(config)?;
        self.conn.check_open()?;
        let log = self.conn.log.as_ref().ok_or_else(|| Error::invalid("log_flush: logging is not enabled"))?;
        if let Some(method) = self.sync_method(cfg.sync) {
            log.flush(method)?;
        }
        Ok(())
    }

    /// Writes a message record to the log. Does nothing without a log.
    ///
    /// # Errors
    ///
    /// Fails when the log write fails.
    pub fn log_printf(&self, message: &str) -> Result<()> {
        self.conn.check_open()?;
        if let Some(log) = &self.conn.log {
            log.append(&LogRecord::Message { text: message.to_string() })?;
        }
        Ok(())
    }

    /// Changes the session defaults.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] inside a transaction.
    pub fn reconfigure(&self, config: &str) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::invalid("reconfigure is not permitted in a transaction"));
        }
        let mut current = self.config.lock();
        let mut next = current.clone();
        next.merge(config)?;
        *current = next;
        drop(current);
        *self.txn.lock() = self.fresh_txn();
        self.bump_epoch();
        Ok(())
    }

    /// Resets cached state; refused inside a transaction.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] inside a transaction.
    pub fn reset(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::invalid("reset is not permitted in a transaction"));
        }
        self.conn.txn.unpin_reader(self.id);
        self.conn.session_swept(self.id);
        self.bump_epoch();
        Ok(())
    }

    /// Closes the session, rolling back a running transaction.
    pub fn close(self) {}
}

/// Removes `[lower, upper]` from a cursor target.
fn truncate_target(op: &mut Op<'_>, target: &DataTarget, lower: &[u8], upper: Option<&[u8]>) -> Result<TruncateOutcome> {
    match &target.kind {
        TargetKind::Plain if target.indices.is_empty() => op.truncate(&target.tree, lower, upper),
        TargetKind::Plain | TargetKind::Layered(_) => {
            let mut out = TruncateOutcome::default();
            let range = KeyRange { lower: Some(lower.to_vec()), upper: upper.map(<[u8]>::to_vec) };
            let mut from: Option<Vec<u8>> = None;
            loop {
                let next = cursor::visible_next(target, from.as_deref(), &range, op.reader(), op.hs())?;
                let Some((key, value)) = next else { break };
                cursor::remove_indexed(op, target, &key, &value)?;
                op.write(&target.tree, &key, removal(&target.tree), Expect::Any)?;
                out.keys += 1;
                from = Some(key);
            }
            Ok(out)
        },
        TargetKind::Colgroup { .. } | TargetKind::Index(_) => {
            Err(Error::unsupported(format!("truncate of {}", target.uri)))
        },
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.conn.is_closed() {
            let mut txn = self.txn.lock();
            if txn.explicit || txn.has_writes() {
                if txn.prepared {
                    warn!(session = self.id, "session closed with a prepared transaction; rolling back");
                }
                if let Err(e) = self.rollback_locked(&mut txn) {
                    warn!(session = self.id, error = %e, "rollback on session close failed");
                }
            }
        }
        self.conn.txn.unpin_reader(self.id);
        self.conn.session_closed(self.id);
        self.conn.env.stats.decr(Stat::SessionOpen);
        debug!(session = self.id, "session closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::conn::Connection;

    fn open_table(dir: &std::path::Path) -> Connection {
        let conn = Connection::open(dir, "create").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        conn
    }

    fn put(session: &Session, key: i64, value: &str) -> Result<()> {
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(key);
        c.set_value(value);
        c.insert()
    }

    fn get(session: &Session, key: i64) -> Result<String> {
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(key);
        c.search()?;
        Ok(c.get_value()?.as_str().unwrap().to_string())
    }

    #[test]
    fn test_commit_makes_changes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let writer = conn.open_session("").unwrap();
        let reader = conn.open_session("").unwrap();

        writer.begin_transaction("").unwrap();
        put(&writer, 1, "one").unwrap();
        assert_eq!(get(&writer, 1).unwrap(), "one");
        assert!(get(&reader, 1).unwrap_err().is_not_found());
        writer.commit_transaction("").unwrap();
        assert_eq!(get(&reader, 1).unwrap(), "one");
        assert_eq!(conn.stat(Stat::TxnCommit), 1);
    }

    #[test]
    fn test_rollback_discards_changes() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let session = conn.open_session("").unwrap();
        session.begin_transaction("").unwrap();
        put(&session, 1, "gone").unwrap();
        session.rollback_transaction("").unwrap();
        assert!(get(&session, 1).unwrap_err().is_not_found());
    }

    #[test]
    fn test_first_updater_wins() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let a = conn.open_session("").unwrap();
        let b = conn.open_session("").unwrap();
        put(&a, 1, "base").unwrap();

        a.begin_transaction("").unwrap();
        b.begin_transaction("").unwrap();
        put(&a, 1, "from a").unwrap();
        let err = put(&b, 1, "from b").unwrap_err();
        assert!(err.is_rollback());
        // The failed transaction stays doomed until rolled back.
        assert!(put(&b, 2, "other").unwrap_err().is_rollback());
        b.rollback_transaction("").unwrap();
        a.commit_transaction("").unwrap();
        assert_eq!(get(&b, 1).unwrap(), "from a");
    }

    #[test]
    fn test_commit_timestamp_rules() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        conn.set_timestamp("oldest_timestamp=10,stable_timestamp=20").unwrap();
        let session = conn.open_session("").unwrap();

        session.begin_transaction("").unwrap();
        put(&session, 1, "x").unwrap();
        let err = session.commit_transaction("commit_timestamp=20").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(!session.in_transaction());
        assert!(get(&session, 1).unwrap_err().is_not_found());

        session.begin_transaction("").unwrap();
        put(&session, 1, "x").unwrap();
        session.commit_transaction("commit_timestamp=21").unwrap();

        // Older than the committed version of the same key.
        conn.set_timestamp("stable_timestamp=20").unwrap();
        session.begin_transaction("").unwrap();
        session.timestamp_transaction("commit_timestamp=30").unwrap();
        assert_eq!(session.query_timestamp("get=commit").unwrap(), "30");
        put(&session, 2, "y").unwrap();
        session.commit_transaction("").unwrap();
        session.begin_transaction("").unwrap();
        put(&session, 2, "z").unwrap();
        assert!(matches!(session.commit_transaction("commit_timestamp=25"), Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_read_timestamp_sees_history() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let session = conn.open_session("").unwrap();
        for (ts, value) in [(10, "ten"), (20, "twenty")] {
            session.begin_transaction("").unwrap();
            put(&session, 1, value).unwrap();
            session.commit_transaction(&format!("commit_timestamp={ts:x}")).unwrap();
        }
        session.begin_transaction("read_timestamp=f").unwrap();
        assert_eq!(get(&session, 1).unwrap(), "ten");
        assert_eq!(session.query_timestamp_uint(TimestampQuery::Read).unwrap(), 15);
        session.rollback_transaction("").unwrap();
        session.begin_transaction("read_timestamp=5").unwrap();
        assert!(get(&session, 1).unwrap_err().is_not_found());
        session.rollback_transaction("").unwrap();
    }

    #[test]
    fn test_prepare_rules() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        conn.set_timestamp("oldest_timestamp=10,stable_timestamp=20").unwrap();
        let session = conn.open_session("").unwrap();

        session.begin_transaction("").unwrap();
        put(&session, 1, "p").unwrap();
        assert!(matches!(session.prepare_transaction("prepare_timestamp=20"), Err(Error::InvalidArgument { .. })));
        session.prepare_transaction("prepare_timestamp=30").unwrap();
        assert!(matches!(put(&session, 2, "no"), Err(Error::InvalidArgument { .. })));
        assert!(matches!(
            session.commit_transaction("commit_timestamp=29,durable_timestamp=31"),
            Err(Error::InvalidArgument { .. })
        ));

        session.begin_transaction("").unwrap();
        put(&session, 1, "p").unwrap();
        session.timestamp_transaction("commit_timestamp=40").unwrap();
        assert!(matches!(session.prepare_transaction("prepare_timestamp=30"), Err(Error::InvalidArgument { .. })));
        session.rollback_transaction("").unwrap();

        session.begin_transaction("").unwrap();
        put(&session, 1, "p").unwrap();
        session.prepare_transaction("prepare_timestamp=30").unwrap();
        session.commit_transaction("commit_timestamp=30,durable_timestamp=32").unwrap();
        assert_eq!(get(&session, 1).unwrap(), "p");
    }

    #[test]
    fn test_prepare_refused_after_logged_write() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,log=(enabled)").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        session.begin_transaction("").unwrap();
        put(&session, 1, "logged").unwrap();
        assert!(matches!(session.prepare_transaction("prepare_timestamp=10"), Err(Error::InvalidArgument { .. })));
        session.rollback_transaction("").unwrap();
    }

    #[test]
    fn test_ignore_prepare_true_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let session = conn.open_session("").unwrap();
        session.begin_transaction("ignore_prepare=true").unwrap();
        assert!(matches!(put(&session, 1, "x"), Err(Error::InvalidArgument { .. })));
        session.rollback_transaction("").unwrap();
        session.begin_transaction("ignore_prepare=force").unwrap();
        put(&session, 1, "x").unwrap();
        session.commit_transaction("").unwrap();
    }

    #[test]
    fn test_checkpoint_refused_in_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let session = conn.open_session("").unwrap();
        session.begin_transaction("").unwrap();
        assert!(matches!(session.checkpoint(""), Err(Error::InvalidArgument { .. })));
        assert!(matches!(session.begin_transaction(""), Err(Error::InvalidArgument { .. })));
        session.rollback_transaction("").unwrap();
        session.checkpoint("").unwrap();
    }

    #[test]
    fn test_truncate_range_and_whole_object() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let session = conn.open_session("").unwrap();
        for i in 0..100 {
            put(&session, i, "v").unwrap();
        }
        let mut start = session.open_cursor("table:t", "").unwrap();
        let mut stop = session.open_cursor("table:t", "").unwrap();
        start.set_key(10i64);
        stop.set_key(19i64);
        session.truncate(None, Some(&start), Some(&stop), "").unwrap();
        drop((start, stop));
        assert!(get(&session, 15).unwrap_err().is_not_found());
        assert_eq!(get(&session, 20).unwrap(), "v");
        assert_eq!(get(&session, 9).unwrap(), "v");

        session.truncate(Some("table:t"), None, None, "").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        assert!(c.next().unwrap_err().is_not_found());
    }

    #[test]
    fn test_session_close_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let session = conn.open_session("").unwrap();
        session.begin_transaction("").unwrap();
        put(&session, 1, "pending").unwrap();
        session.close();
        let other = conn.open_session("").unwrap();
        assert!(get(&other, 1).unwrap_err().is_not_found());
        assert_eq!(conn.stat(Stat::SessionOpen), 1);
    }

    #[test]
    fn test_log_flush_needs_log() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_table(dir.path());
        let session = conn.open_session("").unwrap();
        assert!(matches!(session.log_flush(""), Err(Error::InvalidArgument { .. })));
        session.log_printf("ignored without a log").unwrap();
    }
}
