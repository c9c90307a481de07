//! Connections.
//!
//! A [`Connection`] owns everything sessions share: the open btrees, the
//! history store, the metadata file, the log, the transaction manager and
//! the background servers. Sessions hold a reference to the shared state
//! and stay usable from any thread; a session itself is single-threaded.
//!
//! Dropping a connection without [`Connection::close`] stops the servers
//! and releases the lock file but skips the final checkpoint, which is how
//! tests simulate a crash.
//!
//! ## Structure
//!
//! - `open.rs`: opening, recovery and shutdown
//! - `schema_ops.rs`: create, alter, drop, rename and cursor targets

mod open;
mod schema_ops;

use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use cellar_types::{
    TS_NONE, Timestamp,
    config::{ConfigSection, ConnTimestampConfig, ParsedConfig, QueryTimestampConfig, TimestampQuery},
    timestamp::format_hex,
};
use parking_lot::{Mutex, RwLock};
pub(crate) use schema_ops::{DataTarget, IndexTarget, Layered, TargetKind};
use tracing::{info, warn};

use crate::{
    backup::BackupState,
    btree::Btree,
    disagg::Disagg,
    env::Env,
    error::{Error, Result},
    hs::{HS_BTREE_ID, HistoryStore},
    live_restore::LiveRestore,
    log::Log,
    meta::{MetaHook, MetaImage, MetaStore},
    page::cache::CacheUsage,
    rts::RtsStats,
    server::Servers,
    session::Session,
    stats::{Stat, StatEntry},
    txn::{RecoveredPrepared, TxnGlobal},
};

/// Name of the lock file guarding a home directory.
pub const LOCK_FILE: &str = "CELLAR.lock";

/// Name of the version marker file.
pub const VERSION_FILE: &str = "CELLAR";

/// Connection-level timestamps an application may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnTimestamp {
    Oldest,
    Stable,
    Durable,
}

/// Transaction-level timestamps an application may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnTimestamp {
    Commit,
    Durable,
    Prepare,
    Read,
}

/// Metadata file plus the image last committed to it.
pub(crate) struct MetaState {
    pub store: MetaStore,
    pub image: MetaImage,
}

impl MetaState {
    /// Durably writes the current image.
    pub fn commit(&mut self) -> Result<()> {
        self.store.commit(&self.image)
    }
}

/// State shared by a connection and its sessions.
pub(crate) struct ConnInner {
    pub home: PathBuf,
    pub env: Arc<Env>,
    pub txn: TxnGlobal,
    pub trees: RwLock<HashMap<u64, Arc<Btree>>>,
    pub hs: HistoryStore,
    pub meta: Mutex<MetaState>,
    pub log: Option<Log>,
    /// Serializes schema changes.
    pub schema_lock: Mutex<()>,
    /// Serializes checkpoints (and compaction, which checkpoints).
    pub checkpoint_lock: Mutex<()>,
    /// Commits take this shared; a checkpoint takes it exclusively while
    /// it captures its snapshot so no commit straddles the capture.
    pub commit_gate: RwLock<()>,
    /// Open cursors per btree id.
    handles: Mutex<HashMap<u64, usize>>,
    /// Open checkpoint cursors per checkpoint name.
    ckpt_pins: Mutex<HashMap<String, usize>>,
    pub backup: Mutex<Option<BackupState>>,
    /// Prepared transactions found at recovery and not yet claimed, by prepared id.
    pub recovered: Mutex<BTreeMap<u64, RecoveredPrepared>>,
    pub live_restore: Option<LiveRestore>,
    pub disagg: Option<Disagg>,
    pub servers: Mutex<Option<Servers>>,
    next_session: AtomicU64,
    /// When each open session last swept its cursor cache.
    session_sweeps: Mutex<HashMap<u64, Instant>>,
    lock_file: Mutex<Option<File>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnInner").field("home", &self.home).finish()
    }
}

impl ConnInner {
    /// Fails once the connection is closed or panicked.
    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid("connection is closed"));
        }
        self.env.check_panic()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn readonly(&self) -> bool {
        self.env.config().readonly
    }

    /// Open tree by btree id.
    pub fn tree(&self, id: u64) -> Result<Arc<Btree>> {
        if id == HS_BTREE_ID {
            return Ok(self.hs.tree().clone());
        }
        self.trees.read().get(&id).cloned().ok_or_else(|| Error::invalid(format!("no open btree with id {id}")))
    }

    /// Every open user tree, in id order.
    pub fn user_trees(&self) -> Vec<Arc<Btree>> {
        let mut trees: Vec<Arc<Btree>> = self.trees.read().values().cloned().collect();
        trees.sort_by_key(|t| t.id);
        trees
    }

    /// Every open tree including the history store, history store last.
    pub fn all_trees(&self) -> Vec<Arc<Btree>> {
        let mut trees = self.user_trees();
        trees.push(self.hs.tree().clone());
        trees
    }

    /// Counts a cursor against each tree so schema changes can refuse.
    pub fn hold(self: &Arc<Self>, ids: Vec<u64>) -> HandleGuard {
        let mut handles = self.handles.lock();
        for id in &ids {
            *handles.entry(*id).or_default() += 1;
        }
        HandleGuard { conn: self.clone(), ids, checkpoint: None }
    }

    /// Like [`hold`](Self::hold), also pinning a named checkpoint.
    pub fn hold_checkpoint(self: &Arc<Self>, ids: Vec<u64>, name: &str) -> HandleGuard {
        *self.ckpt_pins.lock().entry(name.to_string()).or_default() += 1;
        let mut guard = self.hold(ids);
        guard.checkpoint = Some(name.to_string());
        guard
    }

    pub fn handle_open(&self, id: u64) -> bool {
        self.handles.lock().get(&id).is_some_and(|n| *n > 0)
    }

    pub fn checkpoint_pinned(&self, name: &str) -> bool {
        self.ckpt_pins.lock().get(name).is_some_and(|n| *n > 0)
    }

    pub fn any_checkpoint_pinned(&self) -> bool {
        self.ckpt_pins.lock().values().any(|n| *n > 0)
    }

    fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Records that session `id` swept its cursor cache.
    pub fn session_swept(&self, id: u64) {
        self.session_sweeps.lock().insert(id, Instant::now());
    }

    pub fn session_closed(&self, id: u64) {
        self.session_sweeps.lock().remove(&id);
    }

    /// Open sessions that have not swept for at least `age`.
    pub fn sessions_unswept_for(&self, age: Duration) -> usize {
        let now = Instant::now();
        self.session_sweeps.lock().values().filter(|at| now.duration_since(**at) >= age).count()
    }

    /// Sets connection timestamps.
    pub fn set_timestamp(&self, cfg: &ConnTimestampConfig) -> Result<()> {
        self.check_open()?;
        if let Some(ts) = cfg.stable_timestamp {
            if ts != TS_NONE && !cfg.force {
                let record = self.txn.ts.load();
                let oldest = cfg.oldest_timestamp.unwrap_or(record.oldest);
                if oldest != TS_NONE && ts < oldest {
                    return Err(Error::invalid(format!(
                        "set_timestamp: stable timestamp {} must not be older than oldest timestamp {}",
                        format_hex(ts),
                        format_hex(oldest)
                    )));
                }
            }
        }
        self.txn.ts.set(cfg)?;
        Ok(())
    }

    /// Answers a connection-level timestamp query.
    pub fn query_timestamp(&self, query: TimestampQuery) -> Result<Timestamp> {
        self.check_open()?;
        let record = self.txn.ts.load();
        Ok(match query {
            TimestampQuery::AllDurable => record.all_durable(),
            TimestampQuery::LastCheckpoint => record.last_checkpoint,
            TimestampQuery::Oldest => record.oldest,
            TimestampQuery::OldestReader => self.txn.oldest_reader_ts().unwrap_or(TS_NONE),
            TimestampQuery::Pinned => self.txn.pinned_ts(),
            TimestampQuery::Recovery => record.recovery,
            TimestampQuery::Stable => record.stable,
            TimestampQuery::BackupCheckpoint => record.backup_checkpoint,
            other => {
                return Err(Error::invalid(format!("query_timestamp: {other:?} is a transaction timestamp")));
            },
        })
    }
}

/// Releases cursor holds on drop.
pub(crate) struct HandleGuard {
    conn: Arc<ConnInner>,
    ids: Vec<u64>,
    checkpoint: Option<String>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        {
            let mut handles = self.conn.handles.lock();
            for id in &self.ids {
                if let Some(n) = handles.get_mut(id) {
                    *n = n.saturating_sub(1);
                }
            }
        }
        if let Some(name) = &self.checkpoint {
            if let Some(n) = self.conn.ckpt_pins.lock().get_mut(name) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

impl std::fmt::Debug for HandleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleGuard").field("ids", &self.ids).finish()
    }
}

/// An open database.
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("home", &self.inner.home).finish()
    }
}

impl Connection {
    /// Opens (or with `create`, creates) the database in `home`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an invalid configuration string
    /// - [`Error::Busy`] when another connection holds the home directory
    /// - [`Error::RunRecovery`] when recovery is needed and `log=(recover=error)`
    /// - [`Error::Corruption`] / [`Error::Panic`] for damaged files
    pub fn open(home: impl AsRef<Path>, config: &str) -> Result<Self> {
        let inner = open::open(home.as_ref(), config)?;
        Ok(Self { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<ConnInner> {
        &self.inner
    }

    /// Home directory.
    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Fails for an invalid configuration or when `session_max` sessions are open.
    pub fn open_session(&self, config: &str) -> Result<Session> {
        self.inner.check_open()?;
        let open = self.inner.env.stats.get(Stat::SessionOpen);
        if open >= i64::from(self.inner.env.config().session_max) {
            return Err(Error::busy(format!("session_max ({open}) sessions already open")));
        }
        let id = self.inner.next_session_id();
        Session::new(self.inner.clone(), id, config)
    }

    /// Checkpoints and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the first error of the final checkpoint or log flush; the
    /// connection is closed either way.
    pub fn close(self, config: &str) -> Result<()> {
        let parsed = ParsedConfig::parse(config)?;
        let mut r = parsed.reader();
        let _leak = r.bool("leak_memory", false)?;
        r.finish()?;
        open::shutdown(&self.inner, true)
    }

    /// Applies a runtime reconfiguration.
    ///
    /// `disaggregated=(role=leader)` on a follower promotes it: ingest
    /// contents drain into the stable tables and the tables reopen
    /// writable. Either every step succeeds or the node stays a follower.
    ///
    /// # Errors
    ///
    /// Fails for invalid configuration; a failed promotion leaves the old configuration.
    pub fn reconfigure(&self, config: &str) -> Result<()> {
        self.inner.check_open()?;
        let current = self.inner.env.config();
        let next = current.reconfigure(config)?;
        let parsed = ParsedConfig::parse(config)?;
        let mut r = parsed.reader();
        let clear = match r.list("statistics") {
            Ok(Some(items)) => items.iter().any(|i| i == "clear"),
            _ => false,
        };
        if let Some(disagg) = &self.inner.disagg {
            disagg.reconfigure(&self.inner, &current, &next)?;
        }
        self.inner.env.set_config(next);
        if clear {
            self.inner.env.stats.clear();
            for tree in self.inner.all_trees() {
                tree.stats.clear();
            }
        }
        info!(config, "connection reconfigured");
        Ok(())
    }

    /// Sets global timestamps from `oldest_timestamp`, `stable_timestamp`,
    /// `durable_timestamp` and `force`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when the result would put oldest after stable.
    pub fn set_timestamp(&self, config: &str) -> Result<()> {
        let cfg = ConnTimestampConfig::parse(config)?;
        self.inner.set_timestamp(&cfg)
    }

    /// Typed form of [`set_timestamp`](Self::set_timestamp).
    ///
    /// # Errors
    ///
    /// Same as [`set_timestamp`](Self::set_timestamp).
    pub fn set_timestamp_uint(&self, which: ConnTimestamp, ts: Timestamp) -> Result<()> {
        let mut cfg = ConnTimestampConfig::default();
        match which {
            ConnTimestamp::Oldest => cfg.oldest_timestamp = Some(ts),
            ConnTimestamp::Stable => cfg.stable_timestamp = Some(ts),
            ConnTimestamp::Durable => cfg.durable_timestamp = Some(ts),
        }
        self.inner.set_timestamp(&cfg)
    }

    /// Returns a connection timestamp as lowercase hex.
    ///
    /// # Errors
    ///
    /// Fails for unknown or transaction-level queries.
    pub fn query_timestamp(&self, config: &str) -> Result<String> {
        let cfg = QueryTimestampConfig::parse(config)?;
        Ok(format_hex(self.inner.query_timestamp(cfg.get)?))
    }

    /// Typed form of [`query_timestamp`](Self::query_timestamp).
    ///
    /// # Errors
    ///
    /// Fails for transaction-level queries.
    pub fn query_timestamp_uint(&self, query: TimestampQuery) -> Result<Timestamp> {
        self.inner.query_timestamp(query)
    }

    /// Rolls every non-logged table back to the stable timestamp.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while transactions are active.
    pub fn rollback_to_stable(&self, config: &str) -> Result<RtsStats> {
        self.inner.check_open()?;
        crate::rts::rollback_to_stable(&self.inner, config)
    }

    /// Loads the newest checkpoint published to the page log (followers).
    ///
    /// # Errors
    ///
    /// Fails when the connection is not a disaggregated follower.
    pub fn advance_checkpoint(&self) -> Result<u64> {
        self.inner.check_open()?;
        match &self.inner.disagg {
            Some(disagg) => disagg.advance(&self.inner, None),
            None => Err(Error::invalid("advance_checkpoint requires disaggregated storage")),
        }
    }

    /// Installs a crash hook on the metadata file.
    pub fn set_meta_hook(&self, hook: Option<MetaHook>) {
        self.inner.meta.lock().store.set_hook(hook);
    }

    /// Current cache usage.
    pub fn cache_usage(&self) -> CacheUsage {
        self.inner.env.cache.usage()
    }

    /// One connection statistic.
    pub fn stat(&self, stat: Stat) -> i64 {
        self.inner.env.refresh_cache_stats();
        self.inner.env.stats.get(stat)
    }

    /// Every connection statistic.
    pub fn statistics(&self) -> Vec<StatEntry> {
        self.inner.env.refresh_cache_stats();
        self.inner.env.stats.snapshot()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.inner.is_closed() {
            return;
        }
        warn!(home = %self.inner.home.display(), "connection dropped without close");
        if let Err(e) = open::shutdown(&self.inner, false) {
            warn!(error = %e, "shutdown after drop failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_round_trip_as_hex() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        conn.set_timestamp("oldest_timestamp=a,stable_timestamp=1e").unwrap();
        assert_eq!(conn.query_timestamp("get=stable_timestamp").unwrap(), "1e");
        assert_eq!(conn.query_timestamp_uint(TimestampQuery::Oldest).unwrap(), 10);
        conn.set_timestamp_uint(ConnTimestamp::Stable, 40).unwrap();
        assert_eq!(conn.query_timestamp_uint(TimestampQuery::Stable).unwrap(), 40);
        assert!(conn.query_timestamp("get=commit").is_err());
        conn.close("").unwrap();
    }

    #[test]
    fn test_oldest_may_not_pass_stable() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        conn.set_timestamp("stable_timestamp=10").unwrap();
        let err = conn.set_timestamp("oldest_timestamp=20").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        conn.set_timestamp("oldest_timestamp=5").unwrap();
        conn.set_timestamp("oldest_timestamp=3").unwrap();
        assert_eq!(conn.query_timestamp_uint(TimestampQuery::Oldest).unwrap(), 5);
        conn.close("").unwrap();
    }

    #[test]
    fn test_second_connection_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let err = Connection::open(dir.path(), "").unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));
        drop(conn);
        Connection::open(dir.path(), "").unwrap().close("").unwrap();
    }

    #[test]
    fn test_reconfigure_clears_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,statistics=(fast)").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=S,value_format=S").unwrap();
        {
            let mut c = session.open_cursor("table:t", "").unwrap();
            c.set_key("a");
            c.set_value("1");
            c.insert().unwrap();
        }
        assert!(conn.stat(Stat::CursorInsert) > 0);
        assert!(conn.stat(Stat::CacheBytesInuse) > 0);
        assert_eq!(conn.inner.sessions_unswept_for(Duration::ZERO), 1);
        assert_eq!(conn.inner.sessions_unswept_for(Duration::from_secs(3600)), 0);
        conn.reconfigure("statistics=(fast,clear)").unwrap();
        assert_eq!(conn.stat(Stat::CursorInsert), 0);
        assert!(conn.reconfigure("no_such_key=1").is_err());
        drop(session);
        conn.close("").unwrap();
    }
}
