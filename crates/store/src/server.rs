//! Background servers.
//!
//! Each server is a named thread running one cycle at a time and sleeping
//! on a shared [`Signal`] between cycles. Intervals are read from the live
//! configuration on every cycle, so `reconfigure` takes effect without a
//! restart. A failed cycle is logged and retried on the next tick; servers
//! never take the connection down.
//!
//! Servers hold a weak reference to the connection and exit once it is
//! gone or [`Servers::stop`] is called.

use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::Write,
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use cellar_types::config::{CheckpointConfig, CompactConfig, SyncMethod, TimingStress};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::checkpoint,
    conn::ConnInner,
    error::Result,
    evict::{evict_pass, evict_tree},
    page::cache::Pressure,
    stats::Stat,
};

/// Prefix of statistics log files; the date follows.
pub const STATS_LOG_PREFIX: &str = "CellarStat.";

const EVICT_INTERVAL: Duration = Duration::from_millis(100);
const LOG_INTERVAL: Duration = Duration::from_secs(1);
const COMPACT_INTERVAL: Duration = Duration::from_secs(1);
/// How often the checkpoint server looks at log growth.
const LOG_SIZE_POLL: Duration = Duration::from_millis(250);
const AGGRESSIVE_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
/// Session sweep ages reported by the `no_session_sweep` statistics.
const SWEEP_AGE_SHORT: Duration = Duration::from_secs(5 * 60);
const SWEEP_AGE_LONG: Duration = Duration::from_secs(60 * 60);

/// Stop flag shared by every server thread.
#[derive(Debug, Default)]
struct Signal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    /// Sleeps up to `timeout`. Returns true once the servers are stopping.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cv.wait_for(&mut stopped, timeout);
        }
        *stopped
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    fn wake(&self) {
        self.cv.notify_all();
    }
}

/// Running background servers of a connection.
pub(crate) struct Servers {
    signal: Arc<Signal>,
    /// Background compaction settings while it is enabled.
    compact: Arc<Mutex<Option<CompactConfig>>>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Servers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Servers").field("threads", &self.threads.len()).finish()
    }
}

impl Servers {
    /// Starts the servers the configuration asks for.
    ///
    /// # Errors
    ///
    /// Fails when a thread cannot be spawned.
    pub fn start(conn: &Arc<ConnInner>) -> Result<Self> {
        let config = conn.env.config();
        let mut servers =
            Self { signal: Arc::new(Signal::default()), compact: Arc::new(Mutex::new(None)), threads: Vec::new() };
        let writable = !config.readonly;

        let workers = config.eviction.threads_max.max(config.eviction.threads_min).max(1);
        for worker in 0..workers {
            let eager = worker < config.eviction.threads_min.max(1);
            servers.spawn(conn, format!("cellar-evict-{worker}"), move |c| EvictServer { eager }.run(c))?;
        }
        if writable {
            servers.spawn(conn, "cellar-checkpoint".into(), |c| CheckpointServer::default().run(c))?;
            let compact = servers.compact.clone();
            servers.spawn(conn, "cellar-compact".into(), move |c| CompactServer { enabled: compact }.run(c))?;
        }
        if conn.log.is_some() {
            servers.spawn(conn, "cellar-log".into(), |c| LogServer.run(c))?;
        }
        servers.spawn(conn, "cellar-stats-log".into(), |c| StatsLogServer.run(c))?;
        servers.spawn(conn, "cellar-sweep".into(), |c| SweepServer::default().run(c))?;
        if conn.live_restore.is_some() {
            for worker in 0..config.live_restore.threads_max.max(1) {
                servers.spawn(conn, format!("cellar-restore-{worker}"), |c| MigrateServer.run(c))?;
            }
        }
        debug!(threads = servers.threads.len(), "background servers started");
        Ok(servers)
    }

    fn spawn<F>(&mut self, conn: &Arc<ConnInner>, name: String, body: F) -> Result<()>
    where
        F: FnOnce(Ctx) + Send + 'static,
    {
        let ctx = Ctx { conn: Arc::downgrade(conn), signal: self.signal.clone() };
        let handle = std::thread::Builder::new().name(name).spawn(move || body(ctx))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Turns background compaction on with `cfg`, or off with `None`.
    pub fn set_background_compact(&self, cfg: Option<CompactConfig>) {
        let on = cfg.is_some();
        let was = std::mem::replace(&mut *self.compact.lock(), cfg).is_some();
        if was != on {
            info!(enabled = on, "background compaction toggled");
            self.signal.wake();
        }
    }

    pub fn background_compact(&self) -> bool {
        self.compact.lock().is_some()
    }

    /// Signals every server and waits for them to exit.
    pub fn stop(self) {
        self.signal.stop();
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("background server panicked");
            }
        }
    }
}

/// What a server thread sees.
struct Ctx {
    conn: Weak<ConnInner>,
    signal: Arc<Signal>,
}

impl Ctx {
    /// The connection, while it is open and the servers run.
    fn conn(&self) -> Option<Arc<ConnInner>> {
        if self.signal.is_stopped() {
            return None;
        }
        self.conn.upgrade().filter(|c| !c.is_closed())
    }
}

/// Evicts while the cache is above its targets. Workers that are not
/// `eager` only help once application threads would have to.
struct EvictServer {
    eager: bool,
}

impl EvictServer {
    fn run(self, ctx: Ctx) {
        loop {
            if ctx.signal.wait(EVICT_INTERVAL) {
                return;
            }
            let Some(conn) = ctx.conn() else { return };
            self.run_cycle(&conn);
        }
    }

    fn run_cycle(&self, conn: &ConnInner) {
        let config = conn.env.config();
        let aggressive = config.debug_mode.eviction;
        let threshold = if self.eager { Pressure::Target } else { Pressure::Trigger };
        if !aggressive && conn.env.cache.pressure() < threshold {
            return;
        }
        if let Err(e) = evict_pass(conn, aggressive) {
            warn!(error = %e, "eviction pass failed");
        }
    }
}

/// Checkpoints every `checkpoint.wait` seconds, and whenever the log has
/// grown by `checkpoint.log_size` bytes.
#[derive(Default)]
struct CheckpointServer {
    last_log_bytes: u64,
}

impl CheckpointServer {
    fn run(mut self, ctx: Ctx) {
        let mut last = Instant::now();
        loop {
            if ctx.signal.wait(LOG_SIZE_POLL) {
                return;
            }
            let Some(conn) = ctx.conn() else { return };
            let config = conn.env.config();
            let by_time = config.checkpoint.wait > 0 && last.elapsed() >= Duration::from_secs(config.checkpoint.wait);
            let written = conn.log.as_ref().map_or(0, |log| log.bytes_written());
            let by_log = config.checkpoint.log_size > 0 && written - self.last_log_bytes >= config.checkpoint.log_size;
            if by_time || by_log {
                self.last_log_bytes = written;
                last = Instant::now();
                self.run_cycle(&conn, by_log);
            }
        }
    }

    fn run_cycle(&self, conn: &ConnInner, by_log: bool) {
        match checkpoint(conn, &CheckpointConfig::default()) {
            Ok(()) => debug!(by_log, "checkpoint server ran"),
            Err(e) => warn!(error = %e, "checkpoint server failed"),
        }
    }
}

/// Flushes the log so unsynced commits reach disk within
/// `io_capacity.fsync_maximum_wait_period`.
struct LogServer;

impl LogServer {
    fn run(self, ctx: Ctx) {
        loop {
            let period = ctx
                .conn()
                .map(|c| c.env.config().io_capacity.fsync_maximum_wait_period)
                .filter(|p| *p > 0)
                .map_or(LOG_INTERVAL, Duration::from_secs);
            if ctx.signal.wait(period) {
                return;
            }
            let Some(conn) = ctx.conn() else { return };
            self.run_cycle(&conn);
        }
    }

    fn run_cycle(&self, conn: &ConnInner) {
        let Some(log) = &conn.log else { return };
        let config = conn.env.config();
        let method = if config.transaction_sync.enabled { config.transaction_sync.method } else { SyncMethod::Fsync };
        let method = if config.io_capacity.fsync_maximum_wait_period > 0 { SyncMethod::Fsync } else { method };
        if let Err(e) = log.flush(method) {
            warn!(error = %e, "log flush failed");
            return;
        }
        conn.env.stats.incr(Stat::FsyncAllFhTotal);
    }
}

/// Appends a statistics line every `statistics_log.wait` seconds.
struct StatsLogServer;

impl StatsLogServer {
    fn run(self, ctx: Ctx) {
        let mut last = Instant::now();
        loop {
            if ctx.signal.wait(LOG_SIZE_POLL) {
                return;
            }
            let Some(conn) = ctx.conn() else { return };
            let wait = conn.env.config().statistics_log.wait;
            if wait > 0 && last.elapsed() >= Duration::from_secs(wait) {
                last = Instant::now();
                if let Err(e) = write_stats_log(&conn) {
                    warn!(error = %e, "statistics log write failed");
                }
            }
        }
    }
}

/// Writes one statistics log entry to `CellarStat.<date>` in the home
/// directory: a JSON object per line with `json`, else one
/// `<time> <description> <value>` line per non-zero statistic.
///
/// # Errors
///
/// Fails when the file cannot be written.
pub(crate) fn write_stats_log(conn: &ConnInner) -> Result<()> {
    let config = conn.env.config();
    let now = chrono::Local::now();
    let path = conn.home.join(format!("{STATS_LOG_PREFIX}{}", now.format("%Y-%m-%d")));
    let mut out = String::new();
    if config.statistics_log.json {
        let mut sources = serde_json::Map::new();
        for tree in conn.user_trees() {
            if !config.statistics_log.sources.is_empty()
                && !config.statistics_log.sources.iter().any(|s| tree.name.starts_with(s.as_str()))
            {
                continue;
            }
            sources.insert(tree.name.clone(), tree.stats.to_json());
        }
        let line = serde_json::json!({
            "localTime": now.to_rfc3339(),
            "cellar": conn.env.stats.to_json(),
            "sources": sources,
        });
        out.push_str(&line.to_string());
        out.push('\n');
    } else {
        let stamp = now.format("%b %d %H:%M:%S");
        for entry in conn.env.stats.snapshot().into_iter().filter(|e| e.value != 0) {
            out.push_str(&format!("{stamp} {} {}\n", entry.description, entry.printable()));
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    file.write_all(out.as_bytes())?;
    debug!(path = %path.display(), "statistics logged");
    Ok(())
}

/// Sweeps obsolete history, and closes trees nobody has touched for
/// `file_manager.close_idle_time` by evicting their pages.
#[derive(Default)]
struct SweepServer {
    idle_since: HashMap<u64, Instant>,
}

impl SweepServer {
    fn run(mut self, ctx: Ctx) {
        loop {
            let interval = ctx
                .conn()
                .map(|c| {
                    let config = c.env.config();
                    if config.stress(TimingStress::AggressiveSweep) {
                        AGGRESSIVE_SWEEP_INTERVAL
                    } else {
                        Duration::from_secs(config.file_manager.close_scan_interval.max(1))
                    }
                })
                .unwrap_or(AGGRESSIVE_SWEEP_INTERVAL);
            if ctx.signal.wait(interval) {
                return;
            }
            let Some(conn) = ctx.conn() else { return };
            self.run_cycle(&conn);
        }
    }

    fn run_cycle(&mut self, conn: &ConnInner) {
        conn.env.stress(TimingStress::HistoryStoreSweepRace);
        let hs_stats = &conn.hs.tree().stats;
        let pages_before = hs_stats.get(Stat::CachePagesRead);
        match conn.hs.sweep(&conn.txn.visible_all()) {
            Ok(0) => {},
            Ok(removed) => debug!(removed, "history sweep"),
            Err(e) => warn!(error = %e, "history sweep failed"),
        }
        let pages_read = hs_stats.get(Stat::CachePagesRead) - pages_before;
        if pages_read > 0 {
            conn.env.stats.add(Stat::CcPagesRead, pages_read as u64);
        }
        conn.env.stats.set(Stat::NoSessionSweep5min, conn.sessions_unswept_for(SWEEP_AGE_SHORT) as i64);
        conn.env.stats.set(Stat::NoSessionSweep60min, conn.sessions_unswept_for(SWEEP_AGE_LONG) as i64);

        let config = conn.env.config();
        let trees = conn.user_trees();
        let idle_time = config.file_manager.close_idle_time;
        if idle_time == 0 || (trees.len() as u64) < config.file_manager.close_handle_minimum {
            self.idle_since.clear();
            return;
        }
        conn.env.stress(TimingStress::AggressiveSweep);
        let now = Instant::now();
        self.idle_since.retain(|id, _| trees.iter().any(|t| t.id == *id));
        for tree in trees {
            if conn.handle_open(tree.id) {
                self.idle_since.remove(&tree.id);
                continue;
            }
            let since = *self.idle_since.entry(tree.id).or_insert(now);
            if now.duration_since(since) < Duration::from_secs(idle_time) {
                continue;
            }
            match evict_tree(conn, &tree) {
                Ok(pages) => {
                    self.idle_since.remove(&tree.id);
                    if pages > 0 {
                        conn.env.stats.incr(Stat::DhSweepDeadClose);
                        debug!(tree = %tree.name, pages, "idle tree swept");
                    }
                },
                Err(e) => warn!(tree = %tree.name, error = %e, "handle sweep failed"),
            }
        }
    }
}

/// Copies live-restore chunks until every file is migrated.
struct MigrateServer;

impl MigrateServer {
    fn run(self, ctx: Ctx) {
        loop {
            let Some(conn) = ctx.conn() else { return };
            let Some(restore) = &conn.live_restore else { return };
            match restore.migrate_step() {
                Ok(true) => {},
                Ok(false) => {
                    debug!("live restore migration finished");
                    return;
                },
                Err(e) => {
                    warn!(error = %e, "live restore migration step failed");
                    drop(conn);
                    if ctx.signal.wait(LOG_INTERVAL) {
                        return;
                    }
                },
            }
        }
    }
}

/// Compacts files with reclaimable space while enabled through
/// `compact(background=true)`.
struct CompactServer {
    enabled: Arc<Mutex<Option<CompactConfig>>>,
}

impl CompactServer {
    fn run(self, ctx: Ctx) {
        loop {
            if ctx.signal.wait(COMPACT_INTERVAL) {
                return;
            }
            let Some(conn) = ctx.conn() else { return };
            let cfg = self.enabled.lock().clone();
            conn.env.stats.set(Stat::BackgroundCompactRunning, i64::from(cfg.is_some()));
            if let Some(cfg) = cfg {
                self.run_cycle(&conn, &cfg);
            }
        }
    }

    fn run_cycle(&self, conn: &ConnInner, cfg: &CompactConfig) {
        match crate::compact::background_pass(conn, cfg) {
            Ok(0) => {},
            Ok(files) => debug!(files, "background compaction pass"),
            Err(e) => warn!(error = %e, "background compaction failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::conn::Connection;

    #[test]
    fn test_signal_wakes_waiters_on_stop() {
        let signal = Arc::new(Signal::default());
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait(Duration::from_secs(60)))
        };
        std::thread::sleep(Duration::from_millis(20));
        signal.stop();
        assert!(waiter.join().unwrap());
        assert!(signal.wait(Duration::from_secs(60)));
    }

    #[test]
    fn test_checkpoint_server_runs_on_wait() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,checkpoint=(wait=1)").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        cellar_test_utils::assert_eventually(Duration::from_secs(10), || conn.stat(Stat::TxnCheckpoint) > 0);
    }

    #[test]
    fn test_stats_log_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,statistics=(all),statistics_log=(json,wait=1)").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        write_stats_log(conn.inner()).unwrap();
        let file = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().starts_with(STATS_LOG_PREFIX))
            .unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert!(first["cellar"].is_object());
        assert!(first["localTime"].is_string());
    }

    #[test]
    fn test_stop_joins_every_thread() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,log=(enabled)").unwrap();
        let servers = conn.inner().servers.lock().take().unwrap();
        assert!(!servers.background_compact());
        servers.set_background_compact(Some(CompactConfig::default()));
        assert!(servers.background_compact());
        servers.stop();
    }
}
