//! Rollback to stable.
//!
//! Removes every change to a non-logged table that is newer than the stable
//! timestamp: in-memory updates are aborted, on-disk values written past
//! stable are replaced by the version that was current at stable (taken
//! back out of the history store) or removed when there was none, and
//! history entries that start past stable are deleted. Logged tables are
//! left alone; the log is their source of durability.
//!
//! Runs at open (recovery) and on demand while no transaction is active.

use std::collections::{BTreeMap, HashSet};

use cellar_types::{
    TS_NONE, Timestamp,
    config::{ConfigSection, RtsConfig},
};
use tracing::{debug, info};

use crate::{
    btree::{Btree, LeafPage, PageState},
    conn::ConnInner,
    error::{Error, Result},
    hs::HsEntry,
    metrics,
    page::{Cell, PrepareState, TimeWindow},
    stats::Stat,
    txn::TXN_ABORTED,
};

/// What a rollback to stable did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtsStats {
    pub pages_visited: u64,
    /// Keys whose on-disk value was removed with no stable version to restore.
    pub keys_removed: u64,
    /// Keys whose stable version came back from history or lost a stop.
    pub keys_restored: u64,
    /// In-memory updates aborted.
    pub upd_aborted: u64,
    /// History entries removed.
    pub hs_removed: u64,
}

impl RtsStats {
    fn merge(&mut self, other: RtsStats) {
        self.pages_visited += other.pages_visited;
        self.keys_removed += other.keys_removed;
        self.keys_restored += other.keys_restored;
        self.upd_aborted += other.upd_aborted;
        self.hs_removed += other.hs_removed;
    }
}

/// Rolls back on demand.
///
/// # Errors
///
/// [`Error::Busy`] while any transaction is running or reading.
pub(crate) fn rollback_to_stable(conn: &ConnInner, config: &str) -> Result<RtsStats> {
    let cfg = RtsConfig::parse(config)?;
    if conn.readonly() {
        return Err(Error::ReadOnly);
    }
    if conn.txn.active_count() > 0 {
        return Err(Error::busy("rollback_to_stable: transactions are active"));
    }
    let _ckpt = conn.checkpoint_lock.lock();
    run(conn, cfg.dryrun)
}

/// Rolls back after opening, before any session can read.
pub(crate) fn recover(conn: &ConnInner) -> Result<RtsStats> {
    let _ckpt = conn.checkpoint_lock.lock();
    run(conn, false)
}

fn run(conn: &ConnInner, dryrun: bool) -> Result<RtsStats> {
    let stable = conn.txn.ts.load().stable;
    let preserved: HashSet<u64> = conn.recovered.lock().values().map(|r| r.txn_id).collect();
    let mut stats = RtsStats::default();
    for tree in conn.user_trees() {
        if tree.is_logged() || tree.is_readonly() {
            continue;
        }
        let tree_stats = Rollback { conn, tree: &tree, stable, preserved: &preserved, dryrun }.tree()?;
        debug!(tree = %tree.name, ?tree_stats, "rolled back tree");
        stats.merge(tree_stats);
    }
    if !dryrun {
        conn.txn.ts.update(|r| {
            if stable != TS_NONE {
                r.durable = r.durable.min(stable);
                r.max_committed_durable = r.max_committed_durable.min(stable);
            }
            Ok(())
        })?;
    }

    let env_stats = &conn.env.stats;
    env_stats.incr(Stat::TxnRts);
    env_stats.add(Stat::TxnRtsPagesVisited, stats.pages_visited);
    env_stats.add(Stat::TxnRtsKeysRemoved, stats.keys_removed);
    env_stats.add(Stat::TxnRtsKeysRestored, stats.keys_restored);
    env_stats.add(Stat::TxnRtsUpdAborted, stats.upd_aborted);
    env_stats.add(Stat::TxnRtsHsRemoved, stats.hs_removed);
    metrics::record_rts(stats.upd_aborted);
    info!(stable, dryrun, ?stats, "rollback to stable complete");
    Ok(stats)
}

/// True when a point in time is newer than stable.
fn unstable(ts: Timestamp, durable: Timestamp, stable: Timestamp) -> bool {
    ts != TS_NONE && ts.max(durable) > stable
}

struct Rollback<'a> {
    conn: &'a ConnInner,
    tree: &'a Btree,
    stable: Timestamp,
    preserved: &'a HashSet<u64>,
    dryrun: bool,
}

impl Rollback<'_> {
    fn tree(&self) -> Result<RtsStats> {
        let mut stats = RtsStats::default();
        let mut history: BTreeMap<Vec<u8>, Vec<HsEntry>> = BTreeMap::new();
        for entry in self.conn.hs.entries(self.tree.id, None)? {
            history.entry(entry.key.clone()).or_default().push(entry);
        }

        for page in self.tree.pages() {
            let Some(mut st) = self.tree.lock_loaded(&page)? else { continue };
            stats.pages_visited += 1;
            let mut changed = self.page_del(&mut st, &mut stats);
            if let Some(leaf) = st.leaf.as_mut() {
                changed |= self.leaf(leaf, &mut history, &mut stats)?;
            }
            if changed && !self.dryrun {
                if let Some(leaf) = st.leaf.as_mut() {
                    leaf.prune_empty();
                }
                st.force_rewrite = true;
                self.tree.mark_dirty(&mut st);
            }
        }

        // History past stable for keys no longer on any page.
        for entries in history.values() {
            for entry in entries {
                if unstable(entry.cell.tw.start_ts, entry.cell.tw.durable_start_ts, self.stable) {
                    self.remove_history(entry, &mut stats)?;
                }
            }
        }
        Ok(stats)
    }

    /// Drops a fast-truncate marker written past stable.
    fn page_del(&self, st: &mut PageState, stats: &mut RtsStats) -> bool {
        let Some(del) = st.page_del else { return false };
        if del.prepare == PrepareState::InProgress && self.preserved.contains(&del.txn_id) {
            return false;
        }
        if !unstable(del.ts, del.durable_ts, self.stable) && del.prepare != PrepareState::InProgress {
            return false;
        }
        stats.keys_restored += st.leaf.as_ref().map_or(0, |leaf| leaf.slots.len() as u64);
        if !self.dryrun {
            st.page_del = None;
            self.tree.mark_root_dirty();
        }
        true
    }

    fn leaf(
        &self,
        leaf: &mut LeafPage,
        history: &mut BTreeMap<Vec<u8>, Vec<HsEntry>>,
        stats: &mut RtsStats,
    ) -> Result<bool> {
        let mut changed = false;
        let keys: Vec<Vec<u8>> = leaf.slots.keys().cloned().collect();
        for key in keys {
            let Some(slot) = leaf.slots.get(&key).cloned() else { continue };

            let mut holds_preserved = false;
            let mut aborted = Vec::new();
            for (idx, upd) in leaf.arena.chain(slot.head) {
                if upd.is_aborted() {
                    continue;
                }
                if upd.is_prepared() {
                    if self.preserved.contains(&upd.txn_id) {
                        holds_preserved = true;
                        continue;
                    }
                    aborted.push(idx);
                } else if unstable(upd.start_ts, upd.durable_ts, self.stable) {
                    aborted.push(idx);
                }
            }
            stats.upd_aborted += aborted.len() as u64;
            changed |= !aborted.is_empty();
            if !self.dryrun {
                for idx in aborted {
                    leaf.arena.get_mut(idx).txn_id = TXN_ABORTED;
                }
            }
            if holds_preserved {
                continue;
            }

            let entries = history.remove(&key).unwrap_or_default();
            let Some(cell) = slot.disk else {
                history.insert(key, entries);
                continue;
            };
            let tw = cell.tw;
            let restored = if unstable(tw.start_ts, tw.durable_start_ts, self.stable) || tw.prepared_start() {
                Some(self.stable_version(entries, stats)?)
            } else if tw.has_stop() && (unstable(tw.stop_ts, tw.durable_stop_ts, self.stable) || tw.prepared_stop()) {
                history.insert(key.clone(), entries);
                Some(Some(Cell::new(TimeWindow::starting(tw.start_txn, tw.start_ts, tw.durable_start_ts), cell.value)))
            } else {
                history.insert(key.clone(), entries);
                None
            };
            let Some(restored) = restored else { continue };
            changed = true;
            match &restored {
                Some(_) => stats.keys_restored += 1,
                None => stats.keys_removed += 1,
            }
            if !self.dryrun {
                if let Some(slot) = leaf.slots.get_mut(&key) {
                    slot.disk = restored;
                    slot.disk_in_hs = false;
                }
            }
        }
        Ok(changed)
    }

    /// Finds the version current at stable among a key's history entries,
    /// removing every entry newer than stable and the one brought back.
    fn stable_version(&self, entries: Vec<HsEntry>, stats: &mut RtsStats) -> Result<Option<Cell>> {
        let mut kept = Vec::new();
        for entry in entries {
            if unstable(entry.cell.tw.start_ts, entry.cell.tw.durable_start_ts, self.stable) {
                self.remove_history(&entry, stats)?;
            } else {
                kept.push(entry);
            }
        }
        // Oldest stop first: the last entry left is the newest stable one.
        let Some(newest) = kept.pop() else { return Ok(None) };
        let tw = newest.cell.tw;
        if !unstable(tw.stop_ts, tw.durable_stop_ts, self.stable) {
            // Deleted at or before stable.
            return Ok(None);
        }
        if !self.dryrun {
            self.conn.hs.remove(&newest)?;
        }
        let window = TimeWindow::starting(tw.start_txn, tw.start_ts, tw.durable_start_ts);
        Ok(Some(Cell::new(window, newest.cell.value)))
    }

    fn remove_history(&self, entry: &HsEntry, stats: &mut RtsStats) -> Result<()> {
        stats.hs_removed += 1;
        if !self.dryrun {
            self.conn.hs.remove(entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use crate::{conn::Connection, error::Error};

    fn write(conn: &Connection, key: i64, value: &str, ts: u64) {
        let session = conn.open_session("").unwrap();
        session.begin_transaction("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(key);
        c.set_value(value);
        c.insert().unwrap();
        drop(c);
        session.commit_transaction(&format!("commit_timestamp={ts:x}")).unwrap();
    }

    fn read(conn: &Connection, key: i64, ts: u64) -> Option<String> {
        let session = conn.open_session("").unwrap();
        session.begin_transaction(&format!("read_timestamp={ts:x}")).unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(key);
        let found = match c.search() {
            Ok(()) => Some(c.get_value().unwrap().as_str().unwrap().to_string()),
            Err(e) if e.is_not_found() => None,
            Err(e) => panic!("{e}"),
        };
        drop(c);
        session.rollback_transaction("").unwrap();
        found
    }

    fn setup() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        conn.set_timestamp("oldest_timestamp=1,stable_timestamp=1").unwrap();
        (dir, conn)
    }

    #[test]
    fn test_updates_past_stable_are_aborted() {
        let (_dir, conn) = setup();
        write(&conn, 1, "a", 0x10);
        write(&conn, 1, "b", 0x20);
        write(&conn, 2, "new", 0x30);
        conn.set_timestamp("stable_timestamp=15").unwrap();
        let stats = conn.rollback_to_stable("").unwrap();
        assert_eq!(stats.upd_aborted, 2);
        assert_eq!(read(&conn, 1, 0x40).as_deref(), Some("a"));
        assert_eq!(read(&conn, 2, 0x40), None);
        assert_eq!(conn.stat(crate::stats::Stat::TxnRts), 1);
    }

    #[test]
    fn test_checkpointed_values_restored_from_history() {
        let (dir, conn) = setup();
        write(&conn, 1, "a", 0x10);
        write(&conn, 1, "b", 0x20);
        conn.set_timestamp("stable_timestamp=20").unwrap();
        conn.open_session("").unwrap().checkpoint("use_timestamp=false").unwrap();
        drop(conn);

        // The checkpoint holds "b" at 0x20 with "a" in history; stable was 0x20.
        let conn = Connection::open(dir.path(), "").unwrap();
        conn.set_timestamp("stable_timestamp=18,force=true").unwrap();
        let stats = conn.rollback_to_stable("").unwrap();
        assert_eq!(stats.keys_restored, 1);
        assert_eq!(read(&conn, 1, 0x40).as_deref(), Some("a"));
    }

    #[test]
    fn test_busy_with_active_transaction() {
        let (_dir, conn) = setup();
        let session = conn.open_session("").unwrap();
        session.begin_transaction("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1i64);
        let _ = c.search();
        let err = conn.rollback_to_stable("").unwrap_err();
        assert!(matches!(err, Error::Busy { .. }));
    }

    #[test]
    fn test_dryrun_changes_nothing() {
        let (_dir, conn) = setup();
        write(&conn, 1, "a", 0x10);
        let stats = conn.rollback_to_stable("dryrun=true").unwrap();
        assert_eq!(stats.upd_aborted, 1);
        assert_eq!(read(&conn, 1, 0x40).as_deref(), Some("a"));
    }
}
