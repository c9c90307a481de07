//! Engine statistics.
//!
//! Every statistic has a stable numeric id (its position in [`Stat::ALL`]),
//! a short name and a description. The connection keeps one [`Stats`] set
//! and every btree keeps its own for `statistics:<uri>` cursors.

use std::sync::atomic::{AtomicI64, Ordering};

macro_rules! define_stats {
    ($($variant:ident => $name:literal, $desc:literal;)+) => {
        /// A statistic.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Stat {
            $(
                #[doc = $desc]
                $variant,
            )+
        }

        impl Stat {
            /// Every statistic in id order.
            pub const ALL: &'static [Stat] = &[$(Stat::$variant),+];

            /// Short identifier.
            pub fn name(self) -> &'static str {
                match self {
                    $(Stat::$variant => $name,)+
                }
            }

            /// Human-readable description.
            pub fn description(self) -> &'static str {
                match self {
                    $(Stat::$variant => $desc,)+
                }
            }
        }
    };
}

define_stats! {
    BackgroundCompactBytesRecovered => "background_compact_bytes_recovered", "background-compact: bytes recovered";
    BackgroundCompactRunning => "background_compact_running", "background-compact: running";
    BackgroundCompactSkipped => "background_compact_skipped", "background-compact: files skipped";
    BackgroundCompactSuccess => "background_compact_success", "background-compact: files compacted";
    BackupCursorOpen => "backup_cursor_open", "backup: cursors opened";
    BlockBytesRead => "block_bytes_read", "block-manager: bytes read";
    BlockBytesWritten => "block_bytes_written", "block-manager: bytes written";
    BlockRead => "block_read", "block-manager: blocks read";
    BlockWrite => "block_write", "block-manager: blocks written";
    CacheBytesDirty => "cache_bytes_dirty", "cache: tracked dirty bytes in the cache";
    CacheBytesInuse => "cache_bytes_inuse", "cache: bytes currently in the cache";
    CacheBytesMax => "cache_bytes_max", "cache: maximum bytes configured";
    CacheBytesUpdates => "cache_bytes_updates", "cache: bytes allocated for updates";
    CacheEvictionFail => "cache_eviction_fail", "cache: pages selected for eviction unable to be evicted";
    CachePagesEvicted => "cache_pages_evicted", "cache: pages evicted";
    CachePagesRead => "cache_pages_read", "cache: pages read into cache";
    CcPagesRead => "cc_pages_read", "checkpoint-cleanup: pages read into cache";
    CheckpointState => "checkpoint_state", "checkpoint: progress state";
    CursorInsert => "cursor_insert", "cursor: insert calls";
    CursorModify => "cursor_modify", "cursor: modify calls";
    CursorNext => "cursor_next", "cursor: next calls";
    CursorPrev => "cursor_prev", "cursor: prev calls";
    CursorRemove => "cursor_remove", "cursor: remove calls";
    CursorReserve => "cursor_reserve", "cursor: reserve calls";
    CursorSearch => "cursor_search", "cursor: search calls";
    CursorSearchNear => "cursor_search_near", "cursor: search near calls";
    CursorUpdate => "cursor_update", "cursor: update calls";
    DhSweepDeadClose => "dh_sweep_dead_close", "data-handle: connection sweep dead dhandles closed";
    DisaggBlockGetCold => "disagg_block_get_cold", "disagg: cold page log reads";
    DisaggBlockPutCold => "disagg_block_put_cold", "disagg: cold page log writes";
    FlushTier => "flush_tier", "checkpoint: flush_tier operations";
    FsyncAllFhTotal => "fsync_all_fh_total", "block-manager: background fsync file handles synced";
    HsInsert => "hs_insert", "history: history store table insert calls";
    HsRead => "hs_read", "history: history store table reads";
    HsRemoved => "hs_removed", "history: history store obsolete entries removed";
    LiveRestoreState => "live_restore_state", "live-restore: state";
    LogBytesWritten => "log_bytes_written", "log: log bytes written";
    LogFilesCreated => "log_files_created", "log: log files created";
    LogFilesRemoved => "log_files_removed", "log: log files removed";
    LogSync => "log_sync", "log: log sync operations";
    NoSessionSweep5min => "no_session_sweep_5min", "session: sessions with no sweep for 5 minutes";
    NoSessionSweep60min => "no_session_sweep_60min", "session: sessions with no sweep for 60 minutes";
    RecOverflowKeyLeaf => "rec_overflow_key_leaf", "reconciliation: leaf overflow keys written";
    RecOverflowValue => "rec_overflow_value", "reconciliation: overflow values written";
    RecPageDeleteFast => "rec_page_delete_fast", "reconciliation: fast-path pages deleted";
    RecPageDeltaLeaf => "rec_page_delta_leaf", "reconciliation: leaf page deltas written";
    RecPages => "rec_pages", "reconciliation: page reconciliation calls";
    RecTimeWindowDurableStartTs => "rec_time_window_durable_start_ts", "reconciliation: records written including a start durable timestamp";
    RecTimeWindowDurableStopTs => "rec_time_window_durable_stop_ts", "reconciliation: records written including a stop durable timestamp";
    RecTimeWindowPrepared => "rec_time_window_prepared", "reconciliation: records written including a prepare";
    RecTimeWindowStartTs => "rec_time_window_start_ts", "reconciliation: records written including a start timestamp";
    RecTimeWindowStartTxn => "rec_time_window_start_txn", "reconciliation: records written including a start transaction ID";
    RecTimeWindowStopTs => "rec_time_window_stop_ts", "reconciliation: records written including a stop timestamp";
    RecTimeWindowStopTxn => "rec_time_window_stop_txn", "reconciliation: records written including a stop transaction ID";
    SessionOpen => "session_open", "session: open session count";
    TxnBegin => "txn_begin", "transaction: transaction begins";
    TxnCheckpoint => "txn_checkpoint", "transaction: transaction checkpoints";
    TxnCommit => "txn_commit", "transaction: transactions committed";
    TxnPrepare => "txn_prepare", "transaction: prepared transactions";
    TxnRollback => "txn_rollback", "transaction: transactions rolled back";
    TxnRts => "txn_rts", "transaction: rollback to stable calls";
    TxnRtsHsRemoved => "txn_rts_hs_removed", "transaction: rollback to stable history store records with stop timestamps older than stable";
    TxnRtsKeysRemoved => "txn_rts_keys_removed", "transaction: rollback to stable keys removed";
    TxnRtsKeysRestored => "txn_rts_keys_restored", "transaction: rollback to stable keys restored";
    TxnRtsPagesVisited => "txn_rts_pages_visited", "transaction: rollback to stable pages visited";
    TxnRtsUpdAborted => "txn_rts_upd_aborted", "transaction: rollback to stable updates aborted";
}

impl Stat {
    /// Stable numeric id.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Looks a statistic up by id.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// Looks a statistic up by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.name() == name)
    }

    /// Statistics that report a current level rather than a running count.
    fn is_gauge(self) -> bool {
        matches!(
            self,
            Stat::CacheBytesMax
                | Stat::CacheBytesInuse
                | Stat::CacheBytesDirty
                | Stat::CacheBytesUpdates
                | Stat::CheckpointState
                | Stat::LiveRestoreState
                | Stat::BackgroundCompactRunning
                | Stat::SessionOpen
                | Stat::NoSessionSweep5min
                | Stat::NoSessionSweep60min
        )
    }
}

/// One row of a statistics cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    pub stat: Stat,
    pub description: &'static str,
    pub value: i64,
}

impl StatEntry {
    /// The printable form of the value.
    pub fn printable(&self) -> String {
        self.value.to_string()
    }
}

/// A set of statistics counters.
#[derive(Debug)]
pub struct Stats {
    values: Box<[AtomicI64]>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self { values: Stat::ALL.iter().map(|_| AtomicI64::new(0)).collect() }
    }

    #[inline]
    pub fn incr(&self, stat: Stat) {
        self.add(stat, 1);
    }

    #[inline]
    pub fn add(&self, stat: Stat, n: u64) {
        self.values[stat as usize].fetch_add(n as i64, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr(&self, stat: Stat) {
        self.values[stat as usize].fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set(&self, stat: Stat, value: i64) {
        self.values[stat as usize].store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, stat: Stat) -> i64 {
        self.values[stat as usize].load(Ordering::Relaxed)
    }

    /// Zeroes running counts, leaving gauges alone (`statistics=(clear)`).
    pub fn clear(&self) {
        for stat in Stat::ALL {
            if !stat.is_gauge() {
                self.set(*stat, 0);
            }
        }
    }

    /// Current values of every statistic.
    pub fn snapshot(&self) -> Vec<StatEntry> {
        Stat::ALL
            .iter()
            .map(|&stat| StatEntry { stat, description: stat.description(), value: self.get(stat) })
            .collect()
    }

    /// Non-zero values as a JSON object keyed by name, used by the statistics log.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = Stat::ALL
            .iter()
            .filter(|s| self.get(**s) != 0)
            .map(|s| (s.name().to_string(), serde_json::Value::from(self.get(*s))))
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_positions() {
        for (i, stat) in Stat::ALL.iter().enumerate() {
            assert_eq!(stat.id() as usize, i);
            assert_eq!(Stat::from_id(stat.id()), Some(*stat));
            assert_eq!(Stat::from_name(stat.name()), Some(*stat));
        }
    }

    #[test]
    fn test_counters_and_clear() {
        let stats = Stats::new();
        stats.incr(Stat::TxnRts);
        stats.add(Stat::TxnRtsUpdAborted, 10);
        stats.set(Stat::CacheBytesMax, 1 << 20);
        stats.clear();
        assert_eq!(stats.get(Stat::TxnRts), 0);
        assert_eq!(stats.get(Stat::CacheBytesMax), 1 << 20);
    }

    #[test]
    fn test_snapshot_lists_every_stat() {
        let stats = Stats::new();
        stats.incr(Stat::RecPageDeleteFast);
        let rows = stats.snapshot();
        assert_eq!(rows.len(), Stat::ALL.len());
        let row = rows.iter().find(|r| r.stat == Stat::RecPageDeleteFast).unwrap();
        assert_eq!(row.printable(), "1");
        assert_eq!(stats.to_json()["rec_page_delete_fast"], 1);
    }
}
