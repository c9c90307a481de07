//! Metrics mirrored to the `metrics` facade.
//!
//! ## Metric Naming Conventions
//!
//! All metrics follow the pattern: `cellar_{subsystem}_{name}_{unit}`
//!
//! - Counters: `_total` suffix
//! - Histograms: `_seconds` or `_bytes` suffix
//! - Gauges: no suffix

use metrics::{counter, gauge, histogram};

// Checkpoint metrics
const CHECKPOINTS_TOTAL: &str = "cellar_checkpoints_total";
const CHECKPOINT_DURATION: &str = "cellar_checkpoint_duration_seconds";
const CHECKPOINT_PAGES: &str = "cellar_checkpoint_pages_written_total";

// Rollback-to-stable metrics
const RTS_TOTAL: &str = "cellar_rts_total";
const RTS_UPDATES_ABORTED: &str = "cellar_rts_updates_aborted_total";

// Eviction and cache metrics
const EVICTION_PAGES: &str = "cellar_eviction_pages_total";
const CACHE_BYTES: &str = "cellar_cache_bytes";
const CACHE_DIRTY_BYTES: &str = "cellar_cache_dirty_bytes";

// Log metrics
const LOG_BYTES_WRITTEN: &str = "cellar_log_bytes_written_total";
const LOG_SWITCHES: &str = "cellar_log_switches_total";

// Backup and restore metrics
const BACKUPS_OPENED: &str = "cellar_backups_opened_total";
const LIVE_RESTORE_STATE: &str = "cellar_live_restore_state";

// Transaction metrics
const TXN_COMMITS: &str = "cellar_txn_commits_total";
const TXN_ROLLBACKS: &str = "cellar_txn_rollbacks_total";

/// Records a completed checkpoint.
#[inline]
pub fn record_checkpoint(duration_secs: f64, pages: u64) {
    counter!(CHECKPOINTS_TOTAL).increment(1);
    counter!(CHECKPOINT_PAGES).increment(pages);
    histogram!(CHECKPOINT_DURATION).record(duration_secs);
}

/// Records a rollback-to-stable run.
#[inline]
pub fn record_rts(updates_aborted: u64) {
    counter!(RTS_TOTAL).increment(1);
    counter!(RTS_UPDATES_ABORTED).increment(updates_aborted);
}

/// Records evicted pages.
#[inline]
pub fn record_eviction(pages: u64) {
    counter!(EVICTION_PAGES).increment(pages);
}

/// Sets cache usage gauges.
#[inline]
pub fn set_cache_usage(bytes: u64, dirty: u64) {
    gauge!(CACHE_BYTES).set(bytes as f64);
    gauge!(CACHE_DIRTY_BYTES).set(dirty as f64);
}

/// Records bytes appended to the log.
#[inline]
pub fn record_log_write(bytes: u64) {
    counter!(LOG_BYTES_WRITTEN).increment(bytes);
}

/// Records a log file switch.
#[inline]
pub fn record_log_switch() {
    counter!(LOG_SWITCHES).increment(1);
}

/// Records a backup cursor open.
#[inline]
pub fn record_backup_opened() {
    counter!(BACKUPS_OPENED).increment(1);
}

/// Sets the live restore state gauge.
#[inline]
pub fn set_live_restore_state(state: u64) {
    gauge!(LIVE_RESTORE_STATE).set(state as f64);
}

/// Records a transaction outcome.
#[inline]
pub fn record_txn(committed: bool) {
    if committed {
        counter!(TXN_COMMITS).increment(1);
    } else {
        counter!(TXN_ROLLBACKS).increment(1);
    }
}
