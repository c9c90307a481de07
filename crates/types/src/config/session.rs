//! Session, transaction, cursor and maintenance configuration.

use super::{ConfigError, ConfigReader, ConfigSection};
use crate::timestamp::Timestamp;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Sees uncommitted updates.
    ReadUncommitted,
    /// Takes a fresh snapshot for every read.
    ReadCommitted,
    /// One snapshot for the whole transaction.
    #[default]
    Snapshot,
}

impl Isolation {
    fn name(self) -> &'static str {
        match self {
            Isolation::ReadUncommitted => "read-uncommitted",
            Isolation::ReadCommitted => "read-committed",
            Isolation::Snapshot => "snapshot",
        }
    }

    fn read(r: &mut ConfigReader<'_>, current: Self) -> Result<Self, ConfigError> {
        Ok(match r.choice("isolation", current.name(), &["read-uncommitted", "read-committed", "snapshot"])? {
            "read-uncommitted" => Isolation::ReadUncommitted,
            "read-committed" => Isolation::ReadCommitted,
            _ => Isolation::Snapshot,
        })
    }
}

/// How a reader treats prepared updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnorePrepare {
    /// Prepared updates raise a prepare conflict.
    #[default]
    False,
    /// Prepared updates are skipped; the transaction is read-only.
    True,
    /// Prepared updates are skipped and writes are still allowed.
    Force,
}

/// Log durability for a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitSync {
    /// Use the connection's `transaction_sync` setting.
    #[default]
    Default,
    /// Write and sync the log.
    Full,
    /// Write the log without syncing.
    Write,
    /// Leave the record buffered.
    None,
}

fn read_sync(r: &mut ConfigReader<'_>, key: &str, current: CommitSync) -> Result<CommitSync, ConfigError> {
    if !r.contains(key) {
        return Ok(current);
    }
    let raw = r.choice(key, "on", &["on", "off", "true", "false", "full", "write", "none"])?;
    Ok(match raw {
        "on" | "true" | "full" => CommitSync::Full,
        "write" => CommitSync::Write,
        _ => CommitSync::None,
    })
}

/// Options for opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionConfig {
    /// Default isolation for transactions started by this session.
    pub isolation: Isolation,
    /// Longest an application thread waits on eviction, in milliseconds (0 = unbounded).
    pub cache_max_wait_ms: u64,
    /// Operations in this session never help with eviction.
    pub ignore_cache_size: bool,
}

impl ConfigSection for SessionConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.isolation = Isolation::read(r, self.isolation)?;
        self.cache_max_wait_ms = r.int("cache_max_wait_ms", self.cache_max_wait_ms as i64, 0, i64::MAX)? as u64;
        self.ignore_cache_size = r.bool("ignore_cache_size", self.ignore_cache_size)?;
        Ok(())
    }
}

/// Options for `begin_transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BeginTransactionConfig {
    /// Isolation; inherits the session default when absent.
    pub isolation: Option<Isolation>,
    /// Read as of this timestamp.
    pub read_timestamp: Option<Timestamp>,
    /// Prepared-update handling.
    pub ignore_prepare: IgnorePrepare,
    /// Reclaim a recovered prepared transaction by its prepared id.
    pub claim_prepared: Option<u64>,
    /// Round a read timestamp older than `oldest` up to `oldest`.
    pub roundup_read: bool,
    /// Round a prepare timestamp older than `oldest` up to `oldest`.
    pub roundup_prepared: bool,
    /// Commit without a timestamp even on timestamped tables.
    pub no_timestamp: bool,
    /// Transaction name, for diagnostics.
    pub name: Option<String>,
    /// Commit durability override.
    pub sync: CommitSync,
    /// Transaction priority (-100..=100); unused except for diagnostics.
    pub priority: i32,
}

impl ConfigSection for BeginTransactionConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if r.contains("isolation") {
            self.isolation = Some(Isolation::read(r, self.isolation.unwrap_or_default())?);
        }
        if let Some(ts) = r.timestamp("read_timestamp")? {
            self.read_timestamp = Some(ts);
        }
        let current = match self.ignore_prepare {
            IgnorePrepare::False => "false",
            IgnorePrepare::True => "true",
            IgnorePrepare::Force => "force",
        };
        self.ignore_prepare = match r.choice("ignore_prepare", current, &["false", "true", "force"])? {
            "true" => IgnorePrepare::True,
            "force" => IgnorePrepare::Force,
            _ => IgnorePrepare::False,
        };
        if let Some(id) = r.timestamp("claim_prepared")? {
            self.claim_prepared = Some(id);
        }
        if let Some(mut roundup) = r.nested("roundup_timestamps")? {
            self.roundup_read = roundup.bool("read", self.roundup_read)?;
            self.roundup_prepared = roundup.bool("prepared", self.roundup_prepared)?;
            roundup.finish()?;
        }
        self.no_timestamp = r.bool("no_timestamp", self.no_timestamp)?;
        if let Some(name) = r.string("name")? {
            self.name = Some(name);
        }
        self.sync = read_sync(r, "sync", self.sync)?;
        self.priority = r.int("priority", i64::from(self.priority), -100, 100)? as i32;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_prepared.is_some() && self.read_timestamp.is_some() {
            return Err(ConfigError::Validation {
                message: "claim_prepared cannot be combined with read_timestamp".to_string(),
            });
        }
        if self.claim_prepared == Some(0) {
            return Err(ConfigError::Validation { message: "prepared id 0 is reserved".to_string() });
        }
        Ok(())
    }
}

/// Options for `commit_transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitConfig {
    /// Commit timestamp.
    pub commit_timestamp: Option<Timestamp>,
    /// Durable timestamp (prepared transactions).
    pub durable_timestamp: Option<Timestamp>,
    /// Durability override.
    pub sync: CommitSync,
    /// Milliseconds an operation may run before the transaction is rolled back (0 = off).
    pub operation_timeout_ms: u64,
}

impl ConfigSection for CommitConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if let Some(ts) = r.timestamp("commit_timestamp")? {
            self.commit_timestamp = Some(ts);
        }
        if let Some(ts) = r.timestamp("durable_timestamp")? {
            self.durable_timestamp = Some(ts);
        }
        self.sync = read_sync(r, "sync", self.sync)?;
        self.operation_timeout_ms =
            r.int("operation_timeout_ms", self.operation_timeout_ms as i64, 0, i64::MAX)? as u64;
        Ok(())
    }
}

/// Options for `prepare_transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrepareConfig {
    /// Prepare timestamp.
    pub prepare_timestamp: Option<Timestamp>,
    /// Stable identifier used to claim the transaction after restart.
    pub prepared_id: Option<u64>,
}

impl ConfigSection for PrepareConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if let Some(ts) = r.timestamp("prepare_timestamp")? {
            self.prepare_timestamp = Some(ts);
        }
        if let Some(id) = r.timestamp("prepared_id")? {
            self.prepared_id = Some(id);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.prepared_id == Some(0) {
            return Err(ConfigError::Validation { message: "prepared id 0 is reserved".to_string() });
        }
        Ok(())
    }
}

/// Options for `rollback_transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RollbackConfig {
    /// Rollback timestamp for prepared transactions.
    pub rollback_timestamp: Option<Timestamp>,
    /// Milliseconds an operation may run (0 = off).
    pub operation_timeout_ms: u64,
}

impl ConfigSection for RollbackConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if let Some(ts) = r.timestamp("rollback_timestamp")? {
            self.rollback_timestamp = Some(ts);
        }
        self.operation_timeout_ms =
            r.int("operation_timeout_ms", self.operation_timeout_ms as i64, 0, i64::MAX)? as u64;
        Ok(())
    }
}

/// Options for `timestamp_transaction` on a running transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimestampConfig {
    /// Commit timestamp for subsequent updates.
    pub commit_timestamp: Option<Timestamp>,
    /// Durable timestamp.
    pub durable_timestamp: Option<Timestamp>,
    /// Prepare timestamp.
    pub prepare_timestamp: Option<Timestamp>,
    /// Read timestamp (only before the first read).
    pub read_timestamp: Option<Timestamp>,
}

impl ConfigSection for TimestampConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        for (key, slot) in [
            ("commit_timestamp", &mut self.commit_timestamp),
            ("durable_timestamp", &mut self.durable_timestamp),
            ("prepare_timestamp", &mut self.prepare_timestamp),
            ("read_timestamp", &mut self.read_timestamp),
        ] {
            if let Some(ts) = r.timestamp(key)? {
                *slot = Some(ts);
            }
        }
        Ok(())
    }
}

/// Which timestamp a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampQuery {
    /// Newest commit timestamp of any committed transaction.
    #[default]
    AllDurable,
    /// The last checkpoint's stable timestamp.
    LastCheckpoint,
    /// The oldest timestamp.
    Oldest,
    /// The oldest timestamp any reader may still use.
    OldestReader,
    /// The pinned timestamp.
    Pinned,
    /// The checkpoint recovery started from.
    Recovery,
    /// The stable timestamp.
    Stable,
    /// The checkpoint timestamp pinned by the open backup cursor.
    BackupCheckpoint,
    /// Transaction-level: commit timestamp.
    Commit,
    /// Transaction-level: first commit timestamp.
    FirstCommit,
    /// Transaction-level: prepare timestamp.
    Prepare,
    /// Transaction-level: read timestamp.
    Read,
}

const QUERY_NAMES: [(&str, TimestampQuery); 14] = [
    ("all_durable", TimestampQuery::AllDurable),
    ("last_checkpoint", TimestampQuery::LastCheckpoint),
    ("oldest_timestamp", TimestampQuery::Oldest),
    ("oldest", TimestampQuery::Oldest),
    ("oldest_reader", TimestampQuery::OldestReader),
    ("pinned", TimestampQuery::Pinned),
    ("recovery", TimestampQuery::Recovery),
    ("stable_timestamp", TimestampQuery::Stable),
    ("stable", TimestampQuery::Stable),
    ("backup_checkpoint", TimestampQuery::BackupCheckpoint),
    ("commit", TimestampQuery::Commit),
    ("first_commit", TimestampQuery::FirstCommit),
    ("prepare", TimestampQuery::Prepare),
    ("read", TimestampQuery::Read),
];

/// Options for `query_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryTimestampConfig {
    /// What to return.
    pub get: TimestampQuery,
}

impl ConfigSection for QueryTimestampConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        let names: Vec<&'static str> = QUERY_NAMES.iter().map(|(n, _)| *n).collect();
        let current = QUERY_NAMES.iter().find(|(_, q)| *q == self.get).map_or("all_durable", |(n, _)| *n);
        let chosen = r.choice("get", current, &names)?;
        self.get = QUERY_NAMES.iter().find(|(n, _)| *n == chosen).map_or(self.get, |(_, q)| *q);
        Ok(())
    }
}

/// Options for connection-level `set_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnTimestampConfig {
    /// New oldest timestamp.
    pub oldest_timestamp: Option<Timestamp>,
    /// New stable timestamp.
    pub stable_timestamp: Option<Timestamp>,
    /// New durable timestamp (recovery only).
    pub durable_timestamp: Option<Timestamp>,
    /// Allow timestamps to move backwards.
    pub force: bool,
}

impl ConfigSection for ConnTimestampConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        for (key, slot) in [
            ("oldest_timestamp", &mut self.oldest_timestamp),
            ("stable_timestamp", &mut self.stable_timestamp),
            ("durable_timestamp", &mut self.durable_timestamp),
        ] {
            if let Some(ts) = r.timestamp(key)? {
                *slot = Some(ts);
            }
        }
        self.force = r.bool("force", self.force)?;
        Ok(())
    }
}

/// Options for `checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Named checkpoint; `None` writes the default checkpoint.
    pub name: Option<String>,
    /// Write a checkpoint even when nothing changed.
    pub force: bool,
    /// Checkpoint at the stable timestamp.
    pub use_timestamp: bool,
    /// Publish to shared storage (disaggregated leader).
    pub flush_tier: bool,
    /// Named checkpoints to drop.
    pub drop: Vec<String>,
    /// Restrict the checkpoint to these URIs.
    pub target: Vec<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { name: None, force: false, use_timestamp: true, flush_tier: false, drop: Vec::new(), target: Vec::new() }
    }
}

impl ConfigSection for CheckpointConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if let Some(name) = r.string("name")? {
            self.name = Some(name);
        }
        self.force = r.bool("force", self.force)?;
        self.use_timestamp = r.bool("use_timestamp", self.use_timestamp)?;
        if let Some(mut flush) = r.nested("flush_tier")? {
            self.flush_tier = flush.bool("enabled", self.flush_tier)?;
            flush.finish()?;
        }
        if let Some(drop) = r.list("drop")? {
            self.drop = drop;
        }
        if let Some(target) = r.list("target")? {
            self.target = target;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.name {
            if name.is_empty() || name.starts_with("WiredTiger") || name.contains(['/', ',', '(', ')']) {
                return Err(ConfigError::Validation { message: format!("invalid checkpoint name '{name}'") });
            }
        }
        Ok(())
    }
}

/// Options for opening a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorConfig {
    /// Insert overwrites and update does not require the key to exist.
    pub overwrite: bool,
    /// Column-store insert allocates a new record number.
    pub append: bool,
    /// Read from a named checkpoint.
    pub checkpoint: Option<String>,
    /// Backup cursor targets.
    pub target: Vec<String>,
    /// Keys and values are raw byte strings.
    pub raw: bool,
    /// Cursor may not write.
    pub readonly: bool,
    /// Evict the page when the cursor is reset.
    pub release_evict: bool,
    /// Statistics cursor options.
    pub statistics: Vec<String>,
    /// Bulk load into an empty table.
    pub bulk: bool,
    /// Incremental backup selector (`log:` style targets use `target`).
    pub incremental: bool,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            overwrite: true,
            append: false,
            checkpoint: None,
            target: Vec::new(),
            raw: false,
            readonly: false,
            release_evict: false,
            statistics: Vec::new(),
            bulk: false,
            incremental: false,
        }
    }
}

impl ConfigSection for CursorConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.overwrite = r.bool("overwrite", self.overwrite)?;
        self.append = r.bool("append", self.append)?;
        if let Some(name) = r.string("checkpoint")? {
            self.checkpoint = Some(name);
        }
        if let Some(target) = r.list("target")? {
            self.target = target;
        }
        self.raw = r.bool("raw", self.raw)?;
        self.readonly = r.bool("readonly", self.readonly)?;
        self.release_evict = r.bool("release_evict", self.release_evict)?;
        if let Some(stats) = r.list("statistics")? {
            self.statistics = stats;
        }
        self.bulk = r.bool("bulk", self.bulk)?;
        if let Some(mut incr) = r.nested("incremental")? {
            self.incremental = incr.bool("enabled", self.incremental)?;
            incr.finish()?;
        }
        Ok(())
    }
}

/// Which end of a cursor bound is being set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundSide {
    /// The smallest key the cursor may return.
    #[default]
    Lower,
    /// The largest key the cursor may return.
    Upper,
}

/// Options for `Cursor::bound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundConfig {
    /// `false` clears both bounds.
    pub set: bool,
    /// Which bound the cursor's current key becomes.
    pub side: BoundSide,
    /// Whether the bound key itself is in range.
    pub inclusive: bool,
}

impl Default for BoundConfig {
    fn default() -> Self {
        Self { set: true, side: BoundSide::Lower, inclusive: true }
    }
}

impl ConfigSection for BoundConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.set = r.choice("action", if self.set { "set" } else { "clear" }, &["set", "clear"])? == "set";
        let side = if self.side == BoundSide::Upper { "upper" } else { "lower" };
        self.side = match r.choice("bound", side, &["lower", "upper"])? {
            "upper" => BoundSide::Upper,
            _ => BoundSide::Lower,
        };
        self.inclusive = r.bool("inclusive", self.inclusive)?;
        Ok(())
    }
}

/// Options for `log_flush`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFlushConfig {
    /// Durability of the flush.
    pub sync: CommitSync,
}

impl Default for LogFlushConfig {
    fn default() -> Self {
        Self { sync: CommitSync::Full }
    }
}

impl ConfigSection for LogFlushConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.sync = read_sync(r, "sync", self.sync)?;
        Ok(())
    }
}

/// Options for `compact`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactConfig {
    /// Seconds before giving up (0 = no limit).
    pub timeout: u64,
    /// Skip files whose reclaimable space is below this.
    pub free_space_target: u64,
    /// Start (`Some(true)`) or stop (`Some(false)`) the background compaction server.
    pub background: Option<bool>,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self { timeout: 1200, free_space_target: 20 * 1024 * 1024, background: None }
    }
}

impl ConfigSection for CompactConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.timeout = r.int("timeout", self.timeout as i64, 0, i64::MAX)? as u64;
        self.free_space_target = r.size("free_space_target", self.free_space_target, 0, u64::MAX)?;
        if r.contains("background") {
            self.background = Some(r.bool("background", false)?);
        }
        Ok(())
    }
}

/// Options for `verify`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VerifyConfig {
    /// Also report every cell's time window.
    pub dump_cells: bool,
    /// Check the history store entries for this table.
    pub dump_history: bool,
    /// Skip historical (history store) consistency checks.
    pub stable_timestamp: bool,
    /// Read the file from disk, ignoring the in-memory tree.
    pub read_corrupt: bool,
    /// List every block address the tree references.
    pub dump_address: bool,
    /// List every page with its keys.
    pub dump_pages: bool,
}

impl ConfigSection for VerifyConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.dump_cells = r.bool("dump_cells", self.dump_cells)?;
        self.dump_history = r.bool("dump_history", self.dump_history)?;
        self.stable_timestamp = r.bool("stable_timestamp", self.stable_timestamp)?;
        self.read_corrupt = r.bool("read_corrupt", self.read_corrupt)?;
        self.dump_address = r.bool("dump_address", self.dump_address)?;
        self.dump_pages = r.bool("dump_pages", self.dump_pages)?;
        Ok(())
    }
}

/// Options for `rollback_to_stable`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtsConfig {
    /// Report what would be rolled back without changing anything.
    pub dryrun: bool,
    /// Worker threads (accepted, work runs on the calling thread).
    pub threads: u32,
}

impl ConfigSection for RtsConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.dryrun = r.bool("dryrun", self.dryrun)?;
        self.threads = r.int("threads", i64::from(self.threads), 0, 10)? as u32;
        Ok(())
    }
}

/// Options for `salvage`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SalvageConfig {
    /// Salvage even if the file header is unreadable.
    pub force: bool,
}

impl ConfigSection for SalvageConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.force = r.bool("force", self.force)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_transaction_options() {
        let config = BeginTransactionConfig::parse(
            "isolation=snapshot,read_timestamp=1e,ignore_prepare=force,roundup_timestamps=(read=true),sync=false",
        )
        .unwrap();
        assert_eq!(config.isolation, Some(Isolation::Snapshot));
        assert_eq!(config.read_timestamp, Some(0x1e));
        assert_eq!(config.ignore_prepare, IgnorePrepare::Force);
        assert!(config.roundup_read);
        assert!(!config.roundup_prepared);
        assert_eq!(config.sync, CommitSync::None);
    }

    #[test]
    fn test_begin_rejects_bad_ignore_prepare() {
        assert!(BeginTransactionConfig::parse("ignore_prepare=maybe").is_err());
        assert!(BeginTransactionConfig::parse("read_timestamp=xyz").is_err());
        assert!(BeginTransactionConfig::parse("bogus=1").is_err());
    }

    #[test]
    fn test_claim_prepared() {
        let config = BeginTransactionConfig::parse("claim_prepared=2a").unwrap();
        assert_eq!(config.claim_prepared, Some(0x2a));
        assert!(BeginTransactionConfig::parse("claim_prepared=0").is_err());
        assert!(BeginTransactionConfig::parse("claim_prepared=2a,read_timestamp=5").is_err());
    }

    #[test]
    fn test_commit_and_prepare() {
        let commit = CommitConfig::parse("commit_timestamp=a,durable_timestamp=b").unwrap();
        assert_eq!(commit.commit_timestamp, Some(10));
        assert_eq!(commit.durable_timestamp, Some(11));
        let prepare = PrepareConfig::parse("prepare_timestamp=5,prepared_id=7").unwrap();
        assert_eq!(prepare.prepare_timestamp, Some(5));
        assert_eq!(prepare.prepared_id, Some(7));
    }

    #[test]
    fn test_query_timestamp_aliases() {
        assert_eq!(QueryTimestampConfig::parse("get=stable").unwrap().get, TimestampQuery::Stable);
        assert_eq!(QueryTimestampConfig::parse("get=oldest").unwrap().get, TimestampQuery::Oldest);
        assert_eq!(QueryTimestampConfig::parse("").unwrap().get, TimestampQuery::AllDurable);
        assert!(QueryTimestampConfig::parse("get=bogus").is_err());
    }

    #[test]
    fn test_checkpoint_options() {
        let config = CheckpointConfig::parse("name=weekly,use_timestamp=false,drop=[old]").unwrap();
        assert_eq!(config.name.as_deref(), Some("weekly"));
        assert!(!config.use_timestamp);
        assert_eq!(config.drop, vec!["old".to_string()]);
        assert!(CheckpointConfig::parse("name=WiredTigerCheckpoint.3").is_err());
        let flush = CheckpointConfig::parse("flush_tier=(enabled=true)").unwrap();
        assert!(flush.flush_tier);
    }

    #[test]
    fn test_cursor_defaults_and_targets() {
        let config = CursorConfig::default();
        assert!(config.overwrite);
        let backup = CursorConfig::parse("target=(\"log:\")").unwrap();
        assert_eq!(backup.target, vec!["log:".to_string()]);
        let stats = CursorConfig::parse("statistics=(fast,clear)").unwrap();
        assert_eq!(stats.statistics, vec!["fast".to_string(), "clear".to_string()]);
    }

    #[test]
    fn test_bound_options() {
        let bound = BoundConfig::parse("bound=upper,inclusive=false").unwrap();
        assert!(bound.set);
        assert_eq!(bound.side, BoundSide::Upper);
        assert!(!bound.inclusive);
        assert!(!BoundConfig::parse("action=clear").unwrap().set);
        assert!(BoundConfig::parse("bound=middle").is_err());
    }

    #[test]
    fn test_rts_dryrun() {
        assert!(RtsConfig::parse("dryrun=true").unwrap().dryrun);
        assert!(RtsConfig::parse("threads=11").is_err());
    }
}
