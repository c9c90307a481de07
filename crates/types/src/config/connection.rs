//! Connection-level configuration.
//!
//! One record per subsystem. [`ConnectionConfig::reconfigure`] accepts only
//! the subset of keys that may change on a live connection.

use super::{ConfigError, ConfigReader, ConfigSection, ParsedConfig};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;
const TB: u64 = 1024 * GB;

/// Default cache size: 100 MB.
pub const DEFAULT_CACHE_SIZE: u64 = 100 * MB;
/// Smallest accepted cache: 1 MB.
pub const MIN_CACHE_SIZE: u64 = MB;
/// Largest accepted cache: 10 TB.
pub const MAX_CACHE_SIZE: u64 = 10 * TB;

/// Eviction worker pool bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionConfig {
    /// Minimum eviction worker threads.
    pub threads_min: u32,
    /// Maximum eviction worker threads.
    pub threads_max: u32,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self { threads_min: 1, threads_max: 8 }
    }
}

impl ConfigSection for EvictionConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.threads_min = r.int("threads_min", i64::from(self.threads_min), 1, 20)? as u32;
        self.threads_max = r.int("threads_max", i64::from(self.threads_max), 1, 20)? as u32;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.threads_min > self.threads_max {
            return Err(ConfigError::Validation {
                message: format!(
                    "eviction threads_min {} exceeds threads_max {}",
                    self.threads_min, self.threads_max
                ),
            });
        }
        Ok(())
    }
}

/// Cache pressure thresholds, as percentages of the cache size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionThresholds {
    /// Background eviction starts above this total usage.
    pub target: u8,
    /// Application threads help evict above this total usage.
    pub trigger: u8,
    /// Background eviction of dirty pages starts above this dirty usage.
    pub dirty_target: u8,
    /// Application threads help above this dirty usage.
    pub dirty_trigger: u8,
    /// Update-chain bytes target (0 = half of `dirty_target`).
    pub updates_target: u8,
    /// Update-chain bytes trigger (0 = half of `dirty_trigger`).
    pub updates_trigger: u8,
}

impl Default for EvictionThresholds {
    fn default() -> Self {
        Self {
            target: 80,
            trigger: 95,
            dirty_target: 5,
            dirty_trigger: 20,
            updates_target: 0,
            updates_trigger: 0,
        }
    }
}

impl EvictionThresholds {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.target = r.int("eviction_target", i64::from(self.target), 10, 99)? as u8;
        self.trigger = r.int("eviction_trigger", i64::from(self.trigger), 10, 99)? as u8;
        self.dirty_target = r.int("eviction_dirty_target", i64::from(self.dirty_target), 1, 99)? as u8;
        self.dirty_trigger = r.int("eviction_dirty_trigger", i64::from(self.dirty_trigger), 1, 99)? as u8;
        self.updates_target = r.int("eviction_updates_target", i64::from(self.updates_target), 0, 99)? as u8;
        self.updates_trigger = r.int("eviction_updates_trigger", i64::from(self.updates_trigger), 0, 99)? as u8;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.target >= self.trigger {
            return Err(ConfigError::Validation {
                message: format!(
                    "eviction_target {} must be lower than eviction_trigger {}",
                    self.target, self.trigger
                ),
            });
        }
        if self.dirty_target > self.dirty_trigger {
            return Err(ConfigError::Validation {
                message: format!(
                    "eviction_dirty_target {} must not exceed eviction_dirty_trigger {}",
                    self.dirty_target, self.dirty_trigger
                ),
            });
        }
        Ok(())
    }

    /// Effective updates target percentage.
    pub fn effective_updates_target(&self) -> u8 {
        if self.updates_target == 0 { (self.dirty_target / 2).max(1) } else { self.updates_target }
    }

    /// Effective updates trigger percentage.
    pub fn effective_updates_trigger(&self) -> u8 {
        if self.updates_trigger == 0 { (self.dirty_trigger / 2).max(1) } else { self.updates_trigger }
    }
}

/// What to do when an unclean shutdown is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoverMode {
    /// Run recovery.
    #[default]
    On,
    /// Refuse to open.
    Error,
}

/// Write-ahead log configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Whether logging is enabled.
    pub enabled: bool,
    /// Maximum size of a log file before switching.
    pub file_max: u64,
    /// Subdirectory (relative to home) holding log files.
    pub path: String,
    /// Pre-allocate the next log file.
    pub prealloc: bool,
    /// Remove log files no longer needed for recovery.
    pub remove: bool,
    /// Zero-fill new log files up to `file_max`.
    pub zero_fill: bool,
    /// Recovery behaviour.
    pub recover: RecoverMode,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_max: 100 * MB,
            path: String::new(),
            prealloc: true,
            remove: true,
            zero_fill: false,
            recover: RecoverMode::On,
        }
    }
}

#[bon::bon]
impl LogConfig {
    /// Creates a validated log configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `file_max` is outside 100KB..=2GB.
    #[builder]
    pub fn new(
        #[builder(default)] enabled: bool,
        #[builder(default = 100 * MB)] file_max: u64,
        #[builder(default)] path: String,
        #[builder(default = true)] prealloc: bool,
        #[builder(default = true)] remove: bool,
        #[builder(default)] zero_fill: bool,
        #[builder(default)] recover: RecoverMode,
    ) -> Result<Self, ConfigError> {
        let config = Self { enabled, file_max, path, prealloc, remove, zero_fill, recover };
        config.validate()?;
        Ok(config)
    }
}

impl LogConfig {
    fn apply_runtime(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.file_max = r.size("file_max", self.file_max, 100 * KB, 2 * GB)?;
        self.prealloc = r.bool("prealloc", self.prealloc)?;
        self.remove = r.bool("remove", self.remove)?;
        self.zero_fill = r.bool("zero_fill", self.zero_fill)?;
        Ok(())
    }
}

impl ConfigSection for LogConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.enabled = r.bool("enabled", self.enabled)?;
        if let Some(path) = r.string("path")? {
            self.path = path;
        }
        self.recover = match r.choice("recover", recover_name(self.recover), &["on", "error"])? {
            "error" => RecoverMode::Error,
            _ => RecoverMode::On,
        };
        self.apply_runtime(r)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.file_max < 100 * KB || self.file_max > 2 * GB {
            return Err(ConfigError::Validation {
                message: format!("log file_max must be 100KB..=2GB, got {}", self.file_max),
            });
        }
        Ok(())
    }
}

fn recover_name(mode: RecoverMode) -> &'static str {
    match mode {
        RecoverMode::On => "on",
        RecoverMode::Error => "error",
    }
}

/// Idle handle sweeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManagerConfig {
    /// Seconds a handle may stay idle before it is closed (0 disables).
    pub close_idle_time: u64,
    /// Seconds between sweep passes.
    pub close_scan_interval: u64,
    /// Open handles below which the sweep does nothing.
    pub close_handle_minimum: u64,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self { close_idle_time: 30, close_scan_interval: 10, close_handle_minimum: 250 }
    }
}

impl ConfigSection for FileManagerConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.close_idle_time = r.int("close_idle_time", self.close_idle_time as i64, 0, 100_000)? as u64;
        self.close_scan_interval =
            r.int("close_scan_interval", self.close_scan_interval as i64, 1, 100_000)? as u64;
        self.close_handle_minimum =
            r.int("close_handle_minimum", self.close_handle_minimum as i64, 0, i64::MAX)? as u64;
        Ok(())
    }
}

/// Statistics collection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum StatisticsLevel {
    /// No statistics; statistics cursors cannot be opened.
    #[default]
    None,
    /// Cheap counters only.
    Fast,
    /// Everything, including tree walks.
    All,
}

impl StatisticsLevel {
    fn from_list(items: &[String], key: &str) -> Result<(Self, bool), ConfigError> {
        let mut level = StatisticsLevel::None;
        let mut clear = false;
        for item in items {
            match item.as_str() {
                "none" => level = StatisticsLevel::None,
                "fast" => level = level.max(StatisticsLevel::Fast),
                "all" | "tree_walk" | "cache_walk" => level = StatisticsLevel::All,
                "clear" => clear = true,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: other.to_string(),
                        message: "expected one of none, fast, all, clear, tree_walk, cache_walk".to_string(),
                    });
                }
            }
        }
        Ok((level, clear))
    }
}

/// Periodic statistics logging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatisticsLogConfig {
    /// Seconds between log lines (0 disables the server).
    pub wait: u64,
    /// Write JSON lines.
    pub json: bool,
    /// Write one final line on close.
    pub on_close: bool,
    /// Restrict data-source statistics to these URIs.
    pub sources: Vec<String>,
}

impl ConfigSection for StatisticsLogConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.wait = r.int("wait", self.wait as i64, 0, 100_000)? as u64;
        self.json = r.bool("json", self.json)?;
        self.on_close = r.bool("on_close", self.on_close)?;
        if let Some(sources) = r.list("sources")? {
            self.sources = sources;
        }
        Ok(())
    }
}

/// Background I/O throttling.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoCapacityConfig {
    /// Bytes per second of write throughput (0 disables).
    pub total: u64,
    /// Seconds after which unsynced writes are forced to disk (0 disables).
    pub fsync_maximum_wait_period: u64,
}

impl ConfigSection for IoCapacityConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.total = r.size("total", self.total, 0, TB)?;
        self.fsync_maximum_wait_period =
            r.int("fsync_maximum_wait_period", self.fsync_maximum_wait_period as i64, 0, 7200)? as u64;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.total != 0 && self.total < MB {
            return Err(ConfigError::Validation {
                message: format!("io_capacity total must be 0 or at least 1MB, got {}", self.total),
            });
        }
        Ok(())
    }
}

/// How commit records reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMethod {
    /// `fsync` the log file.
    #[default]
    Fsync,
    /// Data-only sync.
    Dsync,
    /// Leave it to the operating system.
    None,
}

/// Commit durability defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionSyncConfig {
    /// Sync the log on every commit.
    pub enabled: bool,
    /// Sync method.
    pub method: SyncMethod,
}

impl ConfigSection for TransactionSyncConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.enabled = r.bool("enabled", self.enabled)?;
        let current = match self.method {
            SyncMethod::Fsync => "fsync",
            SyncMethod::Dsync => "dsync",
            SyncMethod::None => "none",
        };
        self.method = match r.choice("method", current, &["fsync", "dsync", "none"])? {
            "dsync" => SyncMethod::Dsync,
            "none" => SyncMethod::None,
            _ => SyncMethod::Fsync,
        };
        Ok(())
    }
}

/// Periodic checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointServerConfig {
    /// Seconds between checkpoints (0 disables).
    pub wait: u64,
    /// Log bytes written between checkpoints (0 disables).
    pub log_size: u64,
}

impl ConfigSection for CheckpointServerConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.wait = r.int("wait", self.wait as i64, 0, 100_000)? as u64;
        self.log_size = r.size("log_size", self.log_size, 0, 2 * GB)?;
        Ok(())
    }
}

/// Debugging switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugModeConfig {
    /// Evict pages touched by a commit as soon as possible.
    pub eviction: bool,
    /// Treat corruption as a panic rather than a per-operation error.
    pub corruption_abort: bool,
    /// Keep log files for this many extra checkpoints.
    pub checkpoint_retention: u32,
    /// Evict the page a cursor is leaving on reset.
    pub release_evict_page: bool,
}

impl Default for DebugModeConfig {
    fn default() -> Self {
        Self { eviction: false, corruption_abort: true, checkpoint_retention: 0, release_evict_page: false }
    }
}

impl ConfigSection for DebugModeConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.eviction = r.bool("eviction", self.eviction)?;
        self.corruption_abort = r.bool("corruption_abort", self.corruption_abort)?;
        self.checkpoint_retention =
            r.int("checkpoint_retention", i64::from(self.checkpoint_retention), 0, 1024)? as u32;
        self.release_evict_page = r.bool("release_evict_page", self.release_evict_page)?;
        Ok(())
    }
}

/// Named delays injected for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimingStress {
    /// Sleep inside the handle sweep.
    AggressiveSweep,
    /// Sleep between checkpoint phases.
    CheckpointSlow,
    /// Evict a page while a checkpoint is running.
    CheckpointEvictPage,
    /// Sleep before a commit becomes visible.
    CommitTransactionSlow,
    /// Sleep while sweeping obsolete history.
    HistoryStoreSweepRace,
    /// Sleep between checkpoint snapshot and prepared-state capture.
    PrepareCheckpointDelay,
}

impl TimingStress {
    const NAMES: [(&'static str, TimingStress); 6] = [
        ("aggressive_sweep", TimingStress::AggressiveSweep),
        ("checkpoint_slow", TimingStress::CheckpointSlow),
        ("checkpoint_evict_page", TimingStress::CheckpointEvictPage),
        ("commit_transaction_slow", TimingStress::CommitTransactionSlow),
        ("history_store_sweep_race", TimingStress::HistoryStoreSweepRace),
        ("prepare_checkpoint_delay", TimingStress::PrepareCheckpointDelay),
    ];

    fn parse(name: &str) -> Option<Self> {
        Self::NAMES.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }
}

/// Role of a node in a disaggregated deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisaggRole {
    /// Writes pages and publishes checkpoints.
    #[default]
    Leader,
    /// Reads published checkpoints; accepts ingest writes.
    Follower,
}

/// How to treat existing local files in disaggregated mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalFilesAction {
    /// Keep local files as a cache.
    #[default]
    Keep,
    /// Ignore (remove) local copies of shared tables on open.
    Ignore,
}

/// Disaggregated storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisaggregatedConfig {
    /// Directory of the shared page log; empty disables disaggregated mode.
    pub page_log: String,
    /// This node's role.
    pub role: DisaggRole,
    /// Checkpoint to load (followers); empty means latest.
    pub checkpoint_meta: String,
    /// Treatment of local files at open.
    pub local_files_action: LocalFilesAction,
    /// Longest chain of delta pages before a full image is written.
    pub max_delta_depth: u32,
}

impl Default for DisaggregatedConfig {
    fn default() -> Self {
        Self {
            page_log: String::new(),
            role: DisaggRole::Leader,
            checkpoint_meta: String::new(),
            local_files_action: LocalFilesAction::Keep,
            max_delta_depth: 4,
        }
    }
}

impl DisaggregatedConfig {
    /// True when a page log is configured.
    pub fn enabled(&self) -> bool {
        !self.page_log.is_empty()
    }

    fn apply_runtime(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        let current = match self.role {
            DisaggRole::Leader => "leader",
            DisaggRole::Follower => "follower",
        };
        self.role = match r.choice("role", current, &["leader", "follower"])? {
            "follower" => DisaggRole::Follower,
            _ => DisaggRole::Leader,
        };
        if let Some(meta) = r.string("checkpoint_meta")? {
            self.checkpoint_meta = meta;
        }
        Ok(())
    }
}

impl ConfigSection for DisaggregatedConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        if let Some(page_log) = r.string("page_log")? {
            self.page_log = page_log;
        }
        let current = match self.local_files_action {
            LocalFilesAction::Keep => "keep",
            LocalFilesAction::Ignore => "ignore",
        };
        self.local_files_action = match r.choice("local_files_action", current, &["keep", "ignore"])? {
            "ignore" => LocalFilesAction::Ignore,
            _ => LocalFilesAction::Keep,
        };
        self.max_delta_depth = r.int("max_delta_depth", i64::from(self.max_delta_depth), 0, 32)? as u32;
        self.apply_runtime(r)
    }
}

/// Live restore from a source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRestoreConfig {
    /// Whether live restore is enabled.
    pub enabled: bool,
    /// Source database directory.
    pub path: String,
    /// Background migrator threads (0 migrates only on access).
    pub threads_max: u32,
    /// Migration chunk size.
    pub read_size: u64,
}

impl Default for LiveRestoreConfig {
    fn default() -> Self {
        Self { enabled: false, path: String::new(), threads_max: 1, read_size: MB }
    }
}

impl ConfigSection for LiveRestoreConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.enabled = r.bool("enabled", self.enabled)?;
        if let Some(path) = r.string("path")? {
            self.path = path;
        }
        self.threads_max = r.int("threads_max", i64::from(self.threads_max), 0, 12)? as u32;
        self.read_size = r.size("read_size", self.read_size, 512, 16 * MB)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.path.is_empty() {
            return Err(ConfigError::Validation {
                message: "live_restore requires a source path".to_string(),
            });
        }
        if !self.read_size.is_power_of_two() {
            return Err(ConfigError::Validation {
                message: format!("live_restore read_size must be a power of two, got {}", self.read_size),
            });
        }
        Ok(())
    }
}

/// Everything that configures a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Create the database if it does not exist.
    pub create: bool,
    /// Maximum bytes of in-memory pages.
    pub cache_size: u64,
    /// Eviction worker bounds.
    pub eviction: EvictionConfig,
    /// Eviction thresholds.
    pub thresholds: EvictionThresholds,
    /// Write-ahead log.
    pub log: LogConfig,
    /// Handle sweep.
    pub file_manager: FileManagerConfig,
    /// Statistics level.
    pub statistics: StatisticsLevel,
    /// Statistics logging.
    pub statistics_log: StatisticsLogConfig,
    /// I/O throttling.
    pub io_capacity: IoCapacityConfig,
    /// Commit sync defaults.
    pub transaction_sync: TransactionSyncConfig,
    /// Checkpoint server.
    pub checkpoint: CheckpointServerConfig,
    /// Debug switches.
    pub debug_mode: DebugModeConfig,
    /// Injected delays.
    pub timing_stress_for_test: Vec<TimingStress>,
    /// Keep everything in memory; no files are written.
    pub in_memory: bool,
    /// Reject all writes.
    pub readonly: bool,
    /// Disaggregated storage.
    pub disaggregated: DisaggregatedConfig,
    /// Live restore.
    pub live_restore: LiveRestoreConfig,
    /// Checkpoints strictly at the stable timestamp.
    pub precise_checkpoint: bool,
    /// Keep prepared transactions across restart.
    pub preserve_prepared: bool,
    /// Maximum concurrent sessions.
    pub session_max: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            create: false,
            cache_size: DEFAULT_CACHE_SIZE,
            eviction: EvictionConfig::default(),
            thresholds: EvictionThresholds::default(),
            log: LogConfig::default(),
            file_manager: FileManagerConfig::default(),
            statistics: StatisticsLevel::None,
            statistics_log: StatisticsLogConfig::default(),
            io_capacity: IoCapacityConfig::default(),
            transaction_sync: TransactionSyncConfig::default(),
            checkpoint: CheckpointServerConfig::default(),
            debug_mode: DebugModeConfig::default(),
            timing_stress_for_test: Vec::new(),
            in_memory: false,
            readonly: false,
            disaggregated: DisaggregatedConfig::default(),
            live_restore: LiveRestoreConfig::default(),
            precise_checkpoint: false,
            preserve_prepared: false,
            session_max: 100,
        }
    }
}

#[bon::bon]
impl ConnectionConfig {
    /// Creates a validated connection configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any section fails validation.
    #[builder]
    pub fn new(
        #[builder(default)] create: bool,
        #[builder(default = DEFAULT_CACHE_SIZE)] cache_size: u64,
        #[builder(default)] eviction: EvictionConfig,
        #[builder(default)] thresholds: EvictionThresholds,
        #[builder(default)] log: LogConfig,
        #[builder(default)] file_manager: FileManagerConfig,
        #[builder(default)] statistics: StatisticsLevel,
        #[builder(default)] statistics_log: StatisticsLogConfig,
        #[builder(default)] io_capacity: IoCapacityConfig,
        #[builder(default)] transaction_sync: TransactionSyncConfig,
        #[builder(default)] checkpoint: CheckpointServerConfig,
        #[builder(default)] debug_mode: DebugModeConfig,
        #[builder(default)] timing_stress_for_test: Vec<TimingStress>,
        #[builder(default)] in_memory: bool,
        #[builder(default)] readonly: bool,
        #[builder(default)] disaggregated: DisaggregatedConfig,
        #[builder(default)] live_restore: LiveRestoreConfig,
        #[builder(default)] precise_checkpoint: bool,
        #[builder(default)] preserve_prepared: bool,
        #[builder(default = 100)] session_max: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            create,
            cache_size,
            eviction,
            thresholds,
            log,
            file_manager,
            statistics,
            statistics_log,
            io_capacity,
            transaction_sync,
            checkpoint,
            debug_mode,
            timing_stress_for_test,
            in_memory,
            readonly,
            disaggregated,
            live_restore,
            precise_checkpoint,
            preserve_prepared,
            session_max,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ConnectionConfig {
    /// True when `stress` was requested.
    pub fn stress(&self, stress: TimingStress) -> bool {
        self.timing_stress_for_test.contains(&stress)
    }

    /// Returns a copy with a runtime reconfiguration applied.
    ///
    /// Only cache, eviction, statistics, logging housekeeping, checkpoint
    /// server, file manager, io capacity, debug, timing stress and the
    /// disaggregated role may change; any other key is unknown here.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unknown keys or invalid values.
    pub fn reconfigure(&self, config: &str) -> Result<Self, ConfigError> {
        let parsed = ParsedConfig::parse(config)?;
        let mut r = parsed.reader();
        let mut next = self.clone();
        next.apply_runtime(&mut r)?;
        if let Some(mut log) = r.nested("log")? {
            next.log.apply_runtime(&mut log)?;
            log.finish()?;
        }
        if let Some(mut disagg) = r.nested("disaggregated")? {
            next.disaggregated.apply_runtime(&mut disagg)?;
            disagg.finish()?;
        }
        r.finish()?;
        next.validate()?;
        Ok(next)
    }

    fn apply_runtime(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.cache_size = r.size("cache_size", self.cache_size, MIN_CACHE_SIZE, MAX_CACHE_SIZE)?;
        r.section("eviction", &mut self.eviction)?;
        self.thresholds.apply(r)?;
        if let Some(list) = r.list("statistics")? {
            let (level, _clear) = StatisticsLevel::from_list(&list, "statistics")?;
            self.statistics = level;
        }
        r.section("statistics_log", &mut self.statistics_log)?;
        r.section("file_manager", &mut self.file_manager)?;
        r.section("io_capacity", &mut self.io_capacity)?;
        r.section("checkpoint", &mut self.checkpoint)?;
        r.section("debug_mode", &mut self.debug_mode)?;
        if let Some(names) = r.list("timing_stress_for_test")? {
            let mut stress = Vec::with_capacity(names.len());
            for name in names {
                let parsed = TimingStress::parse(&name).ok_or_else(|| ConfigError::InvalidValue {
                    key: "timing_stress_for_test".to_string(),
                    value: name.clone(),
                    message: "unknown timing stress point".to_string(),
                })?;
                stress.push(parsed);
            }
            self.timing_stress_for_test = stress;
        }
        Ok(())
    }
}

impl ConfigSection for ConnectionConfig {
    fn apply(&mut self, r: &mut ConfigReader<'_>) -> Result<(), ConfigError> {
        self.create = r.bool("create", self.create)?;
        self.in_memory = r.bool("in_memory", self.in_memory)?;
        self.readonly = r.bool("readonly", self.readonly)?;
        self.precise_checkpoint = r.bool("precise_checkpoint", self.precise_checkpoint)?;
        self.preserve_prepared = r.bool("preserve_prepared", self.preserve_prepared)?;
        self.session_max = r.int("session_max", i64::from(self.session_max), 1, 64 * 1024)? as u32;
        r.section("log", &mut self.log)?;
        r.section("transaction_sync", &mut self.transaction_sync)?;
        r.section("disaggregated", &mut self.disaggregated)?;
        r.section("live_restore", &mut self.live_restore)?;
        self.apply_runtime(r)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.eviction.validate()?;
        self.thresholds.validate()?;
        self.log.validate()?;
        self.io_capacity.validate()?;
        self.live_restore.validate()?;
        if self.in_memory && self.log.enabled {
            return Err(ConfigError::Validation {
                message: "in_memory databases cannot enable logging".to_string(),
            });
        }
        if self.in_memory && (self.live_restore.enabled || self.disaggregated.enabled()) {
            return Err(ConfigError::Validation {
                message: "in_memory is incompatible with live_restore and disaggregated storage".to_string(),
            });
        }
        if self.live_restore.enabled && self.disaggregated.enabled() {
            return Err(ConfigError::Validation {
                message: "live_restore cannot be combined with disaggregated storage".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConnectionConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.statistics, StatisticsLevel::None);
        assert!(!config.log.enabled);
    }

    #[test]
    fn test_parse_full_string() {
        let config = ConnectionConfig::parse(
            "create,cache_size=50MB,log=(enabled,file_max=100K,remove=false),statistics=(all),\
             eviction=(threads_min=2,threads_max=4),eviction_dirty_target=10,\
             debug_mode=(eviction=true,corruption_abort=false),timing_stress_for_test=[checkpoint_slow]",
        )
        .unwrap();
        assert!(config.create);
        assert_eq!(config.cache_size, 50 * MB);
        assert!(config.log.enabled);
        assert_eq!(config.log.file_max, 100 * KB);
        assert!(!config.log.remove);
        assert_eq!(config.statistics, StatisticsLevel::All);
        assert_eq!(config.eviction.threads_min, 2);
        assert_eq!(config.thresholds.dirty_target, 10);
        assert!(!config.debug_mode.corruption_abort);
        assert!(config.stress(TimingStress::CheckpointSlow));
    }

    #[test]
    fn test_unknown_key() {
        let err = ConnectionConfig::parse("create,not_a_key=1").unwrap_err();
        assert!(err.to_string().contains("unknown configuration key"), "{err}");
    }

    #[test]
    fn test_cache_size_limits() {
        let err = ConnectionConfig::parse("cache_size=1K").unwrap_err();
        assert!(err.to_string().contains("below minimum"), "{err}");
        let err = ConnectionConfig::parse("cache_size=20TB").unwrap_err();
        assert!(err.to_string().contains("above maximum"), "{err}");
    }

    #[test]
    fn test_eviction_threshold_validation() {
        let err = ConnectionConfig::parse("eviction_target=96,eviction_trigger=95").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_reconfigure_subset() {
        let base = ConnectionConfig::parse("create").unwrap();
        let next = base.reconfigure("cache_size=200MB,log=(remove=false)").unwrap();
        assert_eq!(next.cache_size, 200 * MB);
        assert!(!next.log.remove);
        assert!(base.reconfigure("in_memory=true").is_err());
        assert!(base.reconfigure("log=(enabled=true)").is_err());
        let follower = base.reconfigure("disaggregated=(role=follower)").unwrap();
        assert_eq!(follower.disaggregated.role, DisaggRole::Follower);
    }

    #[test]
    fn test_in_memory_rejects_log() {
        assert!(ConnectionConfig::parse("in_memory=true,log=(enabled=true)").is_err());
    }

    #[test]
    fn test_live_restore_requires_path() {
        assert!(ConnectionConfig::parse("live_restore=(enabled=true)").is_err());
        let config = ConnectionConfig::parse("live_restore=(enabled=true,path=/src,threads_max=2)").unwrap();
        assert_eq!(config.live_restore.threads_max, 2);
    }

    #[test]
    fn test_log_builder_validates() {
        assert!(LogConfig::builder().file_max(1024).build().is_err());
        assert!(LogConfig::builder().enabled(true).build().is_ok());
    }
}
