//! Connection-wide environment shared by every subsystem.
//!
//! Holds the pieces that low-level code (btrees, reconciliation, the block
//! layer) needs without reaching back into the connection: cache
//! accounting, statistics, the published configuration, panic state and
//! the write generation counter stamped into every block.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use cellar_types::config::{ConnectionConfig, TimingStress};
use parking_lot::Mutex;
use tracing::error;

use crate::{
    error::{Error, Result},
    page::cache::CacheAccounting,
    stats::{Stat, Stats},
};

/// Delay injected at a timing-stress point.
const STRESS_DELAY: Duration = Duration::from_millis(10);

/// Shared connection environment.
pub(crate) struct Env {
    pub cache: CacheAccounting,
    pub stats: Stats,
    config: ArcSwap<ConnectionConfig>,
    panicked: AtomicBool,
    panic_reason: Mutex<Option<String>>,
    write_gen: AtomicU64,
    read_gen: AtomicU64,
}

impl Env {
    pub fn new(config: ConnectionConfig, write_gen: u64) -> Arc<Self> {
        let cache = CacheAccounting::new(&config);
        let stats = Stats::new();
        stats.set(Stat::CacheBytesMax, config.cache_size as i64);
        Arc::new(Self {
            cache,
            stats,
            config: ArcSwap::from_pointee(config),
            panicked: AtomicBool::new(false),
            panic_reason: Mutex::new(None),
            write_gen: AtomicU64::new(write_gen.max(1)),
            read_gen: AtomicU64::new(1),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<ConnectionConfig> {
        self.config.load_full()
    }

    /// Publishes a new configuration.
    pub fn set_config(&self, config: ConnectionConfig) {
        self.cache.configure(&config);
        self.stats.set(Stat::CacheBytesMax, config.cache_size as i64);
        self.config.store(Arc::new(config));
    }

    /// Copies the cache byte counters into their statistics.
    pub fn refresh_cache_stats(&self) {
        let usage = self.cache.usage();
        self.stats.set(Stat::CacheBytesInuse, usage.bytes_inmem as i64);
        self.stats.set(Stat::CacheBytesDirty, usage.bytes_dirty as i64);
        self.stats.set(Stat::CacheBytesUpdates, usage.bytes_updates as i64);
    }

    /// Next write generation.
    pub fn next_write_gen(&self) -> u64 {
        self.write_gen.fetch_add(1, Ordering::AcqRel)
    }

    pub fn write_gen(&self) -> u64 {
        self.write_gen.load(Ordering::Acquire)
    }

    /// Raises the write generation to at least `floor`.
    pub fn bump_write_gen(&self, floor: u64) {
        self.write_gen.fetch_max(floor, Ordering::AcqRel);
    }

    /// Ticks the page access clock used to order eviction candidates.
    pub fn next_read_gen(&self) -> u64 {
        self.read_gen.fetch_add(1, Ordering::Relaxed)
    }

    /// Fails once the connection has panicked.
    pub fn check_panic(&self) -> Result<()> {
        if self.panicked.load(Ordering::Acquire) {
            let reason = self.panic_reason.lock().clone().unwrap_or_default();
            return Err(Error::Panic { reason });
        }
        Ok(())
    }

    /// Marks the connection panicked and returns the error to propagate.
    pub fn panic(&self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        error!(reason = %reason, "connection panic");
        self.panicked.store(true, Ordering::Release);
        *self.panic_reason.lock() = Some(reason.clone());
        Error::Panic { reason }
    }

    /// Routes a corruption error according to `debug_mode.corruption_abort`.
    pub fn on_corruption(&self, err: Error, context: &str, block: Option<&[u8]>) -> Error {
        if !matches!(err, Error::Corruption { .. }) {
            return err;
        }
        let dump = block.map(hex_preview).unwrap_or_default();
        error!(context, error = %err, dump = %dump, "corruption detected");
        if self.config().debug_mode.corruption_abort { self.panic(format!("{context}: {err}")) } else { err }
    }

    /// Sleeps at a timing-stress point when that stress is configured.
    pub fn stress(&self, point: TimingStress) {
        if self.config().stress(point) {
            std::thread::sleep(STRESS_DELAY);
        }
    }
}

fn hex_preview(block: &[u8]) -> String {
    block.iter().take(64).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use cellar_types::config::ConfigSection;

    use super::*;

    #[test]
    fn test_panic_is_sticky() {
        let env = Env::new(ConnectionConfig::default(), 1);
        assert!(env.check_panic().is_ok());
        let err = env.panic("invariant");
        assert!(matches!(err, Error::Panic { .. }));
        assert!(matches!(env.check_panic(), Err(Error::Panic { .. })));
    }

    #[test]
    fn test_corruption_routing() {
        let env = Env::new(ConnectionConfig::parse("debug_mode=(corruption_abort=false)").unwrap(), 1);
        let err = env.on_corruption(Error::corrupt("bad"), "read", Some(&[1, 2, 3]));
        assert!(matches!(err, Error::Corruption { .. }));
        assert!(env.check_panic().is_ok());

        let env = Env::new(ConnectionConfig::parse("debug_mode=(corruption_abort=true)").unwrap(), 1);
        let err = env.on_corruption(Error::corrupt("bad"), "read", None);
        assert!(matches!(err, Error::Panic { .. }));
    }

    #[test]
    fn test_write_gen_monotonic() {
        let env = Env::new(ConnectionConfig::default(), 5);
        assert_eq!(env.next_write_gen(), 5);
        env.bump_write_gen(100);
        assert_eq!(env.next_write_gen(), 100);
        env.bump_write_gen(3);
        assert_eq!(env.write_gen(), 101);
    }
}
