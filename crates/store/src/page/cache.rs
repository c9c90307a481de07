//! Cache accounting.
//!
//! The cache itself is the set of in-memory pages hanging off each tree;
//! this module only counts their bytes and decides how hard eviction has
//! to work. Three totals are tracked: all in-memory bytes, bytes of dirty
//! pages, and bytes held in update chains. Each has a target (background
//! eviction starts) and a trigger (application threads help evict).

use std::sync::atomic::{AtomicU64, Ordering};

use cellar_types::config::ConnectionConfig;
use parking_lot::RwLock;

/// How much eviction work the current usage calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pressure {
    /// Below every target.
    Idle,
    /// Above a target: the eviction server should work.
    Target,
    /// Above a trigger: application threads must help.
    Trigger,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    size: u64,
    target: u64,
    trigger: u64,
    dirty_target: u64,
    dirty_trigger: u64,
    updates_target: u64,
    updates_trigger: u64,
}

impl Limits {
    fn from_config(cfg: &ConnectionConfig) -> Self {
        let size = cfg.cache_size;
        let pct = |p: u8| size / 100 * u64::from(p);
        let t = &cfg.thresholds;
        Self {
            size,
            target: pct(t.target),
            trigger: pct(t.trigger),
            dirty_target: pct(t.dirty_target),
            dirty_trigger: pct(t.dirty_trigger),
            updates_target: pct(t.effective_updates_target()),
            updates_trigger: pct(t.effective_updates_trigger()),
        }
    }
}

/// Point-in-time cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUsage {
    pub bytes_inmem: u64,
    pub bytes_dirty: u64,
    pub bytes_updates: u64,
    pub max_bytes: u64,
}

/// Byte counters for every in-memory page.
#[derive(Debug)]
pub(crate) struct CacheAccounting {
    inmem: AtomicU64,
    dirty: AtomicU64,
    updates: AtomicU64,
    limits: RwLock<Limits>,
}

impl CacheAccounting {
    pub fn new(cfg: &ConnectionConfig) -> Self {
        Self {
            inmem: AtomicU64::new(0),
            dirty: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            limits: RwLock::new(Limits::from_config(cfg)),
        }
    }

    /// Applies reconfigured cache size and thresholds.
    pub fn configure(&self, cfg: &ConnectionConfig) {
        *self.limits.write() = Limits::from_config(cfg);
    }

    pub fn add_inmem(&self, delta: i64) {
        adjust(&self.inmem, delta);
    }

    pub fn add_dirty(&self, delta: i64) {
        adjust(&self.dirty, delta);
    }

    pub fn add_updates(&self, delta: i64) {
        adjust(&self.updates, delta);
    }

    pub fn usage(&self) -> CacheUsage {
        CacheUsage {
            bytes_inmem: self.inmem.load(Ordering::Relaxed),
            bytes_dirty: self.dirty.load(Ordering::Relaxed),
            bytes_updates: self.updates.load(Ordering::Relaxed),
            max_bytes: self.limits.read().size,
        }
    }

    /// Current eviction pressure.
    pub fn pressure(&self) -> Pressure {
        let l = *self.limits.read();
        let inmem = self.inmem.load(Ordering::Relaxed);
        let dirty = self.dirty.load(Ordering::Relaxed);
        let updates = self.updates.load(Ordering::Relaxed);
        if inmem > l.trigger || dirty > l.dirty_trigger || updates > l.updates_trigger {
            Pressure::Trigger
        } else if inmem > l.target || dirty > l.dirty_target || updates > l.updates_target {
            Pressure::Target
        } else {
            Pressure::Idle
        }
    }

    /// True when in-memory bytes exceed the configured cache size.
    pub fn over_capacity(&self) -> bool {
        self.inmem.load(Ordering::Relaxed) > self.limits.read().size
    }
}

fn adjust(counter: &AtomicU64, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        let sub = delta.unsigned_abs();
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(sub)));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use cellar_types::config::ConfigSection;

    use super::*;

    fn cache(size: &str) -> CacheAccounting {
        CacheAccounting::new(&ConnectionConfig::parse(&format!("cache_size={size}")).unwrap())
    }

    #[test]
    fn test_pressure_levels() {
        let cache = cache("10MB");
        assert_eq!(cache.pressure(), Pressure::Idle);
        cache.add_inmem(9 * 1024 * 1024);
        assert_eq!(cache.pressure(), Pressure::Target);
        cache.add_inmem(1024 * 1024);
        assert_eq!(cache.pressure(), Pressure::Trigger);
        cache.add_inmem(-10 * 1024 * 1024);
        assert_eq!(cache.pressure(), Pressure::Idle);
    }

    #[test]
    fn test_dirty_trigger() {
        let cache = cache("10MB");
        cache.add_dirty(3 * 1024 * 1024);
        assert_eq!(cache.pressure(), Pressure::Trigger);
    }

    #[test]
    fn test_counters_saturate_at_zero() {
        let cache = cache("10MB");
        cache.add_updates(100);
        cache.add_updates(-500);
        assert_eq!(cache.usage().bytes_updates, 0);
    }

    #[test]
    fn test_over_capacity() {
        let cache = cache("1MB");
        assert!(!cache.over_capacity());
        cache.add_inmem(2 * 1024 * 1024);
        assert!(cache.over_capacity());
    }
}
