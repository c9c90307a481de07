//! Global timestamp record.
//!
//! Readers load the published [`TimestampRecord`] without locking. Updates
//! serialize on a mutex, validate against the current record and publish a
//! fresh copy, so a reader always sees a consistent `{oldest, stable}` pair.

use std::sync::Arc;

use arc_swap::ArcSwap;
use cellar_types::{TS_NONE, Timestamp, config::ConnTimestampConfig, timestamp::format_hex};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Connection-wide timestamps. Zero means "not set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampRecord {
    pub oldest: Timestamp,
    pub stable: Timestamp,
    /// Durable timestamp set by the application.
    pub durable: Timestamp,
    /// Largest durable timestamp of any committed transaction.
    pub max_committed_durable: Timestamp,
    pub last_checkpoint: Timestamp,
    pub recovery: Timestamp,
    pub backup_checkpoint: Timestamp,
}

impl TimestampRecord {
    /// The all-durable timestamp: the newest durable point known.
    pub fn all_durable(&self) -> Timestamp {
        self.durable.max(self.max_committed_durable)
    }
}

/// Published timestamp record with a serialized update path.
#[derive(Debug)]
pub(crate) struct GlobalTimestamps {
    record: ArcSwap<TimestampRecord>,
    update: Mutex<()>,
}

impl GlobalTimestamps {
    pub fn new(initial: TimestampRecord) -> Self {
        Self { record: ArcSwap::from_pointee(initial), update: Mutex::new(()) }
    }

    pub fn load(&self) -> TimestampRecord {
        **self.record.load()
    }

    /// Applies `f` to a copy of the record and publishes it if `f` succeeds.
    pub fn update<F>(&self, f: F) -> Result<TimestampRecord>
    where
        F: FnOnce(&mut TimestampRecord) -> Result<()>,
    {
        let _guard = self.update.lock();
        let mut next = self.load();
        f(&mut next)?;
        self.record.store(Arc::new(next));
        Ok(next)
    }

    /// Applies a `set_timestamp` request.
    ///
    /// Oldest and stable never move backwards unless `force` is set; a
    /// backwards move is silently ignored. The result must keep
    /// `oldest <= stable`.
    pub fn set(&self, cfg: &ConnTimestampConfig) -> Result<TimestampRecord> {
        self.update(|r| {
            let mut oldest = r.oldest;
            let mut stable = r.stable;
            if let Some(ts) = cfg.oldest_timestamp {
                if ts == TS_NONE {
                    return Err(Error::invalid("oldest timestamp must not be zero"));
                }
                if cfg.force || ts > oldest {
                    oldest = ts;
                }
            }
            if let Some(ts) = cfg.stable_timestamp {
                if ts == TS_NONE {
                    return Err(Error::invalid("stable timestamp must not be zero"));
                }
                if cfg.force || ts > stable {
                    stable = ts;
                }
            }
            if oldest != TS_NONE && stable != TS_NONE && oldest > stable {
                return Err(Error::invalid(format!(
                    "set_timestamp: oldest timestamp {} must not be later than stable timestamp {}",
                    format_hex(oldest),
                    format_hex(stable)
                )));
            }
            if let Some(ts) = cfg.durable_timestamp {
                if cfg.force || ts > r.durable {
                    r.durable = ts;
                }
            }
            r.oldest = oldest;
            r.stable = stable;
            debug!(oldest = r.oldest, stable = r.stable, "Global timestamps updated");
            Ok(())
        })
    }

    /// Records a commit's durable timestamp.
    pub fn note_durable(&self, durable: Timestamp) {
        if durable == TS_NONE || durable <= self.load().max_committed_durable {
            return;
        }
        let _ = self.update(|r| {
            r.max_committed_durable = r.max_committed_durable.max(durable);
            Ok(())
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use cellar_types::config::ConfigSection;

    use super::*;

    fn set(ts: &GlobalTimestamps, cfg: &str) -> Result<TimestampRecord> {
        ts.set(&ConnTimestampConfig::parse(cfg).unwrap())
    }

    #[test]
    fn test_oldest_must_not_pass_stable() {
        let ts = GlobalTimestamps::new(TimestampRecord::default());
        set(&ts, "oldest_timestamp=a,stable_timestamp=14").unwrap();
        assert!(matches!(set(&ts, "oldest_timestamp=20"), Err(Error::InvalidArgument { .. })));
        assert_eq!(ts.load().oldest, 0xa);
    }

    #[test]
    fn test_backwards_moves_ignored_without_force() {
        let ts = GlobalTimestamps::new(TimestampRecord::default());
        set(&ts, "oldest_timestamp=10,stable_timestamp=20").unwrap();
        set(&ts, "stable_timestamp=18").unwrap();
        assert_eq!(ts.load().stable, 0x20);
        set(&ts, "stable_timestamp=18,force=true").unwrap();
        assert_eq!(ts.load().stable, 0x18);
    }

    #[test]
    fn test_note_durable_keeps_maximum() {
        let ts = GlobalTimestamps::new(TimestampRecord::default());
        ts.note_durable(30);
        ts.note_durable(20);
        assert_eq!(ts.load().all_durable(), 30);
    }
}
