//! Compaction.
//!
//! A file shrinks only from its tail. Compaction marks every page whose
//! current block could move into a lower free extent, then checkpoints:
//! the marked pages are rewritten first-fit into the free space, the old
//! blocks are released, and the now-free tail is truncated. Passes repeat
//! while they keep shrinking the file.

use std::time::{Duration, Instant};

use cellar_types::config::{CheckpointConfig, CompactConfig};
use tracing::{debug, info};

use crate::{
    btree::Btree,
    checkpoint::checkpoint_locked,
    conn::ConnInner,
    error::{Error, Result},
    stats::Stat,
};

/// Largest number of passes over one object.
const MAX_PASSES: usize = 10;

/// What a compaction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactOutcome {
    /// Files that were worth compacting.
    pub files: u64,
    /// Bytes the files shrank by.
    pub bytes_recovered: u64,
}

/// Marks pages whose blocks can move lower. Returns how many.
fn mark_relocatable(tree: &Btree) -> u64 {
    let store = tree.store();
    let mut marked = 0;
    for page in tree.pages() {
        let mut st = page.state.lock();
        if st.stale {
            continue;
        }
        if st.blocks().iter().any(|addr| store.relocatable(addr)) {
            st.force_rewrite = true;
            marked += 1;
        }
    }
    if marked > 0 {
        tree.mark_root_dirty();
    }
    marked
}

/// Compacts the files behind `trees` whose free space reaches `min_free`.
/// The caller holds the checkpoint lock.
fn compact_trees(conn: &ConnInner, trees: &[std::sync::Arc<Btree>], min_free: u64, timeout: u64) -> Result<CompactOutcome> {
    let started = Instant::now();
    let mut out = CompactOutcome::default();
    let candidates: Vec<_> = trees
        .iter()
        .filter(|t| !t.is_readonly() && !t.store().is_shared())
        .filter(|t| {
            let free = t.store().free_bytes();
            free > 0 && free >= min_free
        })
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Ok(out);
    }
    let before: u64 = candidates.iter().map(|t| t.store().size().unwrap_or(0)).sum();
    let mut last = before;
    for pass in 0..MAX_PASSES {
        if timeout > 0 && started.elapsed() >= Duration::from_secs(timeout) {
            return Err(Error::busy("compact: timed out"));
        }
        conn.env.check_panic()?;
        let marked: u64 = candidates.iter().map(|t| mark_relocatable(t)).sum();
        checkpoint_locked(conn, &CheckpointConfig::default())?;
        let size: u64 = candidates.iter().map(|t| t.store().size().unwrap_or(0)).sum();
        debug!(pass, marked, size, "compaction pass");
        if marked == 0 || size >= last {
            break;
        }
        last = size;
    }
    out.files = candidates.len() as u64;
    out.bytes_recovered = before.saturating_sub(last);
    Ok(out)
}

/// Compacts `uri`, or starts or stops background compaction when the
/// configuration says `background`.
///
/// # Errors
///
/// - [`Error::ReadOnly`] on a read-only connection
/// - [`Error::Busy`] when `timeout` elapses first
pub(crate) fn compact(conn: &ConnInner, uri: Option<&str>, cfg: &CompactConfig) -> Result<CompactOutcome> {
    conn.check_open()?;
    if conn.readonly() {
        return Err(Error::ReadOnly);
    }
    if let Some(on) = cfg.background {
        if uri.is_some() {
            return Err(Error::invalid("compact: background compaction does not take a URI"));
        }
        let servers = conn.servers.lock();
        let servers = servers.as_ref().ok_or_else(|| Error::invalid("compact: connection is closing"))?;
        servers.set_background_compact(on.then(|| cfg.clone()));
        return Ok(CompactOutcome::default());
    }
    let uri = uri.ok_or_else(|| Error::invalid("compact: a URI is required"))?;
    if conn.env.config().in_memory {
        return Ok(CompactOutcome::default());
    }
    if conn.servers.lock().as_ref().is_some_and(|s| s.background_compact()) {
        return Err(Error::busy("compact: background compaction is running"));
    }
    let target = conn.data_target(uri)?;
    let trees: Vec<_> = target.tree_ids().into_iter().map(|id| conn.tree(id)).collect::<Result<_>>()?;
    let _ckpt = conn.checkpoint_lock.lock();
    let out = compact_trees(conn, &trees, 1, cfg.timeout)?;
    info!(uri, files = out.files, bytes = out.bytes_recovered, "compacted");
    Ok(out)
}

/// One background pass over every table with at least
/// `free_space_target` reclaimable bytes. Returns files compacted.
pub(crate) fn background_pass(conn: &ConnInner, cfg: &CompactConfig) -> Result<u64> {
    if conn.readonly() || conn.env.config().in_memory {
        return Ok(0);
    }
    let Some(_ckpt) = conn.checkpoint_lock.try_lock() else { return Ok(0) };
    let trees = conn.user_trees();
    let skipped = trees.iter().filter(|t| t.store().free_bytes() < cfg.free_space_target.max(1)).count();
    conn.env.stats.add(Stat::BackgroundCompactSkipped, skipped as u64);
    let out = compact_trees(conn, &trees, cfg.free_space_target.max(1), cfg.timeout)?;
    if out.files > 0 {
        conn.env.stats.add(Stat::BackgroundCompactSuccess, out.files);
        conn.env.stats.add(Stat::BackgroundCompactBytesRecovered, out.bytes_recovered);
    }
    Ok(out.files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::conn::Connection;

    fn size_of(dir: &std::path::Path) -> u64 {
        std::fs::metadata(dir.join("t.cdb")).unwrap().len()
    }

    #[test]
    fn test_compact_shrinks_after_removals() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S,leaf_page_max=4KB").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for i in 0..4000i64 {
            c.set_key(i);
            c.set_value("v".repeat(100));
            c.insert().unwrap();
        }
        session.checkpoint("").unwrap();
        for i in 0..3600i64 {
            c.set_key(i);
            c.remove().unwrap();
        }
        drop(c);
        session.checkpoint("").unwrap();
        session.checkpoint("").unwrap();
        let before = size_of(dir.path());

        let out = compact(conn.inner(), Some("table:t"), &CompactConfig::default()).unwrap();
        assert!(size_of(dir.path()) <= before);
        assert_eq!(out.bytes_recovered, before.saturating_sub(size_of(dir.path())));

        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(3999i64);
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_str().unwrap().len(), 100);
    }

    #[test]
    fn test_background_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let cfg = CompactConfig { background: Some(true), ..CompactConfig::default() };
        compact(conn.inner(), None, &cfg).unwrap();
        assert!(conn.inner().servers.lock().as_ref().unwrap().background_compact());
        assert!(matches!(
            compact(conn.inner(), Some("table:t"), &CompactConfig::default()),
            Err(Error::Busy { .. })
        ));
        let cfg = CompactConfig { background: Some(false), ..CompactConfig::default() };
        compact(conn.inner(), None, &cfg).unwrap();
        assert!(!conn.inner().servers.lock().as_ref().unwrap().background_compact());
    }
}
