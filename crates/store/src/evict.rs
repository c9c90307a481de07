//! Eviction.
//!
//! Pages leave the cache least recently used first. A clean page is simply
//! dropped; a dirty page is reconciled in eviction mode first, which only
//! succeeds when every update on it is committed (and, with precise
//! checkpoints, no newer than stable). The new image is referenced from
//! the tree root, so the next checkpoint rewrites the root.
//!
//! The eviction server runs passes whenever usage crosses a target.
//! Application threads run passes themselves once usage crosses a trigger
//! and give up with [`Error::CacheFull`] when nothing more can leave.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use cellar_types::TS_NONE;
use tracing::{debug, trace};

use crate::{
    btree::{Btree, PageRef},
    conn::ConnInner,
    error::{Error, Result},
    metrics,
    page::cache::Pressure,
    reconcile::{RecCtx, RecMode, reconcile},
    stats::Stat,
    txn::{Snapshot, TXN_NONE},
};

/// Pause between application-thread eviction attempts.
const APP_RETRY: Duration = Duration::from_millis(1);

/// Inputs shared by every page of one pass.
struct PassView {
    committed: Snapshot,
    stable: Option<u64>,
}

impl PassView {
    fn take(conn: &ConnInner) -> Self {
        let config = conn.env.config();
        let stable = conn.txn.ts.load().stable;
        Self {
            committed: conn.txn.snapshot(TXN_NONE),
            stable: (config.precise_checkpoint && stable != TS_NONE).then_some(stable),
        }
    }

    fn ctx<'a>(&'a self, conn: &'a ConnInner) -> RecCtx<'a> {
        RecCtx {
            mode: RecMode::Evict { committed: &self.committed, stable: self.stable },
            horizon: conn.txn.visible_all(),
            hs: Some(&conn.hs),
            max_delta_depth: conn.env.config().disaggregated.max_delta_depth,
        }
    }
}

/// Evicts one page. Returns false when the page is busy, pinned by
/// updates that cannot be written, or already gone.
fn evict_page(conn: &ConnInner, tree: &Btree, page: &PageRef, ctx: &RecCtx<'_>) -> Result<bool> {
    let Some(mut st) = page.state.try_lock() else { return Ok(false) };
    if st.stale || st.leaf.is_none() {
        return Ok(false);
    }
    if st.dirty || st.force_rewrite {
        if tree.is_readonly() || conn.env.config().in_memory {
            return Ok(false);
        }
        if let Some(leaf) = st.leaf.as_mut() {
            leaf.discard_obsolete(&ctx.horizon);
        }
        let evictable = st.leaf.as_ref().is_some_and(|leaf| ctx.evictable(leaf));
        if !evictable {
            conn.env.stats.incr(Stat::CacheEvictionFail);
            return Ok(false);
        }
        let out = reconcile(tree, &mut st, &page.lower, ctx)?;
        if !out.clean {
            conn.env.stats.incr(Stat::CacheEvictionFail);
            return Ok(false);
        }
        st.dirty = false;
        st.force_rewrite = false;
        tree.mark_root_dirty();
    }
    tree.release(&mut st);
    conn.env.stats.incr(Stat::CachePagesEvicted);
    tree.stats.incr(Stat::CachePagesEvicted);
    trace!(tree = %tree.name, "evicted page");
    Ok(true)
}

/// Runs one eviction pass. Stops once pressure falls to `Idle`, or
/// evicts everything possible when `aggressive`. Returns pages evicted.
pub(crate) fn evict_pass(conn: &ConnInner, aggressive: bool) -> Result<u64> {
    let mut candidates: Vec<(u64, Arc<Btree>, Arc<PageRef>)> = Vec::new();
    for tree in conn.all_trees() {
        for page in tree.pages() {
            let Some(st) = page.state.try_lock() else { continue };
            if st.leaf.is_some() && !st.stale {
                candidates.push((st.read_gen, tree.clone(), page.clone()));
            }
        }
    }
    candidates.sort_by_key(|(read_gen, ..)| *read_gen);

    let view = PassView::take(conn);
    let ctx = view.ctx(conn);
    let mut evicted = 0;
    for (_, tree, page) in candidates {
        if !aggressive && conn.env.cache.pressure() == Pressure::Idle {
            break;
        }
        if evict_page(conn, &tree, &page, &ctx)? {
            evicted += 1;
        }
    }
    if evicted > 0 {
        metrics::record_eviction(evicted);
        let usage = conn.env.cache.usage();
        metrics::set_cache_usage(usage.bytes_inmem, usage.bytes_dirty);
        debug!(evicted, inmem = usage.bytes_inmem, dirty = usage.bytes_dirty, "eviction pass");
    }
    Ok(evicted)
}

/// Evicts the page holding `key`, for cursors configured to release pages.
pub(crate) fn release_page(conn: &ConnInner, tree: &Btree, key: &[u8]) -> Result<bool> {
    let page = tree.page_for(key);
    let view = PassView::take(conn);
    evict_page(conn, tree, &page, &view.ctx(conn))
}

/// Evicts every page of `tree` that can leave, for the handle sweep.
pub(crate) fn evict_tree(conn: &ConnInner, tree: &Btree) -> Result<u64> {
    let view = PassView::take(conn);
    let ctx = view.ctx(conn);
    let mut evicted = 0;
    for page in tree.pages() {
        if evict_page(conn, tree, &page, &ctx)? {
            evicted += 1;
        }
    }
    Ok(evicted)
}

/// Called by application threads before an operation that adds to the
/// cache. Helps evict while usage is above a trigger.
///
/// # Errors
///
/// - [`Error::CacheFull`] when the cache is over capacity and nothing more
///   can be evicted, or `max_wait_ms` elapsed
/// - [`Error::Rollback`] instead when the caller's own transaction holds
///   updates, since only rolling it back can free space
pub(crate) fn wait_for_space(conn: &ConnInner, max_wait_ms: u64, has_writes: bool) -> Result<()> {
    let cache = &conn.env.cache;
    if cache.pressure() != Pressure::Trigger {
        return Ok(());
    }
    let started = Instant::now();
    loop {
        let evicted = evict_pass(conn, false)?;
        if cache.pressure() != Pressure::Trigger {
            return Ok(());
        }
        let timed_out = max_wait_ms > 0 && started.elapsed() >= Duration::from_millis(max_wait_ms);
        let stuck = evicted == 0 && cache.over_capacity();
        if timed_out || stuck {
            let usage = cache.usage();
            debug!(inmem = usage.bytes_inmem, max = usage.max_bytes, timed_out, "cache full");
            if has_writes {
                return Err(Error::rollback("transaction rolled back because the cache is full"));
            }
            return Err(Error::CacheFull);
        }
        if evicted == 0 {
            // Below capacity with nothing evictable: proceed and leave the rest to the server.
            return Ok(());
        }
        std::thread::sleep(APP_RETRY);
    }
}
