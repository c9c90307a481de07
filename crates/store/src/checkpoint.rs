//! Checkpoints.
//!
//! A checkpoint captures a snapshot (and, when timestamps are in use, the
//! stable timestamp) while commits are held off, then reconciles every
//! dirty page of every tree against that view. Trees with nothing to
//! write keep their previous root. The history store goes last because
//! reconciling user trees writes into it.
//!
//! Once every root is written and synced, one metadata commit makes the
//! checkpoint durable. Blocks the previous checkpoint used are only
//! released after that commit, so a crash at any point leaves the previous
//! checkpoint intact.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use cellar_types::{
    TS_NONE, Timestamp,
    config::{CheckpointConfig, SyncMethod, TimingStress},
};
use tracing::{debug, info};

use crate::{
    block::BlockAddr,
    btree::Btree,
    conn::ConnInner,
    error::{Error, Result},
    log::{LogRecord, Lsn},
    meta::{CheckpointRef, DEFAULT_CHECKPOINT, MetaImage},
    metrics,
    page::{PageImage, read_root},
    reconcile::{CheckpointView, RecCtx, RecMode, reconcile},
    stats::Stat,
    txn::{PreparedCatalog, TXN_NONE, TimestampRecord},
};

/// Every block a tree's named checkpoints and open state still reference.
pub(crate) fn referenced_blocks(tree: &Btree, image: &MetaImage) -> Result<Vec<BlockAddr>> {
    let mut blocks = tree.live_blocks();
    if let Some(checkpoints) = image.checkpoints.get(&tree.id) {
        for ckpt in checkpoints.values() {
            let Some(root) = ckpt.root else { continue };
            blocks.push(root);
            let root_image = read_root(tree.store().as_ref(), &root)?;
            blocks.extend(root_image.entries.iter().filter_map(|e| e.addr));
        }
    }
    Ok(blocks)
}

/// State captured while commits are held off.
struct Capture {
    record: TimestampRecord,
    view: CheckpointView,
    /// Logged trees are checkpointed without a timestamp; the log covers the rest.
    logged_view: CheckpointView,
    prepared: PreparedCatalog,
    txn_id_base: u64,
    ckpt_lsn: Option<Lsn>,
}

impl Capture {
    fn take(conn: &ConnInner, cfg: &CheckpointConfig) -> Self {
        let _gate = conn.commit_gate.write();
        conn.env.stress(TimingStress::PrepareCheckpointDelay);
        let record = conn.txn.ts.load();
        let snapshot = conn.txn.snapshot(TXN_NONE);
        let ts = (cfg.use_timestamp && record.stable != TS_NONE).then_some(record.stable);
        let mut prepared = conn.txn.prepared();
        prepared.retain(|_, entry| ts.is_none_or(|t| entry.prepare_ts <= t));
        let ids: HashSet<u64> = prepared.keys().copied().collect();
        let view = CheckpointView { snapshot: snapshot.clone(), ts, prepared: ids.clone() };
        let logged_view = CheckpointView { snapshot, ts: None, prepared: ids };
        Self {
            record,
            view,
            logged_view,
            prepared,
            txn_id_base: conn.txn.current_id(),
            ckpt_lsn: conn.log.as_ref().map(|log| log.current_lsn()),
        }
    }

    fn ts(&self) -> Timestamp {
        self.view.ts.unwrap_or(TS_NONE)
    }
}

/// Outcome of checkpointing one tree.
struct TreeResult {
    tree: Arc<Btree>,
    pages: u64,
    /// A new root was written.
    rooted: bool,
}

/// Takes a checkpoint.
pub(crate) fn checkpoint(conn: &ConnInner, cfg: &CheckpointConfig) -> Result<()> {
    let _ckpt = conn.checkpoint_lock.lock();
    checkpoint_locked(conn, cfg)
}

/// Takes a checkpoint; the caller holds the checkpoint lock.
pub(crate) fn checkpoint_locked(conn: &ConnInner, cfg: &CheckpointConfig) -> Result<()> {
    conn.env.check_panic()?;
    let config = conn.env.config();
    if config.readonly {
        return Err(Error::ReadOnly);
    }
    if config.in_memory {
        conn.env.stats.incr(Stat::TxnCheckpoint);
        return Ok(());
    }
    let record = conn.txn.ts.load();
    if config.precise_checkpoint {
        if !cfg.use_timestamp {
            return Err(Error::invalid("checkpoint: use_timestamp=false is not allowed with precise checkpoints"));
        }
        let timestamps_used = record.oldest != TS_NONE || record.max_committed_durable != TS_NONE;
        if record.stable == TS_NONE && timestamps_used {
            return Err(Error::invalid("checkpoint: precise checkpoints require a stable timestamp"));
        }
    }
    let name = cfg.name.clone().unwrap_or_else(|| DEFAULT_CHECKPOINT.to_string());
    for dropped in cfg.drop.iter().chain(cfg.name.iter()) {
        if conn.checkpoint_pinned(dropped) {
            return Err(Error::busy(format!("checkpoint {dropped} is open in a cursor")));
        }
    }
    let targets = target_ids(conn, &cfg.target)?;

    let started = Instant::now();
    conn.env.stats.set(Stat::CheckpointState, 1);
    let result = run(conn, cfg, &name, targets.as_ref());
    conn.env.stats.set(Stat::CheckpointState, 0);
    let pages = result?;
    conn.env.stats.incr(Stat::TxnCheckpoint);
    if cfg.flush_tier {
        conn.env.stats.incr(Stat::FlushTier);
    }
    metrics::record_checkpoint(started.elapsed().as_secs_f64(), pages);
    info!(checkpoint = %name, pages, elapsed_ms = started.elapsed().as_millis() as u64, "checkpoint complete");
    Ok(())
}

fn target_ids(conn: &ConnInner, uris: &[String]) -> Result<Option<HashSet<u64>>> {
    if uris.is_empty() {
        return Ok(None);
    }
    let mut ids = HashSet::new();
    for uri in uris {
        ids.extend(conn.data_target(uri)?.tree_ids());
    }
    Ok(Some(ids))
}

fn run(conn: &ConnInner, cfg: &CheckpointConfig, name: &str, targets: Option<&HashSet<u64>>) -> Result<u64> {
    let _schema = conn.schema_lock.lock();
    let capture = Capture::take(conn, cfg);
    let config = conn.env.config();
    let horizon = conn.txn.visible_all();
    let view_ctx = |logged: bool| RecCtx {
        mode: RecMode::Checkpoint(if logged { &capture.logged_view } else { &capture.view }),
        horizon,
        hs: Some(&conn.hs),
        max_delta_depth: config.disaggregated.max_delta_depth,
    };

    let mut trees: Vec<Arc<Btree>> = conn
        .user_trees()
        .into_iter()
        .filter(|t| !t.is_readonly())
        .filter(|t| targets.is_none_or(|ids| ids.contains(&t.id)))
        .collect();
    trees.push(conn.hs.tree().clone());

    let mut results = Vec::with_capacity(trees.len());
    for tree in trees {
        conn.env.stress(TimingStress::CheckpointSlow);
        let ctx = view_ctx(tree.is_logged());
        results.push(checkpoint_tree(conn, tree, &ctx, cfg.force)?);
    }
    let pages = results.iter().map(|r| r.pages).sum();

    let ckpt_ts = capture.ts();
    let write_gen = conn.env.write_gen();
    let now = chrono::Utc::now().timestamp();
    let mut meta = conn.meta.lock();
    let order = meta.image.ckpt_order + 1;
    meta.image.ckpt_order = order;
    for result in &results {
        let file_size = result.tree.store().size().unwrap_or(0);
        let ckpt = CheckpointRef { root: result.tree.root(), order, ts: ckpt_ts, write_gen, file_size, time: now };
        meta.image.checkpoints.entry(result.tree.id).or_default().insert(name.to_string(), ckpt);
    }
    for dropped in &cfg.drop {
        for checkpoints in meta.image.checkpoints.values_mut() {
            checkpoints.remove(dropped);
        }
        debug!(checkpoint = %dropped, "dropped checkpoint");
    }
    meta.image.txn_id_base = capture.txn_id_base;
    meta.image.write_gen = write_gen;
    meta.image.stable_ts = capture.record.stable;
    meta.image.oldest_ts = capture.record.oldest;
    meta.image.last_ckpt_ts = ckpt_ts;
    meta.image.prepared = capture.prepared.clone();
    if let Some(lsn) = capture.ckpt_lsn {
        meta.image.ckpt_lsn = Some(lsn);
        let retain = config.debug_mode.checkpoint_retention.max(1) as usize;
        meta.image.ckpt_log_files.push(lsn.file);
        let excess = meta.image.ckpt_log_files.len().saturating_sub(retain);
        meta.image.ckpt_log_files.drain(..excess);
    }
    if let Some(restore) = &conn.live_restore {
        meta.image.live_restore = restore.progress();
    }
    if let Some(disagg) = &conn.disagg {
        let ts = if ckpt_ts == TS_NONE { capture.record.stable } else { ckpt_ts };
        disagg.publish(&mut meta.image, ts, capture.txn_id_base)?;
    }
    meta.commit()?;

    // The previous checkpoint is no longer needed: release its blocks.
    // An open backup still copies them.
    let mut released = HashMap::new();
    let backup_open = conn.backup.lock().is_some();
    for result in results.iter().filter(|r| r.rooted && !backup_open) {
        let store = result.tree.store();
        store.begin_reclaim();
        store.reclaim(&referenced_blocks(&result.tree, &meta.image)?)?;
        let shrunk = store.truncate_tail()?;
        if shrunk > 0 {
            released.insert(result.tree.name.clone(), shrunk);
        }
    }
    let retain_from = meta.image.ckpt_log_files.first().copied();
    drop(meta);

    conn.txn.ts.update(|r| {
        r.last_checkpoint = ckpt_ts;
        Ok(())
    })?;
    if let (Some(log), Some(lsn)) = (&conn.log, capture.ckpt_lsn) {
        log.append(&LogRecord::Checkpoint { ckpt_lsn: lsn })?;
        log.flush(SyncMethod::Fsync)?;
        if let Some(first) = retain_from {
            log.remove_before(first)?;
        }
    }
    if !released.is_empty() {
        debug!(?released, "checkpoint released file space");
    }
    Ok(pages)
}

/// Reconciles every page of `tree` that changed and writes a new root.
fn checkpoint_tree(conn: &ConnInner, tree: Arc<Btree>, ctx: &RecCtx<'_>, force: bool) -> Result<TreeResult> {
    let mut pages = 0;
    let mut changed = tree.root_dirty() || force;
    let mut obsolete = Vec::new();
    for page in tree.pages() {
        let mut st = page.state.lock();
        if st.stale {
            continue;
        }
        let modified = st.dirty || st.force_rewrite;
        if !modified && st.page_del.is_none() {
            continue;
        }
        let out = reconcile(&tree, &mut st, &page.lower, ctx)?;
        if out.written {
            pages += 1;
        }
        if out.clean && st.dirty {
            st.dirty = false;
            tree.account(&mut st);
        }
        changed |= modified || out.written || out.obsolete;
        if out.obsolete {
            obsolete.push(page.clone());
        }
    }
    for page in &obsolete {
        tree.remove_page(page);
    }
    if !obsolete.is_empty() {
        debug!(tree = %tree.name, pages = obsolete.len(), "removed fast-truncated pages");
    }
    if !changed && tree.root().is_some() {
        return Ok(TreeResult { tree, pages, rooted: false });
    }

    let logged = tree.is_logged();
    if logged {
        if let Some(log) = &conn.log {
            log.append(&LogRecord::FileSync { btree_id: tree.id, start: true })?;
        }
    }
    let block = PageImage::Root(tree.root_image()).encode(conn.env.next_write_gen())?;
    let store = tree.store();
    let addr = store.write(&block, tree.root().as_ref())?;
    store.sync()?;
    conn.env.stats.incr(Stat::FsyncAllFhTotal);
    conn.env.stats.incr(Stat::BlockWrite);
    conn.env.stats.add(Stat::BlockBytesWritten, block.len() as u64);
    tree.set_root(addr);
    if logged {
        if let Some(log) = &conn.log {
            log.append(&LogRecord::FileSync { btree_id: tree.id, start: false })?;
        }
    }
    debug!(tree = %tree.name, pages, "checkpointed tree");
    Ok(TreeResult { tree, pages, rooted: true })
}
