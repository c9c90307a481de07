//! Reconciliation: turning an in-memory leaf into a page image.
//!
//! For every key the newest *eligible* version becomes the on-page cell.
//! Which versions are eligible depends on who is asking:
//!
//! - a checkpoint takes versions its snapshot sees, at or below its
//!   timestamp, plus prepared versions captured when it started;
//! - eviction takes everything committed (and, with precise checkpoints,
//!   durable at or below stable) and refuses pages holding anything else.
//!
//! Older versions that some reader may still need are copied into the
//! history store before the image is written, with their stop point set to
//! the start of the version that displaced them. Reconciliation never
//! changes what a reader sees in memory; it only marks which versions
//! already live in history.

use std::{collections::HashSet, sync::Arc};

use cellar_types::{TS_MAX, TS_NONE, Timestamp, codec};
use tracing::trace;
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    btree::{Btree, LeafPage, PageState, Slot},
    error::{Error, Result},
    hs::HistoryStore,
    page::{Cell, DeltaImage, LeafImage, PageDel, PageImage, PrepareState, RootEntry, TimeWindow},
    stats::Stat,
    txn::{Snapshot, TXN_MAX, TXN_NONE, VisibleAll},
    update::{UpdIdx, Update, UpdateKind},
};

/// What a checkpoint may write.
#[derive(Debug, Clone)]
pub(crate) struct CheckpointView {
    pub snapshot: Snapshot,
    /// Checkpoint timestamp; `None` takes every committed version.
    pub ts: Option<Timestamp>,
    /// Transactions prepared when the checkpoint started.
    pub prepared: HashSet<u64>,
}

/// Who is reconciling.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RecMode<'a> {
    Checkpoint(&'a CheckpointView),
    Evict {
        /// Ids committed when the eviction pass started.
        committed: &'a Snapshot,
        /// Upper bound on durable timestamps written (precise checkpoints).
        stable: Option<Timestamp>,
    },
}

/// Everything one reconciliation needs besides the page.
#[derive(Clone, Copy)]
pub(crate) struct RecCtx<'a> {
    pub mode: RecMode<'a>,
    pub horizon: VisibleAll,
    pub hs: Option<&'a HistoryStore>,
    /// Deltas allowed on top of a full image in shared storage.
    pub max_delta_depth: u32,
}

/// Result of reconciling one page.
#[derive(Debug, Clone)]
pub(crate) struct RecOutcome {
    /// What the tree root records for this page.
    pub entry: RootEntry,
    /// Nothing newer than the written image remains in memory.
    pub clean: bool,
    /// A block was written.
    pub written: bool,
    /// The page is fast-truncated for every reader and can leave the tree.
    pub obsolete: bool,
}

/// One version of a key, newest first, as reconciliation sees it.
#[derive(Debug)]
struct Version {
    /// `None` for a delete.
    value: Option<Vec<u8>>,
    txn: u64,
    ts: Timestamp,
    durable: Timestamp,
    prepared: bool,
    origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Chain { idx: UpdIdx, in_hs: bool },
    DiskStop,
    Disk,
}

/// Per-key output.
#[derive(Debug, Default)]
struct SlotPlan {
    cell: Option<Cell>,
    history: Vec<Cell>,
    written: Vec<UpdIdx>,
    disk_written: bool,
    /// Versions remain that this pass could not write.
    pending: bool,
}

impl RecCtx<'_> {
    fn point_eligible(&self, txn: u64, ts: Timestamp, durable: Timestamp, prepare: PrepareState) -> bool {
        let newest = durable.max(ts);
        match self.mode {
            RecMode::Checkpoint(view) => {
                if prepare == PrepareState::InProgress {
                    return view.prepared.contains(&txn) && view.ts.is_none_or(|t| ts <= t);
                }
                view.snapshot.visible(txn) && view.ts.is_none_or(|t| newest <= t)
            },
            RecMode::Evict { committed, stable } => {
                prepare != PrepareState::InProgress
                    && committed.visible(txn)
                    && stable.is_none_or(|s| newest <= s)
            },
        }
    }

    fn update_eligible(&self, upd: &Update) -> bool {
        self.point_eligible(upd.txn_id, upd.start_ts, upd.durable_ts, upd.prepare)
    }

    fn page_del_eligible(&self, del: &PageDel) -> bool {
        self.point_eligible(del.txn_id, del.ts, del.durable_ts, del.prepare)
    }

    fn obsolete(&self, txn: u64, ts: Timestamp, durable: Timestamp, prepared: bool) -> bool {
        !prepared && self.horizon.visible(txn, durable.max(ts))
    }

    /// True when every live update on the page can be written now.
    pub fn evictable(&self, leaf: &LeafPage) -> bool {
        leaf.slots.values().all(|slot| {
            leaf.arena
                .chain(slot.head)
                .filter(|(_, u)| !u.is_aborted())
                .all(|(_, u)| !u.is_reserve() && self.update_eligible(u))
        })
    }

    fn plan_slot(&self, leaf: &LeafPage, slot: &Slot) -> SlotPlan {
        let mut reserved = false;
        let live: Vec<(UpdIdx, &Update)> = leaf
            .arena
            .chain(slot.head)
            .filter(|(_, u)| !u.is_aborted())
            .filter(|(_, u)| {
                reserved |= u.is_reserve();
                !u.is_reserve()
            })
            .collect();
        let selected = live.iter().position(|(_, u)| self.update_eligible(u));
        let pending = reserved || selected.map_or(!live.is_empty(), |pos| pos > 0);
        let Some(selected) = selected else {
            return SlotPlan { cell: slot.disk.clone(), pending, ..Default::default() };
        };

        let mut versions = Vec::with_capacity(live.len() - selected + 2);
        for &(idx, upd) in &live[selected..] {
            let value = match &upd.kind {
                UpdateKind::Standard(v) => Some(v.clone()),
                UpdateKind::Modify(_) => leaf.materialize(slot, idx),
                UpdateKind::Tombstone | UpdateKind::Reserve => None,
            };
            versions.push(Version {
                value,
                txn: upd.txn_id,
                ts: upd.start_ts,
                durable: upd.durable_ts,
                prepared: upd.is_prepared(),
                origin: Origin::Chain { idx, in_hs: upd.hs_written },
            });
        }
        if let Some(cell) = &slot.disk {
            let tw = &cell.tw;
            if tw.has_stop() {
                versions.push(Version {
                    value: None,
                    txn: tw.stop_txn,
                    ts: tw.stop_ts,
                    durable: tw.durable_stop_ts,
                    prepared: tw.prepared_stop(),
                    origin: Origin::DiskStop,
                });
            }
            versions.push(Version {
                value: Some(cell.value.clone()),
                txn: tw.start_txn,
                ts: tw.start_ts,
                durable: tw.durable_start_ts,
                prepared: tw.prepared_start(),
                origin: Origin::Disk,
            });
        }

        let mut plan = SlotPlan { pending, ..Default::default() };
        let Some(on_page) = versions.iter().position(|v| v.value.is_some()) else {
            return plan;
        };
        let v = &versions[on_page];
        let mut tw = TimeWindow::starting(v.txn, v.ts, v.durable);
        tw.prepared = v.prepared;
        if on_page > 0 {
            let stop = &versions[on_page - 1];
            if self.obsolete(stop.txn, stop.ts, stop.durable, stop.prepared) {
                return plan;
            }
            tw = tw.with_stop(stop.txn, stop.ts, stop.durable);
            tw.prepared = stop.prepared;
        }
        plan.cell = v.value.clone().map(|value| Cell::new(tw, value));

        for pair in versions[on_page..].windows(2) {
            let (newer, older) = (&pair[0], &pair[1]);
            if self.obsolete(newer.txn, newer.ts, newer.durable, newer.prepared) {
                break;
            }
            let Some(value) = &older.value else { continue };
            let already = match older.origin {
                Origin::Chain { in_hs, .. } => in_hs,
                Origin::Disk => slot.disk_in_hs,
                Origin::DiskStop => true,
            };
            if already {
                continue;
            }
            let mut tw = TimeWindow::starting(older.txn, older.ts, older.durable)
                .with_stop(newer.txn, newer.ts, newer.durable);
            tw.prepared = newer.prepared;
            plan.history.push(Cell::new(tw, value.clone()));
            match older.origin {
                Origin::Chain { idx, .. } => plan.written.push(idx),
                Origin::Disk => plan.disk_written = true,
                Origin::DiskStop => {},
            }
        }
        plan
    }
}

fn bump(tree: &Btree, stat: Stat) {
    tree.stats.incr(stat);
    tree.env.stats.incr(stat);
}

fn count_window(tree: &Btree, tw: &TimeWindow) {
    if tw.start_ts != TS_NONE {
        bump(tree, Stat::RecTimeWindowStartTs);
    }
    if tw.durable_start_ts != TS_NONE {
        bump(tree, Stat::RecTimeWindowDurableStartTs);
    }
    if tw.start_txn != TXN_NONE {
        bump(tree, Stat::RecTimeWindowStartTxn);
    }
    if tw.has_stop() {
        if tw.stop_ts != TS_NONE && tw.stop_ts != TS_MAX {
            bump(tree, Stat::RecTimeWindowStopTs);
        }
        if tw.durable_stop_ts != TS_NONE {
            bump(tree, Stat::RecTimeWindowDurableStopTs);
        }
        if tw.stop_txn != TXN_NONE && tw.stop_txn != TXN_MAX {
            bump(tree, Stat::RecTimeWindowStopTxn);
        }
    }
    if tw.prepared {
        bump(tree, Stat::RecTimeWindowPrepared);
    }
}

/// Reconciles one page. The caller holds the page lock.
pub(crate) fn reconcile(tree: &Btree, st: &mut PageState, lower: &[u8], ctx: &RecCtx<'_>) -> Result<RecOutcome> {
    bump(tree, Stat::RecPages);
    if let Some(del) = st.page_del {
        if !st.has_updates() {
            let eligible = ctx.page_del_eligible(&del);
            if eligible && matches!(ctx.mode, RecMode::Checkpoint(_)) {
                bump(tree, Stat::RecPageDeleteFast);
            }
            let obsolete =
                eligible && ctx.obsolete(del.txn_id, del.ts, del.durable_ts, del.prepare == PrepareState::InProgress);
            return Ok(RecOutcome {
                entry: RootEntry { lower: lower.to_vec(), addr: st.addr, page_del: eligible.then_some(del) },
                clean: eligible,
                written: false,
                obsolete,
            });
        }
    }

    tree.load(st)?;
    let hs = ctx.hs.filter(|hs| hs.tree().id != tree.id);
    let leaf = st.leaf.as_ref().ok_or_else(|| Error::corrupt(format!("{}: page not loaded", tree.name)))?;
    let mut cells = Vec::with_capacity(leaf.slots.len());
    let mut history = Vec::new();
    let mut written = Vec::new();
    let mut disk_written = Vec::new();
    let mut pending = false;
    let overflow = tree.leaf_page_max() / 4;
    for (key, slot) in &leaf.slots {
        let plan = ctx.plan_slot(leaf, slot);
        pending |= plan.pending;
        if let Some(cell) = plan.cell {
            if cell.value.len() as u64 > overflow {
                bump(tree, Stat::RecOverflowValue);
            }
            if key.len() as u64 > overflow {
                bump(tree, Stat::RecOverflowKeyLeaf);
            }
            count_window(tree, &cell.tw);
            cells.push((key.clone(), cell));
        }
        if hs.is_some() {
            history.extend(plan.history.into_iter().map(|cell| (key.clone(), cell)));
            written.extend(plan.written);
            if plan.disk_written {
                disk_written.push(key.clone());
            }
        }
    }

    // History goes first: a version must never be missing from both places.
    if let Some(hs) = hs {
        for (key, cell) in &history {
            hs.insert(tree.id, key, cell)?;
        }
    }
    if let Some(leaf) = st.leaf.as_mut() {
        for idx in written {
            leaf.arena.get_mut(idx).hs_written = true;
        }
        for key in disk_written {
            if let Some(slot) = leaf.slots.get_mut(&key) {
                slot.disk_in_hs = true;
            }
        }
    }

    let wrote = write_image(tree, st, LeafImage { cells }, ctx)?;
    trace!(tree = %tree.name, history = history.len(), wrote, pending, "reconciled page");
    Ok(RecOutcome {
        entry: RootEntry { lower: lower.to_vec(), addr: st.addr, page_del: None },
        clean: !pending,
        written: wrote,
        obsolete: false,
    })
}

/// Writes a leaf image, as a delta when the store is shared and the chain
/// is short enough. Identical images and empty deltas are skipped.
fn write_image(tree: &Btree, st: &mut PageState, image: LeafImage, ctx: &RecCtx<'_>) -> Result<bool> {
    if image.cells.is_empty() {
        let had = st.addr.is_some();
        st.addr = None;
        st.delta_chain.clear();
        st.delta_depth = 0;
        st.last_image = None;
        st.image_hash = None;
        st.force_rewrite = false;
        return Ok(had);
    }
    let hash = xxh3_64(&codec::encode(&image)?);
    if st.image_hash == Some(hash) && st.addr.is_some() && !st.force_rewrite {
        return Ok(false);
    }

    let store = tree.store().clone();
    let write_gen = tree.env.next_write_gen();
    let delta = match (&st.last_image, st.addr) {
        (Some(last), Some(base)) if store.is_shared() && !st.force_rewrite && st.delta_depth < ctx.max_delta_depth => {
            Some((diff(last, &image), base))
        },
        _ => None,
    };
    let (block, base) = match delta {
        Some((changes, _)) if changes.is_empty() => {
            st.image_hash = Some(hash);
            return Ok(false);
        },
        Some((changes, base)) => {
            let depth = st.delta_depth + 1;
            (PageImage::Delta(DeltaImage { base, depth, changes }).encode(write_gen)?, Some(base))
        },
        None => (PageImage::Leaf(image.clone()).encode(write_gen)?, None),
    };

    let addr = store.write(&block, st.addr.as_ref())?;
    tree.env.stats.incr(Stat::BlockWrite);
    tree.env.stats.add(Stat::BlockBytesWritten, block.len() as u64);
    match base {
        Some(base) => {
            st.delta_chain.insert(0, base);
            st.delta_depth += 1;
            bump(tree, Stat::RecPageDeltaLeaf);
        },
        None => {
            st.delta_chain.clear();
            st.delta_depth = 0;
        },
    }
    st.addr = Some(addr);
    st.last_image = store.is_shared().then(|| Arc::new(image));
    st.image_hash = Some(hash);
    st.force_rewrite = false;
    Ok(true)
}

/// Per-key changes turning `old` into `new`.
fn diff(old: &LeafImage, new: &LeafImage) -> Vec<(Vec<u8>, Option<Cell>)> {
    let mut changes = Vec::new();
    let mut a = old.cells.iter().peekable();
    let mut b = new.cells.iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (None, None) => break,
            (Some((ka, _)), None) => {
                changes.push((ka.clone(), None));
                a.next();
            },
            (None, Some((kb, cb))) => {
                changes.push((kb.clone(), Some(cb.clone())));
                b.next();
            },
            (Some((ka, ca)), Some((kb, cb))) => match ka.cmp(kb) {
                std::cmp::Ordering::Less => {
                    changes.push((ka.clone(), None));
                    a.next();
                },
                std::cmp::Ordering::Greater => {
                    changes.push((kb.clone(), Some(cb.clone())));
                    b.next();
                },
                std::cmp::Ordering::Equal => {
                    if ca != cb {
                        changes.push((kb.clone(), Some(cb.clone())));
                    }
                    a.next();
                    b.next();
                },
            },
        }
    }
    changes
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{
        btree::{
            Expect, Lookup, TreeKind, WriteCtx,
            tests::{test_env, tree_in},
        },
        hs::HS_BTREE_ID,
        page::read_leaf,
        txn::Reader,
    };

    struct Fixture {
        tree: Btree,
        hs: HistoryStore,
    }

    fn fixture() -> Fixture {
        let env = test_env();
        let hs = HistoryStore::new(Arc::new(tree_in(HS_BTREE_ID, TreeKind::Row, env.clone())));
        Fixture { tree: tree_in(7, TreeKind::Row, env), hs }
    }

    fn put(tree: &Btree, key: &str, kind: UpdateKind, ts: u64) {
        tree.write(key.as_bytes(), kind, &WriteCtx::global_at(ts), Expect::Any).unwrap();
    }

    fn value(v: &str) -> UpdateKind {
        UpdateKind::Standard(v.as_bytes().to_vec())
    }

    fn view(ts: Option<u64>) -> CheckpointView {
        CheckpointView { snapshot: Snapshot::everything(), ts, prepared: HashSet::new() }
    }

    fn checkpoint_ctx<'a>(view: &'a CheckpointView, hs: &'a HistoryStore) -> RecCtx<'a> {
        RecCtx {
            mode: RecMode::Checkpoint(view),
            horizon: VisibleAll { oldest_id: 1, pinned_ts: Some(1) },
            hs: Some(hs),
            max_delta_depth: 0,
        }
    }

    fn reconcile_first(f: &Fixture, ctx: &RecCtx<'_>) -> RecOutcome {
        let page = f.tree.first_page();
        let mut st = page.state.lock();
        reconcile(&f.tree, &mut st, &page.lower, ctx).unwrap()
    }

    #[test]
    fn test_checkpoint_writes_only_versions_at_its_timestamp() {
        let f = fixture();
        put(&f.tree, "k", value("v10"), 10);
        put(&f.tree, "k", value("v20"), 20);
        let early = view(Some(15));
        let out = reconcile_first(&f, &checkpoint_ctx(&early, &f.hs));
        assert!(out.written);
        assert!(!out.clean);
        let image = read_leaf(f.tree.store().as_ref(), &out.entry.addr.unwrap()).unwrap();
        assert_eq!(image.cells.len(), 1);
        assert_eq!(image.cells[0].1.value, b"v10");
        assert!(f.hs.all_entries().unwrap().is_empty());

        let later = view(Some(25));
        let out = reconcile_first(&f, &checkpoint_ctx(&later, &f.hs));
        assert!(out.clean);
        let image = read_leaf(f.tree.store().as_ref(), &out.entry.addr.unwrap()).unwrap();
        assert_eq!(image.cells[0].1.value, b"v20");
        assert_eq!(image.cells[0].1.tw.start_ts, 20);
        let history = f.hs.entries(7, Some(b"k")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cell.value, b"v10");
        assert_eq!(history[0].cell.tw.stop_ts, 20);
    }

    #[test]
    fn test_history_written_once() {
        let f = fixture();
        put(&f.tree, "k", value("a"), 10);
        put(&f.tree, "k", value("b"), 20);
        let v = view(Some(30));
        reconcile_first(&f, &checkpoint_ctx(&v, &f.hs));
        put(&f.tree, "k", value("c"), 30);
        reconcile_first(&f, &checkpoint_ctx(&v, &f.hs));
        let values: Vec<Vec<u8>> = f.hs.entries(7, Some(b"k")).unwrap().into_iter().map(|e| e.cell.value).collect();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(f.tree.env.stats.get(Stat::HsInsert), 2);
    }

    #[test]
    fn test_tombstone_becomes_stop_and_visible_delete_drops_key() {
        let f = fixture();
        put(&f.tree, "k", value("a"), 10);
        put(&f.tree, "k", UpdateKind::Tombstone, 20);
        let v = view(None);
        let out = reconcile_first(&f, &checkpoint_ctx(&v, &f.hs));
        let image = read_leaf(f.tree.store().as_ref(), &out.entry.addr.unwrap()).unwrap();
        assert_eq!(image.cells[0].1.tw.stop_ts, 20);

        let everything = RecCtx { horizon: VisibleAll::everything(), ..checkpoint_ctx(&v, &f.hs) };
        put(&f.tree, "j", value("keep"), 5);
        let out = reconcile_first(&f, &everything);
        let image = read_leaf(f.tree.store().as_ref(), &out.entry.addr.unwrap()).unwrap();
        assert_eq!(image.cells.len(), 1);
        assert_eq!(image.cells[0].0, b"j");
    }

    #[test]
    fn test_evicted_history_served_from_store() {
        let f = fixture();
        put(&f.tree, "k", value("old"), 10);
        put(&f.tree, "k", value("new"), 20);
        let committed = Snapshot::everything();
        let ctx = RecCtx {
            mode: RecMode::Evict { committed: &committed, stable: None },
            horizon: VisibleAll { oldest_id: 1, pinned_ts: Some(1) },
            hs: Some(&f.hs),
            max_delta_depth: 0,
        };
        {
            let page = f.tree.first_page();
            let mut st = page.state.lock();
            assert!(ctx.evictable(st.leaf.as_ref().unwrap()));
            reconcile(&f.tree, &mut st, &page.lower, &ctx).unwrap();
            st.dirty = false;
            f.tree.release(&mut st);
        }
        let at = |ts| Reader::at(Snapshot::everything(), Some(ts));
        assert_eq!(f.tree.search(b"k", &at(15), Some(&f.hs)).unwrap(), Lookup::Found(b"old".to_vec()));
        assert_eq!(f.tree.search(b"k", &at(25), Some(&f.hs)).unwrap(), Lookup::Found(b"new".to_vec()));
        assert_eq!(f.tree.search(b"k", &at(5), Some(&f.hs)).unwrap(), Lookup::Absent);
    }

    #[test]
    fn test_uncommitted_updates_block_eviction() {
        let f = fixture();
        let running = Snapshot { snap_min: 50, snap_max: 51, concurrent: vec![50] };
        let upd = Update::new(50, value("x"));
        {
            let page = f.tree.first_page();
            let mut st = f.tree.lock_loaded(&page).unwrap().unwrap();
            st.leaf.as_mut().unwrap().prepend(b"k", upd);
            let ctx = RecCtx {
                mode: RecMode::Evict { committed: &running, stable: None },
                horizon: VisibleAll::everything(),
                hs: Some(&f.hs),
                max_delta_depth: 0,
            };
            assert!(!ctx.evictable(st.leaf.as_ref().unwrap()));
        }
    }

    #[test]
    fn test_delta_diff() {
        let cell = |v: &str| Cell::new(TimeWindow::starting(1, 1, 1), v.as_bytes().to_vec());
        let old = LeafImage { cells: vec![(b"a".to_vec(), cell("1")), (b"b".to_vec(), cell("2"))] };
        let new = LeafImage { cells: vec![(b"b".to_vec(), cell("3")), (b"c".to_vec(), cell("4"))] };
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![(b"a".to_vec(), None), (b"b".to_vec(), Some(cell("3"))), (b"c".to_vec(), Some(cell("4")))]
        );
        assert!(diff(&new, &new).is_empty());
    }
}
