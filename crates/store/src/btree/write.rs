//! Writes and transaction resolution.
//!
//! A write prepends one update to its key's chain after checking that no
//! other transaction holds the key (first updater wins). Resolution walks
//! the chains a transaction touched and stamps, prepares or aborts its
//! updates.

use cellar_types::{TS_NONE, Timestamp};

use super::{Btree, Lookup, PageState, TreeKind, key_recno, page::MAX_MODIFY_CHAIN, page::newest_value};
use crate::{
    error::{Error, Result},
    hs::HistoryStore,
    modify::apply_modifies,
    page::{Cell, PageDel, PrepareState, TimeWindow},
    txn::{Reader, TXN_ABORTED, TXN_NONE},
    update::{Update, UpdateKind},
};

/// Who is writing and at what time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteCtx<'a> {
    /// Writer's view, used for conflict checks. `None` for global writes.
    pub reader: Option<&'a Reader>,
    pub txn_id: u64,
    /// Commit timestamp already set on the transaction, or `TS_NONE`.
    pub commit_ts: Timestamp,
    pub durable_ts: Timestamp,
}

impl WriteCtx<'_> {
    /// A write outside any transaction, committed immediately.
    pub fn global() -> Self {
        Self::global_at(TS_NONE)
    }

    /// A global write stamped with `ts`.
    pub fn global_at(ts: Timestamp) -> Self {
        WriteCtx { reader: None, txn_id: TXN_NONE, commit_ts: ts, durable_ts: ts }
    }

    fn is_global(&self) -> bool {
        self.txn_id == TXN_NONE
    }
}

/// Existence requirement checked atomically with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    Any,
    /// Fail with `NotFound` unless the key is visible.
    Exists,
    /// Fail with `DuplicateKey` if the key is visible.
    Absent,
}

/// What happens to a transaction's updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Commit { commit_ts: Timestamp, durable_ts: Timestamp },
    Prepare { prepare_ts: Timestamp },
    Rollback,
}

impl Resolution {
    fn apply(self, upd: &mut Update) {
        match self {
            Resolution::Commit { commit_ts, durable_ts } => {
                if upd.is_reserve() {
                    upd.txn_id = TXN_ABORTED;
                    return;
                }
                if upd.prepare == PrepareState::InProgress {
                    upd.prepare = PrepareState::Resolved;
                    upd.start_ts = commit_ts;
                } else if upd.start_ts == TS_NONE {
                    upd.start_ts = commit_ts;
                }
                upd.durable_ts = if durable_ts == TS_NONE { upd.start_ts } else { durable_ts.max(upd.start_ts) };
            },
            Resolution::Prepare { prepare_ts } => {
                if !upd.is_reserve() {
                    upd.prepare = PrepareState::InProgress;
                    upd.start_ts = prepare_ts;
                    upd.durable_ts = prepare_ts;
                }
            },
            Resolution::Rollback => upd.txn_id = TXN_ABORTED,
        }
    }

    /// Applies to a truncate marker. Returns false when the marker is gone.
    fn apply_page_del(self, del: &mut PageDel) -> bool {
        match self {
            Resolution::Commit { commit_ts, durable_ts } => {
                if del.prepare == PrepareState::InProgress {
                    del.prepare = PrepareState::Resolved;
                    del.ts = commit_ts;
                } else if del.ts == TS_NONE {
                    del.ts = commit_ts;
                }
                del.durable_ts = if durable_ts == TS_NONE { del.ts } else { durable_ts.max(del.ts) };
                true
            },
            Resolution::Prepare { prepare_ts } => {
                del.prepare = PrepareState::InProgress;
                del.ts = prepare_ts;
                del.durable_ts = prepare_ts;
                true
            },
            Resolution::Rollback => false,
        }
    }
}

fn conflict() -> Error {
    Error::rollback("conflict between concurrent operations")
}

impl Btree {
    /// Writes one update to `key`.
    pub(crate) fn write(&self, key: &[u8], kind: UpdateKind, ctx: &WriteCtx<'_>, expect: Expect) -> Result<()> {
        self.check_writable()?;
        let mut kind = Some(kind);
        self.with_page(key, |st| {
            let kind = kind.take().ok_or_else(|| Error::corrupt("write retried after success"))?;
            self.write_in_page(st, key, kind, ctx, expect)
        })?;
        if self.kind.is_column() {
            if let Some(recno) = key_recno(key) {
                self.extend_recno(recno);
            }
        }
        self.maybe_split(key)
    }

    fn write_in_page(
        &self,
        st: &mut PageState,
        key: &[u8],
        kind: UpdateKind,
        ctx: &WriteCtx<'_>,
        expect: Expect,
    ) -> Result<()> {
        self.instantiate_page_del(st, ctx)?;
        let leaf = st.leaf.as_mut().ok_or_else(|| Error::corrupt(format!("{}: page not loaded", self.name)))?;
        let slot = leaf.slots.get(key).cloned().unwrap_or_default();
        if !ctx.is_global() {
            check_conflict(leaf, &slot, ctx)?;
        }

        let needs_current = expect != Expect::Any || matches!(kind, UpdateKind::Modify(_));
        let current = if needs_current {
            match ctx.reader {
                Some(reader) => self.read_slot(leaf, &slot, None, key, reader, None)?,
                None => newest_value(leaf, &slot),
            }
        } else {
            Lookup::Absent
        };
        if self.kind != TreeKind::ColFix {
            match expect {
                Expect::Exists if !current.is_found() => return Err(Error::NotFound),
                Expect::Absent if current.is_found() => return Err(Error::DuplicateKey),
                _ => {},
            }
        }

        let kind = match kind {
            UpdateKind::Modify(entries) => {
                let Lookup::Found(mut value) = current else { return Err(Error::NotFound) };
                if leaf.modify_run(slot.head) + 1 >= MAX_MODIFY_CHAIN {
                    apply_modifies(&mut value, &entries);
                    UpdateKind::Standard(value)
                } else {
                    UpdateKind::Modify(entries)
                }
            },
            other => other,
        };

        let mut upd = Update::new(ctx.txn_id, kind);
        upd.start_ts = ctx.commit_ts;
        upd.durable_ts = if ctx.durable_ts == TS_NONE { ctx.commit_ts } else { ctx.durable_ts };
        leaf.prepend(key, upd);
        self.mark_dirty(st);
        Ok(())
    }

    /// Turns a truncate marker into per-key tombstones so the page can take
    /// a per-key write.
    fn instantiate_page_del(&self, st: &mut PageState, ctx: &WriteCtx<'_>) -> Result<()> {
        let Some(del) = st.page_del else { return Ok(()) };
        let own = !ctx.is_global() && del.txn_id == ctx.txn_id;
        if !own && !ctx.is_global() {
            if del.prepare == PrepareState::InProgress {
                return Err(Error::PrepareConflict);
            }
            if let Some(reader) = ctx.reader {
                if !reader.committed_for_write(del.txn_id) || reader.read_ts.is_some_and(|r| del.ts > r) {
                    return Err(conflict());
                }
            }
        }
        let leaf = st.leaf.as_mut().ok_or_else(|| Error::corrupt(format!("{}: page not loaded", self.name)))?;
        let keys: Vec<Vec<u8>> = leaf.slots.keys().cloned().collect();
        for key in keys {
            let tombstone = if self.kind == TreeKind::ColFix { UpdateKind::Standard(vec![0]) } else { UpdateKind::Tombstone };
            let mut upd = Update::new(del.txn_id, tombstone);
            upd.start_ts = del.ts;
            upd.durable_ts = del.durable_ts;
            upd.prepare = del.prepare;
            leaf.prepend(&key, upd);
        }
        st.page_del = None;
        self.mark_dirty(st);
        Ok(())
    }

    /// Commits, prepares or aborts `txn_id`'s updates to `key`.
    pub(crate) fn resolve_key(&self, key: &[u8], txn_id: u64, res: Resolution) -> Result<()> {
        self.with_page(key, |st| {
            let changed = resolve_slot(st, key, txn_id, res);
            if changed {
                self.mark_dirty(st);
            }
            Ok(())
        })
    }

    /// Resolves a fast truncate over `[lower, upper]` and any tombstones it
    /// was instantiated into.
    pub(crate) fn resolve_range(&self, lower: &[u8], upper: Option<&[u8]>, txn_id: u64, res: Resolution) -> Result<()> {
        let mut page = self.page_for(lower);
        loop {
            if let Some(mut st) = self.lock_loaded(&page)? {
                let mut changed = false;
                if let Some(mut del) = st.page_del.filter(|d| d.txn_id == txn_id) {
                    st.page_del = if res.apply_page_del(&mut del) { Some(del) } else { None };
                    changed = true;
                }
                let keys: Vec<Vec<u8>> = st
                    .leaf
                    .as_ref()
                    .map(|leaf| {
                        leaf.slots
                            .keys()
                            .filter(|k| k.as_slice() >= lower && upper.is_none_or(|u| k.as_slice() <= u))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                for key in keys {
                    changed |= resolve_slot(&mut st, &key, txn_id, res);
                }
                if changed {
                    self.mark_dirty(&mut st);
                }
            }
            match self.next_page(&page.lower) {
                Some(next) if upper.is_none_or(|u| next.lower.as_slice() <= u) => page = next,
                _ => return Ok(()),
            }
        }
    }

    /// Fails when committing `txn_id`'s update to `key` at `commit_ts`
    /// would order it before an older committed version.
    pub(crate) fn check_commit_order(&self, key: &[u8], txn_id: u64, commit_ts: Timestamp) -> Result<()> {
        if commit_ts == TS_NONE {
            return Ok(());
        }
        self.with_page(key, |st| {
            let Some(leaf) = st.leaf.as_ref() else { return Ok(()) };
            let Some(slot) = leaf.slots.get(key) else { return Ok(()) };
            let older = leaf
                .arena
                .chain(slot.head)
                .filter(|(_, u)| !u.is_aborted() && !u.is_reserve())
                .find(|(_, u)| u.txn_id != txn_id)
                .map(|(_, u)| u.start_ts)
                .or_else(|| {
                    slot.disk.as_ref().map(|c| if c.tw.has_stop() { c.tw.stop_ts } else { c.tw.start_ts })
                });
            match older {
                Some(ts) if ts != TS_NONE && ts != cellar_types::TS_MAX && ts > commit_ts => {
                    Err(Error::invalid(format!(
                        "commit timestamp {commit_ts} is older than the existing update's timestamp {ts}"
                    )))
                },
                _ => Ok(()),
            }
        })
    }
}

impl Btree {
    /// Moves a prepared change of `old_txn` found on disk back onto `key`'s
    /// update chain, owned by `txn_id`, so ordinary resolution applies.
    /// The version it displaced comes back from the history store.
    pub(crate) fn reinstate_prepared(
        &self,
        key: &[u8],
        old_txn: u64,
        txn_id: u64,
        prepare_ts: Timestamp,
        hs: Option<&HistoryStore>,
    ) -> Result<bool> {
        self.with_page(key, |st| {
            let changed = self.reinstate_slot(st, key, old_txn, txn_id, prepare_ts, hs)?;
            if changed {
                self.mark_dirty(st);
            }
            Ok(changed)
        })
    }

    /// Hands truncate markers and prepared deletes of `old_txn` within
    /// `[lower, upper]` to `txn_id`.
    pub(crate) fn reinstate_range(
        &self,
        lower: &[u8],
        upper: Option<&[u8]>,
        old_txn: u64,
        txn_id: u64,
        prepare_ts: Timestamp,
    ) -> Result<()> {
        let mut page = self.page_for(lower);
        loop {
            if let Some(mut st) = self.lock_loaded(&page)? {
                let mut changed = false;
                if let Some(del) = st.page_del.as_mut().filter(|d| d.txn_id == old_txn) {
                    del.txn_id = txn_id;
                    changed = true;
                }
                let keys: Vec<Vec<u8>> = st
                    .leaf
                    .as_ref()
                    .map(|leaf| {
                        leaf.slots
                            .keys()
                            .filter(|k| k.as_slice() >= lower && upper.is_none_or(|u| k.as_slice() <= u))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                for key in keys {
                    changed |= self.reinstate_slot(&mut st, &key, old_txn, txn_id, prepare_ts, None)?;
                }
                if changed {
                    self.mark_dirty(&mut st);
                }
            }
            match self.next_page(&page.lower) {
                Some(next) if upper.is_none_or(|u| next.lower.as_slice() <= u) => page = next,
                _ => return Ok(()),
            }
        }
    }

    fn reinstate_slot(
        &self,
        st: &mut PageState,
        key: &[u8],
        old_txn: u64,
        txn_id: u64,
        prepare_ts: Timestamp,
        hs: Option<&HistoryStore>,
    ) -> Result<bool> {
        let Some(leaf) = st.leaf.as_mut() else { return Ok(false) };
        let Some(cell) = leaf.slots.get(key).and_then(|s| s.disk.clone()) else { return Ok(false) };
        let tw = cell.tw;
        let (kind, restored) = if tw.prepared_stop() && tw.stop_txn == old_txn {
            let kind = if self.kind == TreeKind::ColFix { UpdateKind::Standard(vec![0]) } else { UpdateKind::Tombstone };
            (kind, Some(Cell::new(clear_stop(tw), cell.value)))
        } else if tw.prepared_start() && tw.start_txn == old_txn {
            let mut restored = None;
            if let Some(hs) = hs {
                let displaced = hs.entries(self.id, Some(key))?.into_iter().rfind(|e| e.cell.tw.stop_txn == old_txn);
                if let Some(entry) = displaced {
                    hs.remove(&entry)?;
                    restored = Some(Cell::new(clear_stop(entry.cell.tw), entry.cell.value));
                }
            }
            (UpdateKind::Standard(cell.value), restored)
        } else {
            return Ok(false);
        };
        if let Some(slot) = leaf.slots.get_mut(key) {
            slot.disk = restored;
            slot.disk_in_hs = false;
        }
        let mut upd = Update::new(txn_id, kind);
        upd.prepare = PrepareState::InProgress;
        upd.start_ts = prepare_ts;
        upd.durable_ts = prepare_ts;
        leaf.prepend(key, upd);
        Ok(true)
    }
}

fn clear_stop(tw: TimeWindow) -> TimeWindow {
    TimeWindow::starting(tw.start_txn, tw.start_ts, tw.durable_start_ts)
}

fn check_conflict(leaf: &super::LeafPage, slot: &super::Slot, ctx: &WriteCtx<'_>) -> Result<()> {
    let Some(reader) = ctx.reader else { return Ok(()) };
    if let Some((_, upd)) = leaf.arena.chain(slot.head).find(|(_, u)| !u.is_aborted()) {
        if upd.txn_id == ctx.txn_id {
            return Ok(());
        }
        if upd.is_prepared() {
            return Err(Error::PrepareConflict);
        }
        if !reader.committed_for_write(upd.txn_id) || reader.read_ts.is_some_and(|r| upd.start_ts > r) {
            return Err(conflict());
        }
        return Ok(());
    }
    let Some(cell) = &slot.disk else { return Ok(()) };
    let tw = &cell.tw;
    let (txn, ts) = if tw.has_stop() { (tw.stop_txn, tw.stop_ts) } else { (tw.start_txn, tw.start_ts) };
    if tw.prepared {
        return Err(Error::PrepareConflict);
    }
    if !reader.committed_for_write(txn) || reader.read_ts.is_some_and(|r| ts != cellar_types::TS_MAX && ts > r) {
        return Err(conflict());
    }
    Ok(())
}

fn resolve_slot(st: &mut PageState, key: &[u8], txn_id: u64, res: Resolution) -> bool {
    let Some(leaf) = st.leaf.as_mut() else { return false };
    let Some(head) = leaf.slots.get(key).and_then(|s| s.head) else { return false };
    let owned: Vec<_> = leaf.arena.chain(Some(head)).filter(|(_, u)| u.txn_id == txn_id).map(|(idx, _)| idx).collect();
    for idx in &owned {
        res.apply(leaf.arena.get_mut(*idx));
    }
    !owned.is_empty()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{
        btree::tests::test_tree,
        modify::ModifyEntry,
        txn::Snapshot,
    };

    fn value(v: &str) -> UpdateKind {
        UpdateKind::Standard(v.as_bytes().to_vec())
    }

    fn txn_reader(id: u64, snapshot: Snapshot, read_ts: Option<u64>) -> Reader {
        Reader { txn_id: id, ..Reader::at(snapshot, read_ts) }
    }

    fn ctx<'a>(reader: &'a Reader) -> WriteCtx<'a> {
        WriteCtx { reader: Some(reader), txn_id: reader.txn_id, commit_ts: TS_NONE, durable_ts: TS_NONE }
    }

    #[test]
    fn test_first_updater_wins() {
        let tree = test_tree(TreeKind::Row);
        let snap = Snapshot { snap_min: 10, snap_max: 12, concurrent: vec![10, 11] };
        let t1 = txn_reader(10, snap.clone(), None);
        let t2 = txn_reader(11, snap, None);
        tree.write(b"k", value("one"), &ctx(&t1), Expect::Any).unwrap();
        let err = tree.write(b"k", value("two"), &ctx(&t2), Expect::Any).unwrap_err();
        assert!(err.is_rollback());
        tree.resolve_key(b"k", 10, Resolution::Rollback).unwrap();
        tree.write(b"k", value("two"), &ctx(&t2), Expect::Any).unwrap();
    }

    #[test]
    fn test_newer_committed_timestamp_conflicts() {
        let tree = test_tree(TreeKind::Row);
        tree.write(b"k", value("v50"), &WriteCtx::global_at(50), Expect::Any).unwrap();
        let reader = txn_reader(20, Snapshot::everything(), Some(25));
        let err = tree.write(b"k", value("v30"), &ctx(&reader), Expect::Any).unwrap_err();
        assert!(err.is_rollback());
    }

    #[test]
    fn test_insert_expectations() {
        let tree = test_tree(TreeKind::Row);
        let reader = txn_reader(5, Snapshot::everything(), None);
        assert!(tree.write(b"k", UpdateKind::Tombstone, &ctx(&reader), Expect::Exists).unwrap_err().is_not_found());
        tree.write(b"k", value("a"), &ctx(&reader), Expect::Absent).unwrap();
        assert!(matches!(tree.write(b"k", value("b"), &ctx(&reader), Expect::Absent), Err(Error::DuplicateKey)));
    }

    #[test]
    fn test_commit_stamps_timestamps() {
        let tree = test_tree(TreeKind::Row);
        let reader = txn_reader(5, Snapshot::everything(), None);
        tree.write(b"k", value("a"), &ctx(&reader), Expect::Any).unwrap();
        tree.resolve_key(b"k", 5, Resolution::Commit { commit_ts: 40, durable_ts: 45 }).unwrap();
        let after = Reader::at(Snapshot::everything(), Some(40));
        assert_eq!(tree.search(b"k", &after, None).unwrap(), Lookup::Found(b"a".to_vec()));
        let before = Reader::at(Snapshot::everything(), Some(39));
        assert_eq!(tree.search(b"k", &before, None).unwrap(), Lookup::Absent);
    }

    #[test]
    fn test_prepared_update_blocks_readers() {
        let tree = test_tree(TreeKind::Row);
        tree.write(b"k", value("1"), &WriteCtx::global_at(100), Expect::Any).unwrap();
        let writer = txn_reader(9, Snapshot::everything(), None);
        tree.write(b"k", value("2"), &ctx(&writer), Expect::Any).unwrap();
        tree.resolve_key(b"k", 9, Resolution::Prepare { prepare_ts: 200 }).unwrap();
        let reader = Reader::at(Snapshot::everything(), Some(250));
        assert!(matches!(tree.search(b"k", &reader, None), Err(Error::PrepareConflict)));
        tree.resolve_key(b"k", 9, Resolution::Commit { commit_ts: 300, durable_ts: 310 }).unwrap();
        let reader = Reader::at(Snapshot::everything(), Some(310));
        assert_eq!(tree.search(b"k", &reader, None).unwrap(), Lookup::Found(b"2".to_vec()));
    }

    #[test]
    fn test_long_modify_chains_collapse() {
        let tree = test_tree(TreeKind::Row);
        tree.write(b"k", value("aaaa"), &WriteCtx::global(), Expect::Any).unwrap();
        for i in 0..(MAX_MODIFY_CHAIN + 2) {
            let entry = ModifyEntry::new(vec![b'0' + (i % 10) as u8], 0, 1);
            tree.write(b"k", UpdateKind::Modify(vec![entry]), &WriteCtx::global(), Expect::Exists).unwrap();
        }
        let found = tree.search(b"k", &Reader::global(), None).unwrap();
        assert_eq!(found, Lookup::Found(b"1aaa".to_vec()));
        let page = tree.page_for(b"k");
        let st = page.state.lock();
        let leaf = st.leaf.as_ref().unwrap();
        assert!(leaf.modify_run(leaf.slots[b"k".as_slice()].head) < MAX_MODIFY_CHAIN);
    }

    #[test]
    fn test_commit_order_check() {
        let tree = test_tree(TreeKind::Row);
        tree.write(b"k", value("a"), &WriteCtx::global_at(50), Expect::Any).unwrap();
        let writer = txn_reader(9, Snapshot::everything(), None);
        tree.write(b"k", value("b"), &ctx(&writer), Expect::Any).unwrap();
        assert!(tree.check_commit_order(b"k", 9, 40).is_err());
        assert!(tree.check_commit_order(b"k", 9, 60).is_ok());
    }
}
