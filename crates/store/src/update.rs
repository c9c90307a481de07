//! In-memory update chains.
//!
//! Every write prepends an [`Update`] to its key's chain, newest first.
//! Chains for a page live in one [`UpdateArena`] and link by index, so a
//! page can be split or compacted by copying the live chains into a fresh
//! arena.

use cellar_types::{TS_NONE, Timestamp};

use crate::{
    modify::{ModifyEntry, modify_footprint},
    page::PrepareState,
    txn::TXN_ABORTED,
};

/// Fixed per-update overhead used for cache accounting.
const UPDATE_OVERHEAD: u64 = 64;

/// What an update does to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpdateKind {
    /// Full value.
    Standard(Vec<u8>),
    /// Delta against the next older version.
    Modify(Vec<ModifyEntry>),
    /// Delete.
    Tombstone,
    /// Placeholder holding the key for the writing transaction.
    Reserve,
}

impl UpdateKind {
    fn footprint(&self) -> u64 {
        match self {
            UpdateKind::Standard(v) => v.len() as u64,
            UpdateKind::Modify(entries) => modify_footprint(entries),
            UpdateKind::Tombstone | UpdateKind::Reserve => 0,
        }
    }
}

/// Index of an update within its page's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpdIdx(u32);

/// One version of a key.
#[derive(Debug, Clone)]
pub(crate) struct Update {
    pub txn_id: u64,
    /// Commit timestamp (prepare timestamp while prepared).
    pub start_ts: Timestamp,
    pub durable_ts: Timestamp,
    pub prepare: PrepareState,
    pub kind: UpdateKind,
    /// Already copied into the history store.
    pub hs_written: bool,
    next: Option<UpdIdx>,
}

impl Update {
    pub fn new(txn_id: u64, kind: UpdateKind) -> Self {
        Self {
            txn_id,
            start_ts: TS_NONE,
            durable_ts: TS_NONE,
            prepare: PrepareState::None,
            kind,
            hs_written: false,
            next: None,
        }
    }

    /// Committed with the given timestamps.
    pub fn committed(txn_id: u64, kind: UpdateKind, ts: Timestamp, durable: Timestamp) -> Self {
        Self { start_ts: ts, durable_ts: durable, ..Self::new(txn_id, kind) }
    }

    pub fn is_aborted(&self) -> bool {
        self.txn_id == TXN_ABORTED
    }

    pub fn is_reserve(&self) -> bool {
        matches!(self.kind, UpdateKind::Reserve)
    }

    pub fn is_prepared(&self) -> bool {
        self.prepare == PrepareState::InProgress
    }

    pub fn next(&self) -> Option<UpdIdx> {
        self.next
    }

    pub fn footprint(&self) -> u64 {
        UPDATE_OVERHEAD + self.kind.footprint()
    }
}

/// Storage for a page's update chains.
#[derive(Debug, Clone, Default)]
pub(crate) struct UpdateArena {
    nodes: Vec<Update>,
}

impl UpdateArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `upd` to the chain starting at `head`, returning the new head.
    pub fn prepend(&mut self, mut upd: Update, head: Option<UpdIdx>) -> UpdIdx {
        upd.next = head;
        self.nodes.push(upd);
        UpdIdx((self.nodes.len() - 1) as u32)
    }

    pub fn get(&self, idx: UpdIdx) -> &Update {
        &self.nodes[idx.0 as usize]
    }

    pub fn get_mut(&mut self, idx: UpdIdx) -> &mut Update {
        &mut self.nodes[idx.0 as usize]
    }

    /// Iterates a chain newest to oldest.
    pub fn chain(&self, head: Option<UpdIdx>) -> Chain<'_> {
        Chain { arena: self, next: head }
    }

    /// Newest update in the chain that is neither aborted nor a reserve.
    pub fn newest_live(&self, head: Option<UpdIdx>) -> Option<(UpdIdx, &Update)> {
        self.chain(head).find(|(_, u)| !u.is_aborted() && !u.is_reserve())
    }

    /// Drops `at` and everything older from the chain.
    pub fn cut(&mut self, head: &mut Option<UpdIdx>, at: UpdIdx) {
        if *head == Some(at) {
            *head = None;
            return;
        }
        let mut cursor = *head;
        while let Some(idx) = cursor {
            let next = self.get(idx).next;
            if next == Some(at) {
                self.get_mut(idx).next = None;
                return;
            }
            cursor = next;
        }
    }

    /// Copies a chain into `dst`, preserving order. Aborted updates are dropped.
    pub fn copy_chain(&self, head: Option<UpdIdx>, dst: &mut UpdateArena) -> Option<UpdIdx> {
        let live: Vec<&Update> = self.chain(head).map(|(_, u)| u).filter(|u| !u.is_aborted()).collect();
        let mut new_head = None;
        for upd in live.into_iter().rev() {
            new_head = Some(dst.prepend(upd.clone(), new_head));
        }
        new_head
    }

    /// Total footprint of a chain.
    pub fn chain_footprint(&self, head: Option<UpdIdx>) -> u64 {
        self.chain(head).map(|(_, u)| u.footprint()).sum()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Iterator over one update chain.
pub(crate) struct Chain<'a> {
    arena: &'a UpdateArena,
    next: Option<UpdIdx>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (UpdIdx, &'a Update);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let upd = self.arena.get(idx);
        self.next = upd.next;
        Some((idx, upd))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn full(v: &str) -> UpdateKind {
        UpdateKind::Standard(v.as_bytes().to_vec())
    }

    fn values(arena: &UpdateArena, head: Option<UpdIdx>) -> Vec<UpdateKind> {
        arena.chain(head).map(|(_, u)| u.kind.clone()).collect()
    }

    #[test]
    fn test_chain_is_newest_first() {
        let mut arena = UpdateArena::new();
        let mut head = None;
        for v in ["a", "b", "c"] {
            head = Some(arena.prepend(Update::new(1, full(v)), head));
        }
        assert_eq!(values(&arena, head), vec![full("c"), full("b"), full("a")]);
    }

    #[test]
    fn test_cut_drops_older() {
        let mut arena = UpdateArena::new();
        let a = arena.prepend(Update::new(1, full("a")), None);
        let b = arena.prepend(Update::new(1, full("b")), Some(a));
        let mut head = Some(arena.prepend(Update::new(1, full("c")), Some(b)));
        arena.cut(&mut head, b);
        assert_eq!(values(&arena, head), vec![full("c")]);
        let c = head.unwrap();
        arena.cut(&mut head, c);
        assert!(head.is_none());
    }

    #[test]
    fn test_copy_chain_skips_aborted() {
        let mut arena = UpdateArena::new();
        let a = arena.prepend(Update::new(1, full("a")), None);
        let b = arena.prepend(Update::new(TXN_ABORTED, full("b")), Some(a));
        let head = Some(arena.prepend(Update::new(2, UpdateKind::Tombstone), Some(b)));

        let mut dst = UpdateArena::new();
        let copied = arena.copy_chain(head, &mut dst);
        assert_eq!(dst.len(), 2);
        assert_eq!(values(&dst, copied), vec![UpdateKind::Tombstone, full("a")]);
    }

    #[test]
    fn test_newest_live_skips_reserve() {
        let mut arena = UpdateArena::new();
        let a = arena.prepend(Update::new(1, full("a")), None);
        let head = Some(arena.prepend(Update::new(2, UpdateKind::Reserve), Some(a)));
        let (idx, upd) = arena.newest_live(head).unwrap();
        assert_eq!(idx, a);
        assert_eq!(upd.kind, full("a"));
    }
}
