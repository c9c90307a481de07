//! In-memory leaf pages.
//!
//! A loaded leaf keeps every key in a sorted map. Each key's [`Slot`] holds
//! the cell read from disk (if any) and the head of its update chain. The
//! chain is always newer than the disk cell.

use std::{collections::BTreeMap, sync::Arc};

use super::Lookup;
use crate::{
    block::BlockAddr,
    page::{Cell, LeafImage, PageDel},
    update::{UpdIdx, Update, UpdateArena, UpdateKind},
    modify::apply_modifies,
    txn::VisibleAll,
};

/// Consecutive modifies after which a write stores a full value instead.
pub(crate) const MAX_MODIFY_CHAIN: usize = 10;

/// Per-key state on a loaded page.
#[derive(Debug, Clone, Default)]
pub(crate) struct Slot {
    /// Cell from the page image this page was loaded from.
    pub disk: Option<Cell>,
    /// Newest update.
    pub head: Option<UpdIdx>,
    /// The disk cell has been copied into the history store.
    pub disk_in_hs: bool,
}

/// A loaded leaf page.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeafPage {
    pub slots: BTreeMap<Vec<u8>, Slot>,
    pub arena: UpdateArena,
}

impl LeafPage {
    pub fn from_image(image: LeafImage) -> Self {
        let slots = image
            .cells
            .into_iter()
            .map(|(key, cell)| (key, Slot { disk: Some(cell), head: None, disk_in_hs: false }))
            .collect();
        Self { slots, arena: UpdateArena::new() }
    }

    /// Bytes the page holds: keys, disk cells and update chains.
    pub fn footprint(&self) -> u64 {
        self.slots
            .iter()
            .map(|(key, slot)| {
                key.len() as u64
                    + slot.disk.as_ref().map_or(0, Cell::footprint)
                    + self.arena.chain_footprint(slot.head)
            })
            .sum()
    }

    /// Bytes held in update chains.
    pub fn update_bytes(&self) -> u64 {
        self.slots.values().map(|slot| self.arena.chain_footprint(slot.head)).sum()
    }

    /// Prepends an update to `key`'s chain, creating the slot if needed.
    pub fn prepend(&mut self, key: &[u8], upd: Update) -> UpdIdx {
        let slot = self.slots.entry(key.to_vec()).or_default();
        let idx = self.arena.prepend(upd, slot.head);
        slot.head = Some(idx);
        idx
    }

    /// Number of modifies at the head of a chain, ignoring aborted updates.
    pub fn modify_run(&self, head: Option<UpdIdx>) -> usize {
        self.arena
            .chain(head)
            .filter(|(_, u)| !u.is_aborted() && !u.is_reserve())
            .take_while(|(_, u)| matches!(u.kind, UpdateKind::Modify(_)))
            .count()
    }

    /// Builds the full value of the update at `at`, applying modifies on
    /// top of the next older full value (chain, then disk cell).
    pub fn materialize(&self, slot: &Slot, at: UpdIdx) -> Option<Vec<u8>> {
        let mut deltas = Vec::new();
        let mut base = None;
        let mut reached = false;
        for (idx, upd) in self.arena.chain(slot.head) {
            if idx == at {
                reached = true;
            }
            if !reached || upd.is_aborted() || upd.is_reserve() {
                continue;
            }
            match &upd.kind {
                UpdateKind::Standard(value) => {
                    base = Some(value.clone());
                    break;
                },
                UpdateKind::Modify(entries) => deltas.push(entries),
                UpdateKind::Tombstone => {
                    if deltas.is_empty() {
                        return None;
                    }
                    base = Some(Vec::new());
                    break;
                },
                UpdateKind::Reserve => {},
            }
        }
        if !reached {
            return None;
        }
        let mut value = match base {
            Some(value) => value,
            None => match &slot.disk {
                Some(cell) if !cell.tw.has_stop() => cell.value.clone(),
                _ => Vec::new(),
            },
        };
        for entries in deltas.into_iter().rev() {
            apply_modifies(&mut value, entries);
        }
        Some(value)
    }

    /// Drops history no reader can need: everything older than the newest
    /// globally visible committed update, and the disk cell below it.
    /// Returns the number of updates released.
    pub fn discard_obsolete(&mut self, horizon: &VisibleAll) -> usize {
        let keys: Vec<Vec<u8>> = self.slots.keys().cloned().collect();
        let mut released = 0;
        for key in keys {
            let Some(slot) = self.slots.get(&key).cloned() else { continue };
            let anchor = self
                .arena
                .chain(slot.head)
                .find(|(_, u)| !u.is_aborted() && !u.is_reserve() && horizon.update(u))
                .map(|(idx, u)| (idx, matches!(u.kind, UpdateKind::Modify(_))));
            let Some((idx, is_modify)) = anchor else { continue };
            if is_modify {
                if let Some(value) = self.materialize(&slot, idx) {
                    self.arena.get_mut(idx).kind = UpdateKind::Standard(value);
                }
            }
            let older = self.arena.get(idx).next();
            let mut head = slot.head;
            if let Some(older) = older {
                released += self.arena.chain(Some(older)).count();
                self.arena.cut(&mut head, older);
            }
            if let Some(entry) = self.slots.get_mut(&key) {
                entry.head = head;
                entry.disk = None;
            }
        }
        released
    }

    /// Rebuilds the arena when most of it is unreachable.
    pub fn compact_arena(&mut self) {
        let live: usize = self.slots.values().map(|s| self.arena.chain(s.head).count()).sum();
        if self.arena.len() < 64 || self.arena.len() < live * 2 {
            return;
        }
        let mut arena = UpdateArena::new();
        for slot in self.slots.values_mut() {
            slot.head = self.arena.copy_chain(slot.head, &mut arena);
        }
        self.arena = arena;
    }

    /// Drops slots with neither a disk cell nor live updates.
    pub fn prune_empty(&mut self) {
        let arena = &self.arena;
        self.slots.retain(|_, slot| slot.disk.is_some() || arena.chain(slot.head).any(|(_, u)| !u.is_aborted()));
    }

    /// Splits off the upper half of the keys, returning the new page's lower key.
    pub fn split_off_half(&mut self) -> Option<(Vec<u8>, LeafPage)> {
        if self.slots.len() < 2 {
            return None;
        }
        let mid = self.slots.keys().nth(self.slots.len() / 2).cloned()?;
        let upper_slots = self.slots.split_off(&mid);
        let mut left_arena = UpdateArena::new();
        for slot in self.slots.values_mut() {
            slot.head = self.arena.copy_chain(slot.head, &mut left_arena);
        }
        let mut right = LeafPage::default();
        for (key, mut slot) in upper_slots {
            slot.head = self.arena.copy_chain(slot.head, &mut right.arena);
            right.slots.insert(key, slot);
        }
        self.arena = left_arena;
        Some((mid, right))
    }
}

/// Mutable state of one page, behind the page lock.
#[derive(Debug, Default)]
pub(crate) struct PageState {
    /// Loaded contents; `None` when only on disk.
    pub leaf: Option<LeafPage>,
    /// Newest image of this page.
    pub addr: Option<BlockAddr>,
    /// Older images `addr` is a delta against, newest first.
    pub delta_chain: Vec<BlockAddr>,
    /// Depth of the delta chain under `addr`.
    pub delta_depth: u32,
    /// Image last written, kept to compute deltas against.
    pub last_image: Option<Arc<LeafImage>>,
    /// Hash of the last image written, to skip identical rewrites.
    pub image_hash: Option<u64>,
    /// Fast-truncate marker.
    pub page_del: Option<PageDel>,
    pub dirty: bool,
    /// Replaced by a split; lookups must retry.
    pub stale: bool,
    /// Must be rewritten at the next checkpoint even if clean.
    pub force_rewrite: bool,
    /// Last access, for eviction ordering.
    pub read_gen: u64,
    /// Bytes charged to the cache for this page.
    pub charged: u64,
    /// Bytes charged as dirty.
    pub charged_dirty: u64,
    /// Bytes charged as update chains.
    pub charged_updates: u64,
}

impl PageState {
    /// All blocks this page's current image depends on.
    pub fn blocks(&self) -> Vec<BlockAddr> {
        let mut blocks: Vec<BlockAddr> = self.addr.iter().copied().collect();
        blocks.extend(self.delta_chain.iter().copied());
        blocks
    }

    /// True when any chain holds an update that is not globally visible or
    /// belongs to an unresolved transaction.
    pub fn has_updates(&self) -> bool {
        self.leaf.as_ref().is_some_and(|leaf| leaf.slots.values().any(|s| s.head.is_some()))
    }
}

/// Resolves a value lookup on a slot's chain only, for callers that know
/// the chain holds the newest state (global writes).
pub(crate) fn newest_value(leaf: &LeafPage, slot: &Slot) -> Lookup {
    for (idx, upd) in leaf.arena.chain(slot.head) {
        if upd.is_aborted() || upd.is_reserve() {
            continue;
        }
        return match &upd.kind {
            UpdateKind::Standard(v) => Lookup::Found(v.clone()),
            UpdateKind::Modify(_) => leaf.materialize(slot, idx).map_or(Lookup::Deleted, Lookup::Found),
            UpdateKind::Tombstone => Lookup::Deleted,
            UpdateKind::Reserve => continue,
        };
    }
    match &slot.disk {
        Some(cell) if !cell.tw.has_stop() => Lookup::Found(cell.value.clone()),
        Some(_) => Lookup::Deleted,
        None => Lookup::Absent,
    }
}
