//! Reads: resolving a key for a reader and walking keys in order.

use std::ops::Bound;

use super::{Btree, LeafPage, Lookup, PageRef, PageState, Slot, TreeKind, key_recno, recno_key};
use crate::{
    error::{Error, Result},
    hs::HistoryStore,
    page::PageDel,
    stats::Stat,
    txn::{CellVisible, Reader, Visible},
    update::UpdateKind,
};

/// Inclusive key bounds for walks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct KeyRange {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn contains(&self, key: &[u8]) -> bool {
        self.lower.as_deref().is_none_or(|l| key >= l) && self.upper.as_deref().is_none_or(|u| key <= u)
    }

    fn past_end(&self, key: &[u8], forward: bool) -> bool {
        if forward {
            self.upper.as_deref().is_some_and(|u| key > u)
        } else {
            self.lower.as_deref().is_some_and(|l| key < l)
        }
    }
}

impl Btree {
    /// Resolves `key` for `reader`.
    pub(crate) fn search(&self, key: &[u8], reader: &Reader, hs: Option<&HistoryStore>) -> Result<Lookup> {
        let found = self.with_page(key, |st| self.read_in_page(st, key, reader, hs))?;
        Ok(self.fill_fixed(key, found))
    }

    /// Resolves `key` on an already locked page.
    pub(crate) fn read_in_page(
        &self,
        st: &PageState,
        key: &[u8],
        reader: &Reader,
        hs: Option<&HistoryStore>,
    ) -> Result<Lookup> {
        let Some(leaf) = st.leaf.as_ref() else {
            return Err(Error::corrupt(format!("{}: page not loaded", self.name)));
        };
        match leaf.slots.get(key) {
            Some(slot) => self.read_slot(leaf, slot, st.page_del.as_ref(), key, reader, hs),
            None => Ok(Lookup::Absent),
        }
    }

    /// Resolves one slot: update chain, then the page's truncate marker,
    /// then the disk cell and finally the history store.
    pub(crate) fn read_slot(
        &self,
        leaf: &LeafPage,
        slot: &Slot,
        page_del: Option<&PageDel>,
        key: &[u8],
        reader: &Reader,
        hs: Option<&HistoryStore>,
    ) -> Result<Lookup> {
        for (idx, upd) in leaf.arena.chain(slot.head) {
            if upd.is_aborted() || upd.is_reserve() {
                continue;
            }
            match reader.update(upd) {
                Visible::Prepared => return Err(Error::PrepareConflict),
                Visible::No => continue,
                Visible::Yes => {},
            }
            return Ok(match &upd.kind {
                UpdateKind::Standard(value) => Lookup::Found(value.clone()),
                UpdateKind::Modify(_) => leaf.materialize(slot, idx).map_or(Lookup::Deleted, Lookup::Found),
                UpdateKind::Tombstone | UpdateKind::Reserve => Lookup::Deleted,
            });
        }
        if let Some(del) = page_del {
            match reader.page_del(del) {
                Visible::Yes => return Ok(Lookup::Deleted),
                Visible::Prepared => return Err(Error::PrepareConflict),
                Visible::No => {},
            }
        }
        let Some(cell) = &slot.disk else {
            return Ok(Lookup::Absent);
        };
        match reader.cell(&cell.tw) {
            CellVisible::Value => Ok(Lookup::Found(cell.value.clone())),
            CellVisible::Deleted => Ok(Lookup::Deleted),
            CellVisible::Prepared => Err(Error::PrepareConflict),
            CellVisible::TooNew => match hs {
                Some(hs) => {
                    self.stats.incr(Stat::HsRead);
                    hs.lookup(self.id, key, reader)
                },
                None => Ok(Lookup::Absent),
            },
        }
    }

    /// Fixed-length column stores read missing or deleted records inside
    /// the table as zero.
    pub(crate) fn fill_fixed(&self, key: &[u8], found: Lookup) -> Lookup {
        if self.kind != TreeKind::ColFix || found.is_found() {
            return found;
        }
        match key_recno(key) {
            Some(recno) if recno >= 1 && recno <= self.max_recno() => Lookup::Found(vec![0]),
            _ => found,
        }
    }

    /// Next (or previous) visible key strictly after (before) `from`,
    /// within `range`. `from == None` starts at the first (last) key.
    pub(crate) fn walk(
        &self,
        from: Option<&[u8]>,
        forward: bool,
        range: &KeyRange,
        reader: &Reader,
        hs: Option<&HistoryStore>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.kind == TreeKind::ColFix {
            return self.walk_fixed(from, forward, range, reader, hs);
        }
        let start: Option<Vec<u8>> = match from {
            Some(key) => Some(key.to_vec()),
            None if forward => range.lower.clone(),
            None => range.upper.clone(),
        };
        // A bound is itself eligible; a cursor position is not.
        let inclusive = from.is_none();
        let mut page = match &start {
            Some(key) => self.page_for(key),
            None if forward => self.first_page(),
            None => self.last_page(),
        };
        loop {
            let found = {
                let Some(st) = self.lock_loaded(&page)? else {
                    page = match &start {
                        Some(key) => self.page_for(key),
                        None if forward => self.first_page(),
                        None => self.last_page(),
                    };
                    continue;
                };
                self.scan_page(&st, start.as_deref(), inclusive, forward, range, reader, hs)?
            };
            match found {
                Scan::Found(key, value) => return Ok(Some((key, value))),
                Scan::End => return Ok(None),
                Scan::Continue => {},
            }
            let next = if forward { self.next_page(&page.lower) } else { self.prev_page(&page.lower) };
            match next {
                Some(next) => page = next,
                None => return Ok(None),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    /// Every record number from 1 to the table's end exists in a
    /// fixed-length column store, so stepping is arithmetic.
    fn walk_fixed(
        &self,
        from: Option<&[u8]>,
        forward: bool,
        range: &KeyRange,
        reader: &Reader,
        hs: Option<&HistoryStore>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let max = self.max_recno();
        let lower = range.lower.as_deref().and_then(key_recno).unwrap_or(1).max(1);
        let upper = range.upper.as_deref().and_then(key_recno).map_or(max, |u| u.min(max));
        let recno = match (from.and_then(key_recno), forward) {
            (Some(at), true) => at.saturating_add(1).max(lower),
            (Some(at), false) => at.saturating_sub(1).min(upper),
            (None, true) => lower,
            (None, false) => upper,
        };
        if recno < lower || recno > upper {
            return Ok(None);
        }
        let key = recno_key(recno);
        match self.search(&key, reader, hs)? {
            Lookup::Found(value) => Ok(Some((key, value))),
            _ => Ok(None),
        }
    }

    /// Keys on one page visible to `reader` inside `range`. `None` when the
    /// page went stale under a split or eviction.
    pub(crate) fn page_keys(
        &self,
        page: &PageRef,
        range: &KeyRange,
        reader: &Reader,
        hs: Option<&HistoryStore>,
    ) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(st) = self.lock_loaded(page)? else { return Ok(None) };
        let Some(leaf) = st.leaf.as_ref() else { return Ok(Some(Vec::new())) };
        let mut keys = Vec::new();
        for (key, slot) in &leaf.slots {
            if range.past_end(key, true) {
                break;
            }
            if range.contains(key) && self.read_slot(leaf, slot, st.page_del.as_ref(), key, reader, hs)?.is_found() {
                keys.push(key.clone());
            }
        }
        Ok(Some(keys))
    }

    fn scan_page(
        &self,
        st: &PageState,
        start: Option<&[u8]>,
        inclusive: bool,
        forward: bool,
        range: &KeyRange,
        reader: &Reader,
        hs: Option<&HistoryStore>,
    ) -> Result<Scan> {
        let Some(leaf) = st.leaf.as_ref() else { return Ok(Scan::Continue) };
        let bound = match start {
            Some(key) if inclusive => Bound::Included(key),
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let slots: Box<dyn Iterator<Item = (&Vec<u8>, &Slot)>> = if forward {
            Box::new(leaf.slots.range::<[u8], _>((bound, Bound::Unbounded)))
        } else {
            Box::new(leaf.slots.range::<[u8], _>((Bound::Unbounded, bound)).rev())
        };
        for (key, slot) in slots {
            if range.past_end(key, forward) {
                return Ok(Scan::End);
            }
            if !range.contains(key) {
                continue;
            }
            let found = self.read_slot(leaf, slot, st.page_del.as_ref(), key, reader, hs)?;
            if let Lookup::Found(value) = self.fill_fixed(key, found) {
                return Ok(Scan::Found(key.clone(), value));
            }
        }
        Ok(Scan::Continue)
    }

    /// Smallest visible key at or after `key` and largest at or before it,
    /// for `search_near`. Returns the exact match when there is one.
    pub(crate) fn search_near(
        &self,
        key: &[u8],
        range: &KeyRange,
        reader: &Reader,
        hs: Option<&HistoryStore>,
    ) -> Result<Option<(Vec<u8>, Vec<u8>, i32)>> {
        if range.contains(key) {
            if let Lookup::Found(value) = self.search(key, reader, hs)? {
                return Ok(Some((key.to_vec(), value, 0)));
            }
        }
        let clamp_fwd = match &range.lower {
            Some(lower) if key < lower.as_slice() => None,
            _ => Some(key),
        };
        if let Some((k, v)) = self.walk(clamp_fwd, true, range, reader, hs)? {
            return Ok(Some((k, v, 1)));
        }
        let clamp_back = match &range.upper {
            Some(upper) if key > upper.as_slice() => None,
            _ => Some(key),
        };
        Ok(self.walk(clamp_back, false, range, reader, hs)?.map(|(k, v)| (k, v, -1)))
    }
}

enum Scan {
    Found(Vec<u8>, Vec<u8>),
    Continue,
    End,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{
        btree::{
            Expect, WriteCtx,
            tests::test_tree,
        },
        txn::Snapshot,
    };

    fn put(tree: &Btree, key: &str, value: &str, ts: u64) {
        let ctx = WriteCtx::global_at(ts);
        tree.write(key.as_bytes(), UpdateKind::Standard(value.as_bytes().to_vec()), &ctx, Expect::Any).unwrap();
    }

    fn reader(ts: u64) -> Reader {
        Reader::at(Snapshot::everything(), Some(ts))
    }

    #[test]
    fn test_search_respects_read_timestamp() {
        let tree = test_tree(TreeKind::Row);
        put(&tree, "k", "old", 10);
        put(&tree, "k", "new", 20);
        assert_eq!(tree.search(b"k", &reader(15), None).unwrap(), Lookup::Found(b"old".to_vec()));
        assert_eq!(tree.search(b"k", &reader(25), None).unwrap(), Lookup::Found(b"new".to_vec()));
        assert_eq!(tree.search(b"k", &reader(5), None).unwrap(), Lookup::Absent);
    }

    #[test]
    fn test_walk_in_both_directions_with_bounds() {
        let tree = test_tree(TreeKind::Row);
        for k in ["a", "b", "c", "d", "e"] {
            put(&tree, k, k, 1);
        }
        let r = reader(1);
        let all = KeyRange::default();
        let (k, _) = tree.walk(None, true, &all, &r, None).unwrap().unwrap();
        assert_eq!(k, b"a");
        let (k, _) = tree.walk(Some(b"c"), true, &all, &r, None).unwrap().unwrap();
        assert_eq!(k, b"d");
        let (k, _) = tree.walk(None, false, &all, &r, None).unwrap().unwrap();
        assert_eq!(k, b"e");

        let bounded = KeyRange { lower: Some(b"b".to_vec()), upper: Some(b"c".to_vec()) };
        let (k, _) = tree.walk(None, true, &bounded, &r, None).unwrap().unwrap();
        assert_eq!(k, b"b");
        assert!(tree.walk(Some(b"c"), true, &bounded, &r, None).unwrap().is_none());
        let (k, _) = tree.walk(None, false, &bounded, &r, None).unwrap().unwrap();
        assert_eq!(k, b"c");
    }

    #[test]
    fn test_search_near_reports_direction() {
        let tree = test_tree(TreeKind::Row);
        put(&tree, "b", "1", 1);
        put(&tree, "d", "2", 1);
        let r = reader(1);
        let all = KeyRange::default();
        assert_eq!(tree.search_near(b"b", &all, &r, None).unwrap().unwrap().2, 0);
        let (k, _, cmp) = tree.search_near(b"c", &all, &r, None).unwrap().unwrap();
        assert_eq!((k.as_slice(), cmp), (b"d".as_slice(), 1));
        let (k, _, cmp) = tree.search_near(b"z", &all, &r, None).unwrap().unwrap();
        assert_eq!((k.as_slice(), cmp), (b"d".as_slice(), -1));
    }

    #[test]
    fn test_fixed_column_reads_zero_inside_table() {
        let tree = test_tree(TreeKind::ColFix);
        tree.extend_recno(5);
        let key = crate::btree::recno_key(3);
        assert_eq!(tree.search(&key, &reader(1), None).unwrap(), Lookup::Found(vec![0]));
        let beyond = crate::btree::recno_key(6);
        assert_eq!(tree.search(&beyond, &reader(1), None).unwrap(), Lookup::Absent);
    }
}
