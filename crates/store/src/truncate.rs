//! Range truncation.
//!
//! A truncate first marks whole pages deleted where it can: a page fully
//! inside the range, with no in-memory updates and every stored key
//! visible to the truncating transaction, gets a single page-deleted
//! marker instead of a tombstone per key. Every other key in the range is
//! removed one by one. Both kinds of change resolve together at commit.
//!
//! Fixed-length column stores never take the page path; their records are
//! zeroed and the record-number space keeps its length.

use crate::{
    btree::{Btree, Expect, KeyRange, PageState, TreeKind, WriteCtx},
    error::Result,
    hs::HistoryStore,
    page::PageDel,
    txn::{CellVisible, Reader},
    update::UpdateKind,
};

/// What a truncate did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncateOutcome {
    /// Pages marked deleted as a whole.
    pub fast_pages: u64,
    /// Keys removed individually.
    pub keys: u64,
}

/// True when every key on the page can go with one marker.
fn fast_eligible(st: &PageState, reader: &Reader) -> bool {
    if st.page_del.is_some() || st.has_updates() {
        return false;
    }
    let Some(leaf) = st.leaf.as_ref() else { return false };
    !leaf.slots.is_empty()
        && leaf.slots.values().all(|slot| {
            slot.disk
                .as_ref()
                .is_some_and(|cell| matches!(reader.cell(&cell.tw), CellVisible::Value | CellVisible::Deleted))
        })
}

/// Removes every key in `[lower, upper]` on behalf of the writer in `ctx`.
pub(crate) fn truncate(
    tree: &Btree,
    lower: &[u8],
    upper: Option<&[u8]>,
    ctx: &WriteCtx<'_>,
    reader: &Reader,
    hs: Option<&HistoryStore>,
) -> Result<TruncateOutcome> {
    tree.check_writable()?;
    let mut out = TruncateOutcome::default();
    let in_range = |key: &[u8]| upper.is_none_or(|u| key <= u);

    // Keys on pages that did not take a marker, gathered page by page.
    let mut keys = Vec::new();
    let mut page = tree.page_for(lower);
    loop {
        let next = tree.next_page(&page.lower);
        let covered = tree.kind != TreeKind::ColFix
            && page.lower.as_slice() >= lower
            && upper.is_none_or(|u| next.as_ref().is_some_and(|n| n.lower.as_slice() <= u));
        let mut marked = false;
        if covered {
            if let Some(mut st) = tree.lock_loaded(&page)? {
                if fast_eligible(&st, reader) {
                    let mut del = PageDel::new(ctx.txn_id);
                    del.ts = ctx.commit_ts;
                    del.durable_ts = ctx.durable_ts;
                    st.page_del = Some(del);
                    tree.mark_dirty(&mut st);
                    out.fast_pages += 1;
                    marked = true;
                }
            }
        }
        if !marked {
            let from = page.lower.as_slice().max(lower);
            let range = KeyRange {
                lower: (!from.is_empty()).then(|| from.to_vec()),
                upper: upper.map(<[u8]>::to_vec),
            };
            match tree.page_keys(&page, &range, reader, hs)? {
                Some(found) => keys.extend(found),
                None => {
                    // Reshaped underneath: walk to the old page's end instead.
                    let mut pos: Option<Vec<u8>> = None;
                    while let Some((key, _)) = tree.walk(pos.as_deref(), true, &range, reader, hs)? {
                        if next.as_ref().is_some_and(|n| key.as_slice() >= n.lower.as_slice()) {
                            break;
                        }
                        keys.push(key.clone());
                        pos = Some(key);
                    }
                },
            }
        }
        match next {
            Some(next) if in_range(&next.lower) => page = next,
            _ => break,
        }
    }

    let removal = if tree.kind == TreeKind::ColFix { UpdateKind::Standard(vec![0]) } else { UpdateKind::Tombstone };
    for key in &keys {
        tree.write(key, removal.clone(), ctx, Expect::Any)?;
    }
    out.keys = keys.len() as u64;
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{
        btree::{Lookup, Resolution, tests::test_tree},
        txn::Snapshot,
    };

    fn put(tree: &Btree, key: &str) {
        tree.write(key.as_bytes(), UpdateKind::Standard(b"v".to_vec()), &WriteCtx::global(), Expect::Any).unwrap();
    }

    #[test]
    fn test_keys_in_range_removed_at_commit() {
        let tree = test_tree(TreeKind::Row);
        for key in ["a", "b", "c", "d"] {
            put(&tree, key);
        }
        let reader = Reader { txn_id: 7, ..Reader::at(Snapshot::everything(), None) };
        let ctx = WriteCtx { reader: Some(&reader), txn_id: 7, commit_ts: 0, durable_ts: 0 };
        let out = truncate(&tree, b"b", Some(b"c"), &ctx, &reader, None).unwrap();
        assert_eq!(out, TruncateOutcome { fast_pages: 0, keys: 2 });

        // Uncommitted: other readers still see the keys.
        let other = Reader::at(Snapshot { snap_min: 7, snap_max: 8, concurrent: vec![7] }, None);
        assert!(tree.search(b"b", &other, None).unwrap().is_found());
        assert!(!tree.search(b"b", &reader, None).unwrap().is_found());

        tree.resolve_range(b"b", Some(b"c"), 7, Resolution::Commit { commit_ts: 0, durable_ts: 0 }).unwrap();
        let global = Reader::global();
        assert!(tree.search(b"a", &global, None).unwrap().is_found());
        assert!(!tree.search(b"b", &global, None).unwrap().is_found());
        assert!(!tree.search(b"c", &global, None).unwrap().is_found());
        assert!(tree.search(b"d", &global, None).unwrap().is_found());
    }

    #[test]
    fn test_fixed_column_zeroes_records() {
        let tree = test_tree(TreeKind::ColFix);
        for recno in 1..=4u64 {
            let key = crate::btree::recno_key(recno);
            tree.write(&key, UpdateKind::Standard(vec![9]), &WriteCtx::global(), Expect::Any).unwrap();
        }
        let reader = Reader::global();
        let out = truncate(&tree, &crate::btree::recno_key(2), None, &WriteCtx::global(), &reader, None).unwrap();
        assert_eq!(out.fast_pages, 0);
        assert_eq!(out.keys, 3);
        assert_eq!(tree.max_recno(), 4);
        let found = tree.search(&crate::btree::recno_key(3), &reader, None).unwrap();
        assert_eq!(found, Lookup::Found(vec![0]));
    }
}
