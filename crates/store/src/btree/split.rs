//! Page splits.
//!
//! A leaf that grows past `leaf_page_max` splits at its median key. The
//! lower half stays in the existing page; the upper half becomes a new
//! page. Both halves are dirty and are written in full at the next
//! reconciliation.

use super::{Btree, PageRef, PageState};
use crate::error::Result;

impl Btree {
    fn needs_split(&self, st: &PageState) -> bool {
        st.page_del.is_none()
            && st.leaf.as_ref().is_some_and(|leaf| leaf.slots.len() >= 2 && leaf.footprint() > self.leaf_page_max())
    }

    /// Splits the page covering `key` if it has outgrown its size limit.
    pub(crate) fn maybe_split(&self, key: &[u8]) -> Result<()> {
        let page = self.page_for(key);
        if !self.needs_split(&page.state.lock()) {
            return Ok(());
        }
        let mut index = self.pages.write();
        let mut st = page.state.lock();
        if st.stale || !self.needs_split(&st) {
            return Ok(());
        }
        let Some((mid, right)) = st.leaf.as_mut().and_then(|leaf| leaf.split_off_half()) else {
            return Ok(());
        };
        st.dirty = true;
        st.last_image = None;
        st.delta_depth = 0;
        let read_gen = st.read_gen;
        self.account(&mut st);

        let mut upper = PageState { leaf: Some(right), dirty: true, read_gen, ..Default::default() };
        self.account(&mut upper);
        index.insert(mid.clone(), PageRef::new(mid, upper));
        self.mark_root_dirty();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use crate::{
        btree::{Expect, Lookup, TreeKind, WriteCtx, tests::test_tree},
        txn::Reader,
        update::UpdateKind,
    };

    #[test]
    fn test_growth_splits_pages_and_keeps_keys() {
        let tree = test_tree(TreeKind::Row);
        for i in 0..500u32 {
            let key = format!("key{i:05}");
            tree.write(key.as_bytes(), UpdateKind::Standard(vec![b'x'; 100]), &WriteCtx::global(), Expect::Any)
                .unwrap();
        }
        assert!(tree.page_count() > 4);
        let reader = Reader::global();
        for i in 0..500u32 {
            let key = format!("key{i:05}");
            assert!(matches!(tree.search(key.as_bytes(), &reader, None).unwrap(), Lookup::Found(_)));
        }
        let pages = tree.pages();
        for pair in pages.windows(2) {
            assert!(pair[0].lower < pair[1].lower);
        }
    }
}
