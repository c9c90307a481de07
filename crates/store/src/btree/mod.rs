//! Btrees: one per table file plus the history store.
//!
//! A tree is an ordered index of leaf pages keyed by each page's lowest
//! key. Pages load lazily from their block image, carry per-key update
//! chains while in memory, and split at the median once they grow past
//! `leaf_page_max`.
//!
//! ## Structure
//!
//! - `page.rs`: in-memory leaf pages, slots and page state
//! - `read.rs`: visibility-aware lookups and ordered walks
//! - `write.rs`: conflict checks, updates and transaction resolution
//! - `split.rs`: page splits
//!
//! ## Locking
//!
//! The page index lock is taken before any page lock. A page lock may be
//! held while the history store's index and page locks are taken, never
//! the other way round.

pub(crate) mod page;
mod read;
mod split;
mod write;

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use cellar_types::Format;
pub(crate) use page::{LeafPage, PageState, Slot};
use parking_lot::{Mutex, MutexGuard, RwLock};
pub(crate) use read::KeyRange;
use tracing::debug;
pub(crate) use write::{Expect, Resolution, WriteCtx};

use crate::{
    block::{BlockAddr, BlockStore},
    env::Env,
    error::{Error, Result},
    page::{RootEntry, RootImage, read_leaf, read_root},
    stats::{Stat, Stats},
    txn::VisibleAll,
};

/// Key and value layout of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Row store: arbitrary ordered keys.
    Row,
    /// Variable-length column store keyed by record number.
    ColVar,
    /// Fixed-length column store of 8-bit values keyed by record number.
    ColFix,
}

impl TreeKind {
    /// Derives the tree kind from a table's key and value formats.
    pub fn from_formats(key: &Format, value: &Format) -> Self {
        if !key.is_recno() {
            TreeKind::Row
        } else if value.is_fixed_bits() {
            TreeKind::ColFix
        } else {
            TreeKind::ColVar
        }
    }

    pub fn is_column(self) -> bool {
        !matches!(self, TreeKind::Row)
    }
}

/// Encodes a record number as a tree key.
pub(crate) fn recno_key(recno: u64) -> Vec<u8> {
    recno.to_be_bytes().to_vec()
}

/// Decodes a record-number tree key.
pub(crate) fn key_recno(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Result of resolving one key for a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// A visible value.
    Found(Vec<u8>),
    /// The newest visible version is a delete.
    Deleted,
    /// No version is visible.
    Absent,
}

impl Lookup {
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Found(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

/// One leaf page in the index.
#[derive(Debug)]
pub(crate) struct PageRef {
    pub lower: Vec<u8>,
    pub state: Mutex<PageState>,
}

impl PageRef {
    fn new(lower: Vec<u8>, state: PageState) -> Arc<Self> {
        Arc::new(Self { lower, state: Mutex::new(state) })
    }
}

/// Parameters a tree is opened with.
#[derive(Debug, Clone)]
pub(crate) struct TreeParams {
    pub id: u64,
    pub name: String,
    pub kind: TreeKind,
    pub logged: bool,
    pub readonly: bool,
    pub leaf_page_max: u64,
    pub memory_page_max: u64,
}

/// A btree.
pub(crate) struct Btree {
    pub id: u64,
    pub name: String,
    pub kind: TreeKind,
    logged: AtomicBool,
    readonly: bool,
    store: Arc<dyn BlockStore>,
    pub(crate) env: Arc<Env>,
    pages: RwLock<BTreeMap<Vec<u8>, Arc<PageRef>>>,
    max_recno: AtomicU64,
    leaf_page_max: u64,
    memory_page_max: u64,
    /// Root written by the last checkpoint.
    root: Mutex<Option<BlockAddr>>,
    /// Structure changed (split or page removal) since the last root write.
    root_dirty: AtomicBool,
    pub stats: Stats,
}

impl std::fmt::Debug for Btree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Btree").field("id", &self.id).field("name", &self.name).field("kind", &self.kind).finish()
    }
}

impl Btree {
    /// Creates an empty tree.
    pub fn create(params: TreeParams, store: Arc<dyn BlockStore>, env: Arc<Env>) -> Self {
        let mut pages = BTreeMap::new();
        pages.insert(Vec::new(), PageRef::new(Vec::new(), PageState::default()));
        let tree = Self::with_pages(params, store, env, pages, 0, None);
        tree.root_dirty.store(true, Ordering::Release);
        tree
    }

    /// Opens a tree from its checkpoint root, or empty when there is none.
    pub fn open(
        params: TreeParams,
        store: Arc<dyn BlockStore>,
        env: Arc<Env>,
        root: Option<&BlockAddr>,
    ) -> Result<Self> {
        let Some(root) = root else {
            return Ok(Self::create(params, store, env));
        };
        let image = read_root(store.as_ref(), root)
            .map_err(|e| env.on_corruption(e, &format!("{}: root", params.name), None))?;
        let mut pages = BTreeMap::new();
        for entry in image.entries {
            let state = PageState { addr: entry.addr, page_del: entry.page_del, ..Default::default() };
            pages.insert(entry.lower.clone(), PageRef::new(entry.lower, state));
        }
        if !pages.contains_key(&Vec::new()) {
            pages.insert(Vec::new(), PageRef::new(Vec::new(), PageState::default()));
        }
        debug!(tree = %params.name, pages = pages.len(), "opened tree");
        Ok(Self::with_pages(params, store, env, pages, image.max_recno, Some(*root)))
    }

    fn with_pages(
        params: TreeParams,
        store: Arc<dyn BlockStore>,
        env: Arc<Env>,
        pages: BTreeMap<Vec<u8>, Arc<PageRef>>,
        max_recno: u64,
        root: Option<BlockAddr>,
    ) -> Self {
        Self {
            id: params.id,
            name: params.name,
            kind: params.kind,
            logged: AtomicBool::new(params.logged),
            readonly: params.readonly,
            store,
            env,
            pages: RwLock::new(pages),
            max_recno: AtomicU64::new(max_recno),
            leaf_page_max: params.leaf_page_max.max(512),
            memory_page_max: params.memory_page_max.max(params.leaf_page_max),
            root: Mutex::new(root),
            root_dirty: AtomicBool::new(false),
            stats: Stats::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn is_logged(&self) -> bool {
        self.logged.load(Ordering::Acquire)
    }

    pub fn set_logged(&self, logged: bool) {
        self.logged.store(logged, Ordering::Release);
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn leaf_page_max(&self) -> u64 {
        self.leaf_page_max
    }

    pub fn memory_page_max(&self) -> u64 {
        self.memory_page_max
    }

    /// Largest record number allocated.
    pub fn max_recno(&self) -> u64 {
        self.max_recno.load(Ordering::Acquire)
    }

    /// Raises the largest record number to at least `recno`.
    pub fn extend_recno(&self, recno: u64) {
        self.max_recno.fetch_max(recno, Ordering::AcqRel);
    }

    /// Allocates the next record number for an append.
    pub fn next_recno(&self) -> u64 {
        self.max_recno.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn root(&self) -> Option<BlockAddr> {
        *self.root.lock()
    }

    pub(crate) fn set_root(&self, root: BlockAddr) {
        *self.root.lock() = Some(root);
        self.root_dirty.store(false, Ordering::Release);
    }

    pub(crate) fn mark_root_dirty(&self) {
        self.root_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn root_dirty(&self) -> bool {
        self.root_dirty.load(Ordering::Acquire)
    }

    /// Snapshot of every page in key order.
    pub(crate) fn pages(&self) -> Vec<Arc<PageRef>> {
        self.pages.read().values().cloned().collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// The page whose key range covers `key`.
    pub(crate) fn page_for(&self, key: &[u8]) -> Arc<PageRef> {
        let index = self.pages.read();
        match index.range::<[u8], _>((Bound::Unbounded, Bound::Included(key))).next_back() {
            Some((_, page)) => page.clone(),
            None => first(&index),
        }
    }

    pub(crate) fn first_page(&self) -> Arc<PageRef> {
        first(&self.pages.read())
    }

    pub(crate) fn last_page(&self) -> Arc<PageRef> {
        let index = self.pages.read();
        match index.values().next_back() {
            Some(page) => page.clone(),
            None => first(&index),
        }
    }

    /// Page after the one starting at `lower`.
    pub(crate) fn next_page(&self, lower: &[u8]) -> Option<Arc<PageRef>> {
        self.pages.read().range::<[u8], _>((Bound::Excluded(lower), Bound::Unbounded)).next().map(|(_, p)| p.clone())
    }

    /// Page before the one starting at `lower`.
    pub(crate) fn prev_page(&self, lower: &[u8]) -> Option<Arc<PageRef>> {
        self.pages.read().range::<[u8], _>((Bound::Unbounded, Bound::Excluded(lower))).next_back().map(|(_, p)| p.clone())
    }

    /// Lowest key of the page after `lower`, the exclusive upper bound of that page.
    pub(crate) fn page_upper(&self, lower: &[u8]) -> Option<Vec<u8>> {
        self.next_page(lower).map(|p| p.lower.clone())
    }

    /// Locks a page and loads its leaf. `None` when the page was removed
    /// from the index while the caller waited.
    pub(crate) fn lock_loaded<'p>(&self, page: &'p PageRef) -> Result<Option<MutexGuard<'p, PageState>>> {
        let mut st = page.state.lock();
        if st.stale {
            return Ok(None);
        }
        self.load(&mut st)?;
        st.read_gen = self.env.next_read_gen();
        Ok(Some(st))
    }

    /// Runs `f` on the loaded page covering `key`.
    pub(crate) fn with_page<R>(&self, key: &[u8], mut f: impl FnMut(&mut PageState) -> Result<R>) -> Result<R> {
        loop {
            let page = self.page_for(key);
            let Some(mut st) = self.lock_loaded(&page)? else { continue };
            return f(&mut st);
        }
    }

    /// Reads the page image into memory if it is not already there.
    pub(crate) fn load(&self, st: &mut PageState) -> Result<()> {
        if st.leaf.is_some() {
            return Ok(());
        }
        let leaf = match &st.addr {
            Some(addr) => {
                let image = read_leaf(self.store.as_ref(), addr)
                    .map_err(|e| self.env.on_corruption(e, &format!("{}: leaf at {}", self.name, addr.offset), None))?;
                self.env.stats.incr(Stat::CachePagesRead);
                self.env.stats.incr(Stat::BlockRead);
                self.env.stats.add(Stat::BlockBytesRead, u64::from(addr.size));
                self.stats.incr(Stat::CachePagesRead);
                LeafPage::from_image(image)
            },
            None => LeafPage::default(),
        };
        st.leaf = Some(leaf);
        self.account(st);
        Ok(())
    }

    /// Recomputes the page's cache charge after a change.
    pub(crate) fn account(&self, st: &mut PageState) {
        let (inmem, updates) = match &st.leaf {
            Some(leaf) => (leaf.footprint(), leaf.update_bytes()),
            None => (0, 0),
        };
        let dirty = if st.dirty { inmem } else { 0 };
        let cache = &self.env.cache;
        cache.add_inmem(inmem as i64 - st.charged as i64);
        cache.add_dirty(dirty as i64 - st.charged_dirty as i64);
        cache.add_updates(updates as i64 - st.charged_updates as i64);
        st.charged = inmem;
        st.charged_dirty = dirty;
        st.charged_updates = updates;
    }

    /// Marks a page modified.
    pub(crate) fn mark_dirty(&self, st: &mut PageState) {
        st.dirty = true;
        self.account(st);
    }

    /// Drops a page's in-memory contents.
    pub(crate) fn release(&self, st: &mut PageState) {
        st.leaf = None;
        self.account(st);
    }

    /// Removes a page from the index, merging its key range into the
    /// previous page. The first page is never removed.
    pub(crate) fn remove_page(&self, page: &Arc<PageRef>) -> bool {
        if page.lower.is_empty() {
            return false;
        }
        let mut index = self.pages.write();
        let mut st = page.state.lock();
        if st.stale {
            return false;
        }
        st.stale = true;
        st.leaf = None;
        self.account(&mut st);
        index.remove(&page.lower);
        self.mark_root_dirty();
        true
    }

    /// Root image describing every page, from each page's current image.
    pub(crate) fn root_image(&self) -> RootImage {
        let entries = self
            .pages()
            .iter()
            .map(|page| {
                let st = page.state.lock();
                RootEntry { lower: page.lower.clone(), addr: st.addr, page_del: st.page_del }
            })
            .collect();
        RootImage { entries, max_recno: self.max_recno() }
    }

    /// Every block the in-memory tree references.
    pub(crate) fn live_blocks(&self) -> Vec<BlockAddr> {
        let mut blocks: Vec<BlockAddr> = self.pages().iter().flat_map(|p| p.state.lock().blocks()).collect();
        blocks.extend(self.root());
        blocks
    }

    /// True when any page holds changes not yet written.
    pub(crate) fn is_dirty(&self) -> bool {
        self.root_dirty() || self.pages().iter().any(|p| p.state.lock().dirty)
    }

    /// Drops history no reader can need from every loaded page.
    pub(crate) fn discard_obsolete(&self, horizon: &VisibleAll) -> usize {
        let mut released = 0;
        for page in self.pages() {
            let mut st = page.state.lock();
            if let Some(leaf) = st.leaf.as_mut() {
                released += leaf.discard_obsolete(horizon);
                leaf.compact_arena();
            }
            self.account(&mut st);
        }
        released
    }

    /// Bytes this tree holds in the cache.
    pub fn footprint(&self) -> u64 {
        self.pages().iter().map(|p| p.state.lock().charged).sum()
    }

    /// Releases every page, returning its charge to the cache.
    pub(crate) fn close(&self) {
        for page in self.pages() {
            let mut st = page.state.lock();
            st.leaf = None;
            self.account(&mut st);
        }
    }

    /// Largest key in the tree regardless of visibility.
    pub(crate) fn largest_key(&self) -> Result<Option<Vec<u8>>> {
        let mut page = self.last_page();
        loop {
            let loaded = self
                .lock_loaded(&page)?
                .map(|st| st.leaf.as_ref().and_then(|leaf| leaf.slots.keys().next_back().cloned()));
            let Some(found) = loaded else {
                page = self.last_page();
                continue;
            };
            if found.is_some() {
                return Ok(found);
            }
            match self.prev_page(&page.lower) {
                Some(prev) => page = prev,
                None => return Ok(None),
            }
        }
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.env.check_panic()
    }
}

fn first(index: &BTreeMap<Vec<u8>, Arc<PageRef>>) -> Arc<PageRef> {
    match index.values().next() {
        Some(page) => page.clone(),
        None => PageRef::new(Vec::new(), PageState::default()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
pub(crate) mod tests {
    use cellar_types::config::ConnectionConfig;

    use super::*;
    use crate::block::MemBlockStore;

    pub(crate) fn test_env() -> Arc<Env> {
        Env::new(ConnectionConfig::default(), 1)
    }

    pub(crate) fn test_tree(kind: TreeKind) -> Btree {
        tree_in(7, kind, test_env())
    }

    /// A tree with a chosen id sharing `env` with other trees.
    pub(crate) fn tree_in(id: u64, kind: TreeKind, env: Arc<Env>) -> Btree {
        let params = TreeParams {
            id,
            name: format!("file:test{id}.cdb"),
            kind,
            logged: false,
            readonly: false,
            leaf_page_max: 4096,
            memory_page_max: 1 << 20,
        };
        Btree::create(params, Arc::new(MemBlockStore::new()), env)
    }

    #[test]
    fn test_recno_keys_sort_numerically() {
        assert!(recno_key(2) < recno_key(10));
        assert_eq!(key_recno(&recno_key(77)), Some(77));
        assert_eq!(key_recno(b"short"), None);
    }

    #[test]
    fn test_new_tree_has_one_empty_page() {
        let tree = test_tree(TreeKind::Row);
        assert_eq!(tree.page_count(), 1);
        assert!(tree.root_dirty());
        assert_eq!(tree.page_for(b"anything").lower, Vec::<u8>::new());
        assert!(tree.largest_key().unwrap().is_none());
    }

    #[test]
    fn test_append_allocates_sequential_recnos() {
        let tree = test_tree(TreeKind::ColVar);
        assert_eq!(tree.next_recno(), 1);
        assert_eq!(tree.next_recno(), 2);
        tree.extend_recno(10);
        assert_eq!(tree.next_recno(), 11);
    }
}
