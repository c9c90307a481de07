//! Verify and salvage.
//!
//! Verification reads an object's newest checkpoint straight from its
//! file: the root must list strictly ascending page bounds starting at the
//! empty key, every leaf must decode, and every cell must sort inside its
//! page's bounds with a well-formed time window.
//!
//! Salvage rebuilds a tree around the pages that can no longer be read.
//! Readable pages are kept as they are; the keys of an unreadable page are
//! recovered from older copies of it still present in the file, the newest
//! write generation winning. The rebuilt tree becomes the object's only
//! checkpoint.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use cellar_types::{
    TS_NONE,
    config::{CheckpointConfig, SalvageConfig, VerifyConfig},
};
use tracing::{info, warn};

use crate::{
    block::BlockAddr,
    btree::Btree,
    checkpoint::{checkpoint_locked, referenced_blocks},
    conn::ConnInner,
    error::{Error, Result},
    meta::{CheckpointRef, DEFAULT_CHECKPOINT},
    page::{Cell, LeafImage, PageImage, RootEntry, RootImage, read_leaf, read_root},
};

/// What a verification found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Leaf pages checked.
    pub pages: u64,
    /// Cells checked.
    pub cells: u64,
    /// Errors collected with `read_corrupt`.
    pub errors: Vec<String>,
    /// Output requested with the `dump_*` options.
    pub lines: Vec<String>,
}

/// What a salvage did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SalvageOutcome {
    /// Pages that read back cleanly.
    pub pages_kept: u64,
    /// Pages rebuilt from older copies.
    pub pages_recovered: u64,
    /// Cells in the rebuilt tree.
    pub cells: u64,
}

/// Trees behind `uri`, refusing while cursors are open on any of them.
fn exclusive_trees(conn: &ConnInner, uri: &str, op: &str) -> Result<Vec<Arc<Btree>>> {
    let target = conn.data_target(uri)?;
    let ids = target.tree_ids();
    if ids.iter().any(|id| conn.handle_open(*id)) {
        return Err(Error::busy(format!("{op}: {uri} has open cursors")));
    }
    ids.into_iter().map(|id| conn.tree(id)).collect()
}

/// Per-tree verification state.
struct Checker<'a> {
    tree: &'a Btree,
    cfg: &'a VerifyConfig,
    stable: u64,
    report: &'a mut VerifyReport,
}

impl Checker<'_> {
    /// Records a failure; returns it unless `read_corrupt` asks to go on.
    fn fail(&mut self, message: String) -> Result<()> {
        let message = format!("{}: {message}", self.tree.name);
        if self.cfg.read_corrupt {
            warn!(error = %message, "verify");
            self.report.errors.push(message);
            Ok(())
        } else {
            Err(Error::corrupt(message))
        }
    }

    fn check_cell(&mut self, key: &[u8], cell: &Cell) -> Result<()> {
        let tw = &cell.tw;
        if tw.durable_start_ts != TS_NONE && tw.durable_start_ts < tw.start_ts {
            self.fail(format!("key {}: durable start before start", crate::log::hex(key)))?;
        }
        if tw.has_stop() {
            if tw.stop_ts < tw.start_ts {
                self.fail(format!("key {}: stop timestamp before start", crate::log::hex(key)))?;
            }
            if tw.stop_txn < tw.start_txn {
                self.fail(format!("key {}: stop transaction before start", crate::log::hex(key)))?;
            }
            if tw.durable_stop_ts != TS_NONE && tw.durable_stop_ts < tw.stop_ts {
                self.fail(format!("key {}: durable stop before stop", crate::log::hex(key)))?;
            }
        }
        if self.cfg.stable_timestamp && self.stable != TS_NONE && !tw.prepared && tw.max_durable() > self.stable {
            self.fail(format!(
                "key {}: durable timestamp {} is newer than stable {}",
                crate::log::hex(key),
                tw.max_durable(),
                self.stable
            ))?;
        }
        if self.cfg.dump_cells {
            self.report.lines.push(format!(
                "{} key={} value={} start=({},{}) stop=({},{})",
                self.tree.name,
                crate::log::hex(key),
                crate::log::hex(&cell.value),
                tw.start_ts,
                tw.start_txn,
                tw.stop_ts,
                tw.stop_txn,
            ));
        }
        Ok(())
    }

    fn check_leaf(&mut self, entry: &RootEntry, upper: Option<&[u8]>, addr: &BlockAddr) -> Result<()> {
        let leaf = match read_leaf(self.tree.store().as_ref(), addr) {
            Ok(leaf) => leaf,
            Err(Error::Corruption { reason }) => {
                return self.fail(format!("page at offset {}: {reason}", addr.offset));
            },
            Err(e) => return Err(e),
        };
        self.report.pages += 1;
        if self.cfg.dump_address {
            self.report.lines.push(format!(
                "{} page lower={} offset={} size={}",
                self.tree.name,
                crate::log::hex(&entry.lower),
                addr.offset,
                addr.size
            ));
        }
        if self.cfg.dump_pages {
            self.report.lines.push(format!("{} page offset={} cells={}", self.tree.name, addr.offset, leaf.cells.len()));
        }
        let mut prev: Option<&[u8]> = None;
        for (key, cell) in &leaf.cells {
            self.report.cells += 1;
            if prev.is_some_and(|p| p >= key.as_slice()) {
                self.fail(format!("page at offset {}: keys out of order", addr.offset))?;
            }
            if key.as_slice() < entry.lower.as_slice() || upper.is_some_and(|u| key.as_slice() >= u) {
                self.fail(format!("page at offset {}: key {} outside the page", addr.offset, crate::log::hex(key)))?;
            }
            self.check_cell(key, cell)?;
            prev = Some(key);
        }
        Ok(())
    }

    fn check_tree(&mut self, root: &BlockAddr) -> Result<()> {
        let image = match read_root(self.tree.store().as_ref(), root) {
            Ok(image) => image,
            Err(Error::Corruption { reason }) => return self.fail(format!("root: {reason}")),
            Err(e) => return Err(e),
        };
        if image.entries.first().is_some_and(|e| !e.lower.is_empty()) {
            self.fail("root: first page does not start at the smallest key".to_string())?;
        }
        for (i, entry) in image.entries.iter().enumerate() {
            let upper = image.entries.get(i + 1).map(|e| e.lower.as_slice());
            if upper.is_some_and(|u| u <= entry.lower.as_slice()) {
                self.fail(format!("root: page bounds out of order at entry {i}"))?;
            }
            if let Some(addr) = &entry.addr {
                self.check_leaf(entry, upper, addr)?;
            }
        }
        Ok(())
    }
}

/// Verifies the newest checkpoint of `uri`.
///
/// # Errors
///
/// - [`Error::Busy`] while cursors are open on the object
/// - [`Error::Corruption`] for the first problem found, unless `read_corrupt`
pub(crate) fn verify(conn: &ConnInner, uri: &str, cfg: &VerifyConfig) -> Result<VerifyReport> {
    conn.check_open()?;
    let trees = exclusive_trees(conn, uri, "verify")?;
    let roots: Vec<Option<BlockAddr>> = {
        let meta = conn.meta.lock();
        trees.iter().map(|t| meta.image.latest(t.id).and_then(|c| c.root)).collect()
    };
    let stable = conn.txn.ts.load().stable;
    let mut report = VerifyReport::default();
    for (tree, root) in trees.iter().zip(roots) {
        let Some(root) = root else { continue };
        Checker { tree, cfg, stable, report: &mut report }.check_tree(&root)?;
    }

    if cfg.dump_history {
        let ids: HashSet<u64> = trees.iter().map(|t| t.id).collect();
        for entry in conn.hs.all_entries()?.into_iter().filter(|e| ids.contains(&e.btree_id)) {
            if entry.cell.tw.has_stop() && entry.cell.tw.stop_ts < entry.cell.tw.start_ts {
                let message = format!("history for key {}: stop before start", crate::log::hex(&entry.key));
                if !cfg.read_corrupt {
                    return Err(Error::corrupt(message));
                }
                report.errors.push(message);
            }
            report.lines.push(format!(
                "history btree={} key={} value={} start={} stop={}",
                entry.btree_id,
                crate::log::hex(&entry.key),
                crate::log::hex(&entry.cell.value),
                entry.cell.tw.start_ts,
                entry.cell.tw.stop_ts
            ));
        }
    }
    info!(uri, pages = report.pages, cells = report.cells, errors = report.errors.len(), "verified");
    Ok(report)
}

/// Keys recovered for one unreadable page: the newest copy of each key
/// among every leaf block in the file that falls inside the page.
fn recover_range(
    scanned: &[(u64, LeafImage)],
    lower: &[u8],
    upper: Option<&[u8]>,
) -> BTreeMap<Vec<u8>, Cell> {
    let mut best: BTreeMap<Vec<u8>, (u64, Cell)> = BTreeMap::new();
    for (write_gen, leaf) in scanned {
        for (key, cell) in &leaf.cells {
            if key.as_slice() < lower || upper.is_some_and(|u| key.as_slice() >= u) {
                continue;
            }
            if best.get(key).is_none_or(|(g, _)| g < write_gen) {
                best.insert(key.clone(), (*write_gen, cell.clone()));
            }
        }
    }
    best.into_iter().map(|(k, (_, cell))| (k, cell)).collect()
}

/// Every leaf block the store can still decode, with its write generation.
fn scan_leaves(tree: &Btree) -> Result<Vec<(u64, LeafImage)>> {
    let store = tree.store();
    let mut out = Vec::new();
    for addr in store.scan()? {
        let Ok(block) = store.read(&addr) else { continue };
        if let Ok((PageImage::Leaf(leaf), write_gen)) = PageImage::decode(&block) {
            out.push((write_gen, leaf));
        }
    }
    Ok(out)
}

fn salvage_tree(conn: &ConnInner, tree: &Arc<Btree>, cfg: &SalvageConfig) -> Result<SalvageOutcome> {
    let mut outcome = SalvageOutcome::default();
    let store = tree.store().clone();
    let root = conn.meta.lock().image.latest(tree.id).and_then(|c| c.root);
    let Some(root) = root else { return Ok(outcome) };

    // Page bounds and, for readable pages, their contents.
    let mut pages: Vec<(Vec<u8>, Option<LeafImage>)> = Vec::new();
    let mut max_recno = 0;
    match read_root(store.as_ref(), &root) {
        Ok(image) => {
            max_recno = image.max_recno;
            for entry in image.entries {
                let leaf = match &entry.addr {
                    Some(addr) => read_leaf(store.as_ref(), addr).ok(),
                    None => Some(LeafImage::default()),
                };
                pages.push((entry.lower, leaf));
            }
        },
        Err(Error::Corruption { reason }) if cfg.force => {
            warn!(tree = %tree.name, reason = %reason, "root unreadable, rebuilding from every page");
            pages.push((Vec::new(), None));
        },
        Err(e) => return Err(e),
    }

    let scanned = if pages.iter().any(|(_, leaf)| leaf.is_none()) { scan_leaves(tree)? } else { Vec::new() };
    let mut entries = Vec::with_capacity(pages.len());
    for i in 0..pages.len() {
        let upper = pages.get(i + 1).map(|(lower, _)| lower.clone());
        let (lower, leaf) = &pages[i];
        let cells: Vec<(Vec<u8>, Cell)> = match leaf {
            Some(leaf) => {
                outcome.pages_kept += 1;
                leaf.cells.clone()
            },
            None => {
                outcome.pages_recovered += 1;
                recover_range(&scanned, lower, upper.as_deref()).into_iter().collect()
            },
        };
        outcome.cells += cells.len() as u64;
        for (key, _) in &cells {
            if let Some(recno) = crate::btree::key_recno(key) {
                max_recno = max_recno.max(recno);
            }
        }
        let addr = if cells.is_empty() {
            None
        } else {
            let block = PageImage::Leaf(LeafImage { cells }).encode(conn.env.next_write_gen())?;
            Some(store.write(&block, None)?)
        };
        entries.push(RootEntry { lower: lower.clone(), addr, page_del: None });
    }
    let root_block = PageImage::Root(RootImage { entries, max_recno }).encode(conn.env.next_write_gen())?;
    let new_root = store.write(&root_block, None)?;
    store.sync()?;

    let (params, logged) = {
        let meta = conn.meta.lock();
        let entry = meta
            .image
            .schema
            .values()
            .find(|e| e.file_id() == Some(tree.id))
            .ok_or_else(|| Error::corrupt(format!("{}: missing file entry", tree.name)))?;
        (entry.tree_params(false)?, tree.is_logged())
    };
    let rebuilt = Arc::new(Btree::open(params, store.clone(), conn.env.clone(), Some(&new_root))?);
    rebuilt.set_logged(logged);

    let live = {
        let mut meta = conn.meta.lock();
        let order = meta.image.ckpt_order;
        let ts = meta.image.last_ckpt_ts;
        let ckpt = CheckpointRef {
            root: Some(new_root),
            order,
            ts,
            write_gen: conn.env.write_gen(),
            file_size: store.size()?,
            time: chrono::Utc::now().timestamp(),
        };
        meta.image.checkpoints.insert(tree.id, BTreeMap::from([(DEFAULT_CHECKPOINT.to_string(), ckpt)]));
        meta.commit()?;
        referenced_blocks(&rebuilt, &meta.image)?
    };
    if let Some(old) = conn.trees.write().insert(tree.id, rebuilt) {
        old.close();
    }
    store.begin_reclaim();
    store.reclaim(&live)?;
    store.truncate_tail()?;
    Ok(outcome)
}

/// Rebuilds `uri` around its unreadable pages.
///
/// # Errors
///
/// - [`Error::Busy`] while cursors are open on the object
/// - [`Error::Corruption`] when the root itself is unreadable and `force` is off
/// - [`Error::Unsupported`] for stores that cannot be scanned
pub(crate) fn salvage(conn: &ConnInner, uri: &str, cfg: &SalvageConfig) -> Result<SalvageOutcome> {
    conn.check_open()?;
    if conn.readonly() {
        return Err(Error::ReadOnly);
    }
    if conn.env.config().in_memory {
        return Ok(SalvageOutcome::default());
    }
    let trees = exclusive_trees(conn, uri, "salvage")?;
    let _ckpt = conn.checkpoint_lock.lock();
    if trees.iter().any(|t| t.is_dirty()) {
        checkpoint_locked(conn, &CheckpointConfig::default())?;
    }
    let _schema = conn.schema_lock.lock();
    let mut total = SalvageOutcome::default();
    for tree in &trees {
        let out = salvage_tree(conn, tree, cfg)?;
        total.pages_kept += out.pages_kept;
        total.pages_recovered += out.pages_recovered;
        total.cells += out.cells;
    }
    info!(uri, kept = total.pages_kept, recovered = total.pages_recovered, cells = total.cells, "salvaged");
    Ok(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::{
        fs::OpenOptions,
        io::{Seek, SeekFrom, Write},
    };

    use super::*;
    use crate::conn::Connection;

    fn populate(conn: &Connection, rows: i64) {
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S,leaf_page_max=4KB").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for i in 0..rows {
            c.set_key(i);
            c.set_value(format!("value-{i:06}"));
            c.insert().unwrap();
        }
        drop(c);
        session.checkpoint("").unwrap();
    }

    /// Offset of the first leaf page of `t`'s newest checkpoint.
    fn first_leaf(conn: &Connection) -> BlockAddr {
        let inner = conn.inner();
        let target = inner.data_target("table:t").unwrap();
        let root = inner.meta.lock().image.latest(target.tree.id).unwrap().root.unwrap();
        let image = read_root(target.tree.store().as_ref(), &root).unwrap();
        image.entries.iter().find_map(|e| e.addr).unwrap()
    }

    fn smash(path: &std::path::Path, addr: &BlockAddr) {
        let mut file = OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(addr.offset + 30)).unwrap();
        file.write_all(&[0xff; 16]).unwrap();
        file.sync_all().unwrap();
    }

    #[test]
    fn test_clean_tree_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        populate(&conn, 2000);
        let cfg = VerifyConfig { dump_address: true, ..VerifyConfig::default() };
        let report = verify(conn.inner(), "table:t", &cfg).unwrap();
        assert_eq!(report.cells, 2000);
        assert!(report.pages > 1);
        assert_eq!(report.lines.len() as u64, report.pages);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_open_cursor_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        populate(&conn, 10);
        let session = conn.open_session("").unwrap();
        let _c = session.open_cursor("table:t", "").unwrap();
        assert!(matches!(verify(conn.inner(), "table:t", &VerifyConfig::default()), Err(Error::Busy { .. })));
    }

    #[test]
    fn test_damaged_page_reported_then_salvaged() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        populate(&conn, 2000);
        // Evict so the damaged page is read from disk afterwards.
        crate::evict::evict_pass(conn.inner(), true).unwrap();
        smash(&dir.path().join("t.cdb"), &first_leaf(&conn));

        let err = verify(conn.inner(), "table:t", &VerifyConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
        let cfg = VerifyConfig { read_corrupt: true, ..VerifyConfig::default() };
        let report = verify(conn.inner(), "table:t", &cfg).unwrap();
        assert_eq!(report.errors.len(), 1);

        let out = salvage(conn.inner(), "table:t", &SalvageConfig::default()).unwrap();
        assert_eq!(out.pages_recovered, 1);
        assert!(out.pages_kept > 0);
        verify(conn.inner(), "table:t", &VerifyConfig::default()).unwrap();

        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1999i64);
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_str(), Some("value-001999"));
    }
}
