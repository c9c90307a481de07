//! Disaggregated storage.
//!
//! Layered tables keep their stable tree in a page log shared between
//! nodes and take new writes into a local in-memory ingest tree. One node
//! is the leader: it writes stable pages (as deltas where possible) and
//! publishes a checkpoint record after each checkpoint. Followers open the
//! stable trees read-only at a published checkpoint and move forward with
//! [`Disagg::advance`].
//!
//! ```text
//! <page_log>/
//!   checkpoints.plog     framed PublishedCheckpoint records
//!   <table>.cdb.plog     append-only blocks of one stable tree
//! ```
//!
//! Promoting a follower drains every ingest tree into a writable copy of
//! its stable tree. Nothing becomes visible until every table has drained.

use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use cellar_types::{
    Timestamp, codec,
    config::{ConnectionConfig, CreateConfig, DisaggRole},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    block::{
        BLOCK_HEADER_SIZE, BlockAddr, BlockKind, BlockStore, MemBlockStore, decode_block,
        read_exact_at_offset, write_all_at_offset,
    },
    btree::{Btree, Expect, Lookup, WriteCtx},
    conn::ConnInner,
    env::Env,
    error::{Error, Result},
    log::{LOG_PREFIX, removal},
    meta::{DEFAULT_CHECKPOINT, META_FILE, MetaImage},
    schema::{EntryKind, FILE_SUFFIX, SchemaEntry, file_entry, wrapper_entry},
    stats::Stat,
    txn::Reader,
    update::UpdateKind,
};

/// Published checkpoint records.
pub const PAGE_LOG_CHECKPOINTS: &str = "checkpoints.plog";

/// Suffix of per-tree page log files.
pub const PAGE_LOG_SUFFIX: &str = ".plog";

/// Suffix of ingest tree file names.
pub const INGEST_SUFFIX: &str = ".ingest";

/// True for the URI or file name of an ingest tree.
pub(crate) fn is_ingest(name: &str) -> bool {
    name.ends_with(INGEST_SUFFIX)
}

/// Block store appending to one page log file.
///
/// Addresses are file offsets; `lsn` is the offset plus one so that every
/// block carries a distinct, increasing sequence number.
pub(crate) struct PageLogStore {
    file: File,
    name: String,
    env: Arc<Env>,
    write_lock: Mutex<()>,
    deltas: AtomicU64,
}

impl std::fmt::Debug for PageLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLogStore").field("name", &self.name).finish()
    }
}

impl PageLogStore {
    /// Opens `<dir>/<name>.plog`, creating it when `writable`.
    pub fn open(dir: &Path, name: &str, writable: bool, env: Arc<Env>) -> Result<Self> {
        let path = dir.join(format!("{name}{PAGE_LOG_SUFFIX}"));
        let file = OpenOptions::new().read(true).write(writable).create(writable).open(&path)?;
        Ok(Self { file, name: name.to_string(), env, write_lock: Mutex::new(()), deltas: AtomicU64::new(0) })
    }
}

impl BlockStore for PageLogStore {
    fn write(&self, block: &[u8], _prev: Option<&BlockAddr>) -> Result<BlockAddr> {
        let _guard = self.write_lock.lock();
        let offset = self.file.metadata()?.len();
        write_all_at_offset(&self.file, block, offset)?;
        if block.len() > 4 && block[4] == BlockKind::Delta as u8 {
            self.deltas.fetch_add(1, Ordering::Relaxed);
        }
        self.env.stats.incr(Stat::DisaggBlockPutCold);
        Ok(BlockAddr {
            offset,
            size: block.len() as u32,
            checksum: codec::checksum32(block),
            lsn: offset + 1,
        })
    }

    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; addr.size as usize];
        read_exact_at_offset(&self.file, &mut buf, addr.offset)
            .map_err(|e| Error::corrupt(format!("{}: page log read at {}: {e}", self.name, addr.offset)))?;
        if codec::checksum32(&buf) != addr.checksum {
            return Err(Error::corrupt(format!("{}: page log block at {} checksum mismatch", self.name, addr.offset)));
        }
        self.env.stats.incr(Stat::DisaggBlockGetCold);
        Ok(buf)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn scan(&self) -> Result<Vec<BlockAddr>> {
        let len = self.file.metadata()?.len();
        let mut out = Vec::new();
        let mut offset = 0u64;
        while offset + BLOCK_HEADER_SIZE as u64 <= len {
            let mut header = [0u8; BLOCK_HEADER_SIZE];
            read_exact_at_offset(&self.file, &mut header, offset)?;
            let payload = u64::from(u32::from_be_bytes([header[16], header[17], header[18], header[19]]));
            let size = BLOCK_HEADER_SIZE as u64 + payload;
            if offset + size > len {
                break;
            }
            let mut block = vec![0u8; size as usize];
            read_exact_at_offset(&self.file, &mut block, offset)?;
            if decode_block(&block).is_err() {
                break;
            }
            out.push(BlockAddr { offset, size: size as u32, checksum: codec::checksum32(&block), lsn: offset + 1 });
            offset += size;
        }
        Ok(out)
    }

    fn is_shared(&self) -> bool {
        true
    }

    fn deltas_written(&self) -> u64 {
        self.deltas.load(Ordering::Relaxed)
    }
}

/// One layered table in a published checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PublishedTable {
    /// Layered URI (`layered:<name>`).
    pub uri: String,
    pub key_format: String,
    pub value_format: String,
    pub columns: Vec<String>,
    /// File name of the stable tree.
    pub stable_file: String,
    pub root: Option<BlockAddr>,
}

/// A checkpoint the leader made visible to followers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PublishedCheckpoint {
    pub id: u64,
    pub ts: Timestamp,
    pub txn_id_base: u64,
    pub tables: Vec<PublishedTable>,
}

/// Reads every published checkpoint, oldest first.
pub(crate) fn read_published(page_log: &Path) -> Result<Vec<PublishedCheckpoint>> {
    let path = page_log.join(PAGE_LOG_CHECKPOINTS);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let buf = fs::read(&path)?;
    let mut out = Vec::new();
    let mut at = 0;
    while at < buf.len() {
        match codec::decode_framed::<PublishedCheckpoint>(&buf[at..]) {
            Ok(Some((record, used))) => {
                out.push(record);
                at += used;
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, offset = at, "torn published checkpoint record");
                break;
            },
        }
    }
    Ok(out)
}

fn append_published(page_log: &Path, record: &PublishedCheckpoint) -> Result<()> {
    let framed = codec::encode_framed(record)?;
    let file = OpenOptions::new().create(true).append(true).open(page_log.join(PAGE_LOG_CHECKPOINTS))?;
    std::io::Write::write_all(&mut &file, &framed)?;
    file.sync_data()?;
    Ok(())
}

/// Stable file URIs of every layered table in `schema`.
pub(crate) fn stable_files(schema: &BTreeMap<String, SchemaEntry>) -> HashSet<String> {
    schema
        .values()
        .filter_map(|e| match &e.kind {
            EntryKind::Layered { stable, .. } => Some(stable.clone()),
            _ => None,
        })
        .collect()
}

/// Schema entries for a new layered table: the wrapper, its ingest file
/// and its stable file.
pub(crate) fn layered_entries(name: &str, ingest_id: u64, stable_id: u64, cfg: &CreateConfig) -> [SchemaEntry; 3] {
    let ingest_file = format!("{name}{INGEST_SUFFIX}");
    let stable_file = format!("{name}{FILE_SUFFIX}");
    let ingest_uri = format!("file:{ingest_file}");
    let stable_uri = format!("file:{stable_file}");
    let ingest_cfg = CreateConfig { log_enabled: false, ..cfg.clone() };
    let stable_cfg = CreateConfig { log_enabled: false, ..cfg.clone() };
    [
        wrapper_entry(
            &format!("layered:{name}"),
            &stable_cfg,
            EntryKind::Layered { ingest: ingest_uri.clone(), stable: stable_uri.clone() },
        ),
        file_entry(&ingest_uri, ingest_id, &ingest_file, &ingest_cfg),
        file_entry(&stable_uri, stable_id, &stable_file, &stable_cfg),
    ]
}

/// Disaggregated state of a connection.
#[derive(Debug)]
pub(crate) struct Disagg {
    page_log: PathBuf,
    role: Mutex<DisaggRole>,
    /// Last checkpoint published (leader) or loaded (follower).
    last: AtomicU64,
}

impl Disagg {
    pub fn new(cfg: &ConnectionConfig) -> Result<Self> {
        let page_log = PathBuf::from(&cfg.disaggregated.page_log);
        fs::create_dir_all(&page_log)?;
        Ok(Self { page_log, role: Mutex::new(cfg.disaggregated.role), last: AtomicU64::new(0) })
    }

    pub fn page_log(&self) -> &Path {
        &self.page_log
    }

    pub fn is_leader(&self) -> bool {
        *self.role.lock() == DisaggRole::Leader
    }

    /// Id of the last checkpoint published or loaded.
    pub fn last_checkpoint(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    pub fn set_last(&self, id: u64) {
        self.last.fetch_max(id, Ordering::AcqRel);
    }

    /// Store for a stable tree file.
    pub fn open_store(&self, file_name: &str, writable: bool, env: Arc<Env>) -> Result<Arc<dyn BlockStore>> {
        Ok(Arc::new(PageLogStore::open(&self.page_log, file_name, writable, env)?))
    }

    /// Removes local copies of shared state so the node starts from the page log.
    pub fn wipe_local(home: &Path) -> Result<()> {
        if !home.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(home)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == META_FILE || name.starts_with(LOG_PREFIX) || name.ends_with(FILE_SUFFIX) {
                fs::remove_file(entry.path())?;
                debug!(file = %name, "removed local file");
            }
        }
        Ok(())
    }

    /// Publishes the checkpoint recorded in `image`, which is about to be
    /// committed. Returns the new id; followers publish nothing.
    pub fn publish(&self, image: &mut MetaImage, ts: Timestamp, txn_id_base: u64) -> Result<u64> {
        if !self.is_leader() {
            return Ok(image.disagg_checkpoint);
        }
        let mut tables = Vec::new();
        for entry in image.schema.values() {
            let EntryKind::Layered { stable, .. } = &entry.kind else { continue };
            let Some(stable_entry) = image.schema.get(stable) else { continue };
            let EntryKind::File { id, file_name, .. } = &stable_entry.kind else { continue };
            let root = image.checkpoint(*id, DEFAULT_CHECKPOINT).and_then(|c| c.root);
            tables.push(PublishedTable {
                uri: entry.uri.clone(),
                key_format: entry.key_format.clone(),
                value_format: entry.value_format.clone(),
                columns: entry.columns.clone(),
                stable_file: file_name.clone(),
                root,
            });
        }
        let id = image.disagg_checkpoint.max(self.last_checkpoint()) + 1;
        let record = PublishedCheckpoint { id, ts, txn_id_base, tables };
        append_published(&self.page_log, &record)?;
        image.disagg_checkpoint = id;
        self.set_last(id);
        info!(id, tables = record.tables.len(), "published checkpoint");
        Ok(id)
    }

    /// Loads the published checkpoint `target` (latest when `None`) into a
    /// follower. Returns the id now loaded.
    pub fn advance(&self, conn: &ConnInner, target: Option<u64>) -> Result<u64> {
        if self.is_leader() {
            return Err(Error::invalid("advance_checkpoint: only a follower loads published checkpoints"));
        }
        let _schema = conn.schema_lock.lock();
        self.load_locked(conn, target, false)
    }

    fn load_locked(&self, conn: &ConnInner, target: Option<u64>, writable: bool) -> Result<u64> {
        let published = read_published(&self.page_log)?;
        let record = match target {
            Some(id) => published
                .into_iter()
                .rev()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::invalid(format!("no published checkpoint with id {id}")))?,
            None => match published.into_iter().max_by_key(|r| r.id) {
                Some(r) => r,
                None => return Ok(self.last_checkpoint()),
            },
        };
        if target.is_none() && record.id <= self.last_checkpoint() {
            return Ok(self.last_checkpoint());
        }

        let mut meta = conn.meta.lock();
        let mut opened = Vec::new();
        for table in &record.tables {
            let name = table.uri.strip_prefix("layered:").unwrap_or(&table.uri).to_string();
            if !meta.image.schema.contains_key(&table.uri) {
                let ingest_id = meta.image.next_btree_id;
                let stable_id = ingest_id + 1;
                meta.image.next_btree_id += 2;
                let cfg = CreateConfig {
                    key_format: table.key_format.clone(),
                    value_format: table.value_format.clone(),
                    columns: table.columns.clone(),
                    ..CreateConfig::default()
                };
                let entries = layered_entries(&name, ingest_id, stable_id, &cfg);
                let ingest = &entries[1];
                let tree = Btree::create(ingest.tree_params(false)?, Arc::new(MemBlockStore::new()), conn.env.clone());
                opened.push(Arc::new(tree));
                for entry in entries {
                    meta.image.schema.insert(entry.uri.clone(), entry);
                }
                info!(table = %table.uri, "installed layered table from page log");
            }
            let Some(EntryKind::Layered { stable, .. }) = meta.image.schema.get(&table.uri).map(|e| e.kind.clone())
            else {
                return Err(Error::corrupt(format!("{} is not a layered table", table.uri)));
            };
            let stable_entry = meta
                .image
                .schema
                .get(&stable)
                .ok_or_else(|| Error::corrupt(format!("{stable}: missing schema entry")))?;
            let store = self.open_store(&table.stable_file, writable, conn.env.clone())?;
            let tree = Btree::open(stable_entry.tree_params(!writable)?, store, conn.env.clone(), table.root.as_ref())?;
            opened.push(Arc::new(tree));
        }
        meta.image.disagg_checkpoint = record.id;
        meta.commit()?;
        drop(meta);

        {
            let mut trees = conn.trees.write();
            for tree in opened {
                if let Some(old) = trees.insert(tree.id, tree) {
                    old.close();
                }
            }
        }
        conn.txn.advance_base(record.txn_id_base);
        self.last.store(record.id, Ordering::Release);
        info!(id = record.id, tables = record.tables.len(), "loaded published checkpoint");
        Ok(record.id)
    }

    /// Applies a runtime change of the `disaggregated` settings.
    pub fn reconfigure(&self, conn: &ConnInner, current: &ConnectionConfig, next: &ConnectionConfig) -> Result<()> {
        let (cur, new) = (&current.disaggregated, &next.disaggregated);
        if cur.page_log != new.page_log {
            return Err(Error::invalid("disaggregated.page_log cannot change at runtime"));
        }
        match (cur.role, new.role) {
            (DisaggRole::Follower, DisaggRole::Leader) => return self.promote(conn),
            (DisaggRole::Leader, DisaggRole::Follower) => {
                return Err(Error::invalid("a leader cannot step down to follower"));
            },
            _ => {},
        }
        if new.checkpoint_meta != cur.checkpoint_meta && !new.checkpoint_meta.is_empty() {
            let id = new
                .checkpoint_meta
                .parse::<u64>()
                .map_err(|_| Error::invalid(format!("invalid checkpoint_meta '{}'", new.checkpoint_meta)))?;
            self.advance(conn, Some(id))?;
        }
        Ok(())
    }

    /// Makes this follower the leader.
    fn promote(&self, conn: &ConnInner) -> Result<()> {
        let _schema = conn.schema_lock.lock();
        self.load_locked(conn, None, false)?;

        let layered: Vec<(SchemaEntry, SchemaEntry)> = {
            let meta = conn.meta.lock();
            let mut out = Vec::new();
            for entry in meta.image.schema.values() {
                let EntryKind::Layered { ingest, stable } = &entry.kind else { continue };
                if let (Some(ingest), Some(stable)) = (meta.image.schema.get(ingest), meta.image.schema.get(stable)) {
                    out.push((ingest.clone(), stable.clone()));
                }
            }
            out
        };

        // Build every writable stable tree before touching the live set.
        let mut replacements = Vec::new();
        for (ingest_entry, stable_entry) in &layered {
            let (Some(ingest_id), Some(stable_id)) = (ingest_entry.file_id(), stable_entry.file_id()) else { continue };
            let ingest = conn.tree(ingest_id)?;
            let current = conn.tree(stable_id)?;
            let EntryKind::File { file_name, .. } = &stable_entry.kind else { continue };
            let store = self.open_store(file_name, true, conn.env.clone())?;
            let stable = Arc::new(Btree::open(stable_entry.tree_params(false)?, store, conn.env.clone(), current.root().as_ref())?);
            let drained = drain_into(&ingest, &stable)?;
            debug!(table = %stable.name, drained, "drained ingest tree");
            let fresh = Btree::create(ingest_entry.tree_params(false)?, Arc::new(MemBlockStore::new()), conn.env.clone());
            replacements.push((stable, Arc::new(fresh)));
        }

        {
            let mut trees = conn.trees.write();
            for (stable, ingest) in replacements {
                for tree in [stable, ingest] {
                    if let Some(old) = trees.insert(tree.id, tree) {
                        old.close();
                    }
                }
            }
        }
        *self.role.lock() = DisaggRole::Leader;
        info!(tables = layered.len(), "promoted to leader");
        Ok(())
    }
}

/// Copies the newest committed state of every ingest key into `stable`.
fn drain_into(ingest: &Btree, stable: &Btree) -> Result<u64> {
    let reader = Reader::global();
    let mut changes = Vec::new();
    for page in ingest.pages() {
        let Some(st) = ingest.lock_loaded(&page)? else { continue };
        let Some(leaf) = st.leaf.as_ref() else { continue };
        for (key, slot) in &leaf.slots {
            match ingest.read_slot(leaf, slot, st.page_del.as_ref(), key, &reader, None)? {
                Lookup::Found(value) => changes.push((key.clone(), Some(value))),
                Lookup::Deleted => changes.push((key.clone(), None)),
                Lookup::Absent => {},
            }
        }
    }
    let ctx = WriteCtx::global();
    let count = changes.len() as u64;
    for (key, value) in changes {
        let kind = match value {
            Some(v) => UpdateKind::Standard(v),
            None => removal(stable),
        };
        stable.write(&key, kind, &ctx, Expect::Any)?;
    }
    Ok(count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{block::encode_block, btree::tests::test_env};

    #[test]
    fn test_page_log_store_appends_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let env = test_env();
        let store = PageLogStore::open(dir.path(), "t.cdb", true, env.clone()).unwrap();
        let a = store.write(&encode_block(BlockKind::Leaf, 1, b"first"), None).unwrap();
        let b = store.write(&encode_block(BlockKind::Delta, 2, b"second"), Some(&a)).unwrap();
        assert!(b.offset > a.offset);
        assert!(b.lsn > a.lsn);
        assert_eq!(store.deltas_written(), 1);
        assert!(store.is_shared());

        let reader = PageLogStore::open(dir.path(), "t.cdb", false, env.clone()).unwrap();
        let (_, payload) = decode_block(&reader.read(&b).unwrap()).map(|(h, p)| (h, p.to_vec())).unwrap();
        assert_eq!(payload, b"second");
        assert_eq!(reader.scan().unwrap(), vec![a, b]);
        assert_eq!(env.stats.get(Stat::DisaggBlockPutCold), 2);
    }

    #[test]
    fn test_published_records_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_published(dir.path()).unwrap().is_empty());
        for id in 1..=3 {
            let record = PublishedCheckpoint { id, ts: id * 10, txn_id_base: 100 + id, tables: Vec::new() };
            append_published(dir.path(), &record).unwrap();
        }
        let records = read_published(dir.path()).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(records[2].txn_id_base, 103);
    }

    #[test]
    fn test_layered_entries_name_their_files() {
        let cfg = CreateConfig { key_format: "S".into(), value_format: "S".into(), ..CreateConfig::default() };
        let [wrapper, ingest, stable] = layered_entries("t", 4, 5, &cfg);
        assert_eq!(wrapper.uri, "layered:t");
        assert_eq!(ingest.uri, "file:t.ingest");
        assert!(is_ingest(&ingest.uri));
        assert_eq!(stable.file_id(), Some(5));
        let mut schema = BTreeMap::new();
        schema.insert(wrapper.uri.clone(), wrapper);
        assert!(stable_files(&schema).contains("file:t.cdb"));
    }
}
