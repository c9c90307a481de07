//! Opening, recovery and shutdown.
//!
//! Opening runs in a fixed order: lock the home directory, read the
//! metadata image, open every btree at its newest checkpoint, replay the
//! log for logged tables, settle prepared transactions left by the last
//! run, then roll non-logged tables back to the stable timestamp before
//! any session can observe them.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, OpenOptions},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use cellar_types::{
    TS_NONE,
    config::{
        CheckpointConfig, ConfigSection, ConnectionConfig, CreateConfig, LocalFilesAction, RecoverMode, SyncMethod,
    },
};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{ConnInner, LOCK_FILE, MetaState, VERSION_FILE};
use crate::{
    block::{BlockStore, FileBlockStore, MemBlockStore, PlainFile},
    btree::{Btree, Resolution, TreeParams},
    checkpoint::referenced_blocks,
    disagg::{Disagg, is_ingest, stable_files},
    env::Env,
    error::{Error, Result},
    hs::{HS_BTREE_ID, HS_URI, HistoryStore},
    live_restore::{BACKUP_META_FILE, LiveRestore},
    log::{Log, Lsn, read_log, replay},
    meta::{META_FILE, MetaFile, MetaImage, MetaStore, RestoreProgress},
    schema::{EntryKind, file_entry},
    txn::{RecoveredPrepared, TimestampRecord, TxnGlobal, TxnOp},
};

/// Where a tree file's blocks live.
pub(super) struct StoreSource<'a> {
    pub home: &'a Path,
    pub env: &'a Arc<Env>,
    pub disagg: Option<&'a Disagg>,
    pub live_restore: Option<&'a LiveRestore>,
}

impl StoreSource<'_> {
    /// Opens (or creates) the block store for `file_name`.
    ///
    /// `shared` marks the stable file of a layered table; `progress` is the
    /// persisted live-restore state of the file, if any.
    pub fn open(
        &self,
        file_name: &str,
        allocation_size: u64,
        shared: bool,
        progress: Option<&RestoreProgress>,
    ) -> Result<Arc<dyn BlockStore>> {
        let config = self.env.config();
        if config.in_memory || is_ingest(file_name) {
            return Ok(Arc::new(MemBlockStore::new()));
        }
        if shared {
            if let Some(disagg) = self.disagg {
                return disagg.open_store(file_name, disagg.is_leader() && !config.readonly, self.env.clone());
            }
        }
        if let Some(restore) = self.live_restore {
            if let Some(file) = restore.open_file(self.home, file_name, progress)? {
                return Ok(Arc::new(FileBlockStore::open(Box::new(file), file_name)?));
            }
        }
        let path = self.home.join(file_name);
        let exists = path.metadata().is_ok_and(|m| m.len() > 0);
        if exists {
            Ok(Arc::new(FileBlockStore::open(Box::new(PlainFile::open(&path, false)?), file_name)?))
        } else {
            if config.readonly {
                return Err(Error::invalid(format!("{file_name}: missing tree file in a readonly connection")));
            }
            Ok(Arc::new(FileBlockStore::create(Box::new(PlainFile::open(&path, true)?), allocation_size, file_name)?))
        }
    }
}

fn open_tree(
    source: &StoreSource<'_>,
    image: &MetaImage,
    params: TreeParams,
    file_name: &str,
    allocation_size: u64,
    shared: bool,
) -> Result<Btree> {
    let store = source.open(file_name, allocation_size, shared, image.live_restore.get(file_name))?;
    // In-memory stores start empty whatever the metadata says.
    let root = if source.env.config().in_memory || is_ingest(file_name) {
        None
    } else {
        image.latest(params.id).and_then(|c| c.root)
    };
    let tree = Btree::open(params, store, source.env.clone(), root.as_ref())?;
    let store = tree.store().clone();
    store.begin_reclaim();
    store.reclaim(&referenced_blocks(&tree, image)?)?;
    Ok(tree)
}

fn lock_home(home: &Path) -> Result<fs::File> {
    let file = OpenOptions::new().create(true).truncate(false).write(true).open(home.join(LOCK_FILE))?;
    file.try_lock_exclusive()
        .map_err(|_| Error::busy(format!("{} is in use by another connection", home.display())))?;
    let version = home.join(VERSION_FILE);
    if !version.exists() {
        fs::write(&version, format!("cellar {}\n", env!("CARGO_PKG_VERSION")))?;
    }
    Ok(file)
}

/// Reads the metadata image, creating the file for a new database.
/// Returns the store, the image and whether the last run ended uncleanly.
fn load_meta(home: &Path, config: &ConnectionConfig) -> Result<(MetaStore, MetaImage, bool)> {
    let fresh = MetaImage { next_btree_id: HS_BTREE_ID + 1, ..MetaImage::default() };
    if config.in_memory {
        return Ok((MetaStore::Memory, fresh, false));
    }
    let path = home.join(META_FILE);
    let backup = home.join(BACKUP_META_FILE);
    if !path.exists() && backup.exists() {
        fs::rename(&backup, &path)?;
        info!(home = %home.display(), "opening from backup metadata");
    }
    if !path.exists() {
        if !config.create || config.readonly {
            return Err(Error::invalid(format!("{}: no database found (open with create)", home.display())));
        }
        let mut file = MetaFile::create(&path)?;
        file.commit(&fresh)?;
        return Ok((MetaStore::File(file), fresh, false));
    }
    let file = MetaFile::open(&path)?;
    let unclean = file.unclean();
    let image = file.read()?.unwrap_or(fresh);
    Ok((MetaStore::File(file), image, unclean))
}

/// Opens the database in `home`.
pub(super) fn open(home: &Path, config: &str) -> Result<Arc<ConnInner>> {
    let config = ConnectionConfig::parse(config)?;
    if !home.is_dir() {
        if !config.create || config.readonly {
            return Err(Error::invalid(format!("home directory {} does not exist", home.display())));
        }
        fs::create_dir_all(home)?;
    }
    let lock_file = lock_home(home)?;

    let disagg_enabled = config.disaggregated.enabled();
    if disagg_enabled && config.disaggregated.local_files_action == LocalFilesAction::Ignore {
        Disagg::wipe_local(home)?;
    }
    if config.live_restore.enabled {
        LiveRestore::prepare_home(Path::new(&config.live_restore.path), home)?;
    }

    let (mut store, mut image, unclean) = load_meta(home, &config)?;
    if unclean && config.log.enabled && config.log.recover == RecoverMode::Error {
        return Err(Error::RunRecovery);
    }

    let env = Env::new(config.clone(), image.write_gen + 1);
    let disagg = if disagg_enabled { Some(Disagg::new(&config)?) } else { None };
    if let Some(disagg) = &disagg {
        if disagg.is_leader() {
            disagg.set_last(image.disagg_checkpoint);
        }
    }
    let file_count = image.schema.values().filter(|e| matches!(e.kind, EntryKind::File { .. })).count() + 1;
    let live_restore = if config.live_restore.enabled {
        Some(LiveRestore::new(&config.live_restore, env.clone(), file_count)?)
    } else {
        None
    };
    let source = StoreSource { home, env: &env, disagg: disagg.as_ref(), live_restore: live_restore.as_ref() };

    let hs_file = HS_URI.trim_start_matches("file:");
    let hs_entry = file_entry(HS_URI, HS_BTREE_ID, hs_file, &CreateConfig { log_enabled: false, ..Default::default() });
    let hs_tree = open_tree(&source, &image, hs_entry.tree_params(config.readonly)?, hs_file, 4096, false)?;
    let hs = HistoryStore::new(Arc::new(hs_tree));

    let shared = stable_files(&image.schema);
    let is_follower = disagg.as_ref().is_some_and(|d| !d.is_leader());
    let mut trees = HashMap::new();
    for entry in image.schema.values() {
        let EntryKind::File { id, file_name, logged, allocation_size, .. } = &entry.kind else { continue };
        let is_shared = shared.contains(&entry.uri);
        let readonly = config.readonly || (is_shared && is_follower);
        let tree = open_tree(&source, &image, entry.tree_params(readonly)?, file_name, *allocation_size, is_shared)?;
        tree.set_logged(*logged && config.log.enabled && !config.in_memory && !is_ingest(file_name));
        trees.insert(*id, Arc::new(tree));
    }
    debug!(trees = trees.len(), "opened btrees");

    let mut max_txn_id = 0;
    let mut replayed = 0;
    if config.log.enabled && !config.in_memory {
        let log_dir = home.join(&config.log.path);
        if log_dir.is_dir() && !config.readonly {
            let records = read_log(&log_dir, image.ckpt_lsn.unwrap_or_default())?;
            let stats = replay(&records, image.ckpt_lsn.unwrap_or(Lsn::default()), |id| trees.get(&id).cloned())?;
            max_txn_id = stats.max_txn_id;
            replayed = stats.commits;
        }
    }
    let log = if config.log.enabled && !config.in_memory && !config.readonly {
        Some(Log::open(&home.join(&config.log.path), env.clone())?)
    } else {
        None
    };

    let base = image.txn_id_base.max(max_txn_id + 1);
    let txn = TxnGlobal::new(base, TimestampRecord {
        oldest: image.oldest_ts,
        stable: image.stable_ts,
        last_checkpoint: image.last_ckpt_ts,
        recovery: image.stable_ts,
        ..TimestampRecord::default()
    });

    let mut recovered = BTreeMap::new();
    let prepared = std::mem::take(&mut image.prepared);
    for (old_id, entry) in prepared {
        let keep = config.preserve_prepared && entry.prepared_id.is_some() && !config.readonly;
        let new_id = txn.current_id();
        txn.adopt(new_id, entry.clone());
        for (btree, key) in &entry.keys {
            let Some(tree) = trees.get(btree) else { continue };
            tree.reinstate_prepared(key, old_id, new_id, entry.prepare_ts, Some(&hs))?;
        }
        for (btree, lower, upper) in &entry.truncates {
            let Some(tree) = trees.get(btree) else { continue };
            tree.reinstate_range(lower, upper.as_deref(), old_id, new_id, entry.prepare_ts)?;
        }
        match entry.prepared_id {
            Some(prepared_id) if keep => {
                info!(prepared_id, txn_id = new_id, "recovered prepared transaction");
                recovered.insert(prepared_id, RecoveredPrepared {
                    txn_id: new_id,
                    prepared_id,
                    prepare_ts: entry.prepare_ts,
                    ops: entry.ops(),
                });
            },
            _ => {
                for op in entry.ops() {
                    let Some(tree) = trees.get(&op.btree()) else { continue };
                    match &op {
                        TxnOp::Update { key, .. } => tree.resolve_key(key, new_id, Resolution::Rollback)?,
                        TxnOp::Truncate { lower, upper, .. } => {
                            tree.resolve_range(lower, upper.as_deref(), new_id, Resolution::Rollback)?;
                        },
                    }
                }
                txn.finish(new_id);
                debug!(txn_id = old_id, "rolled back prepared transaction from the last run");
            },
        }
    }

    if !config.readonly {
        store.set_unclean(true)?;
    }

    let conn = Arc::new(ConnInner {
        home: home.to_path_buf(),
        env,
        txn,
        trees: RwLock::new(trees),
        hs,
        meta: Mutex::new(MetaState { store, image }),
        log,
        schema_lock: Mutex::new(()),
        checkpoint_lock: Mutex::new(()),
        commit_gate: RwLock::new(()),
        handles: Mutex::new(HashMap::new()),
        ckpt_pins: Mutex::new(HashMap::new()),
        backup: Mutex::new(None),
        recovered: Mutex::new(recovered),
        live_restore,
        disagg,
        servers: Mutex::new(None),
        next_session: AtomicU64::new(1),
        session_sweeps: Mutex::new(HashMap::new()),
        lock_file: Mutex::new(Some(lock_file)),
        closed: AtomicBool::new(false),
    });

    if !conn.readonly() {
        let stable = conn.txn.ts.load().stable;
        if stable != TS_NONE {
            let stats = crate::rts::recover(&conn)?;
            debug!(?stats, "recovery rollback to stable");
        }
        if replayed > 0 && !config.in_memory {
            crate::checkpoint::checkpoint(&conn, &CheckpointConfig::default())?;
        }
    }
    if let Some(restore) = &conn.live_restore {
        restore.opened();
    }
    *conn.servers.lock() = Some(crate::server::Servers::start(&conn)?);
    if let Some(disagg) = &conn.disagg {
        if !disagg.is_leader() {
            let id = disagg.advance(&conn, None)?;
            debug!(id, "follower loaded published checkpoint");
        }
    }
    info!(home = %home.display(), unclean, "connection opened");
    Ok(conn)
}

/// Stops the servers and, when `clean`, writes a final checkpoint.
pub(super) fn shutdown(conn: &ConnInner, clean: bool) -> Result<()> {
    if conn.is_closed() {
        return Ok(());
    }
    let servers = conn.servers.lock().take();
    if let Some(servers) = servers {
        servers.stop();
    }
    let result = if clean && !conn.readonly() && conn.env.check_panic().is_ok() {
        final_checkpoint(conn)
    } else {
        Ok(())
    };
    conn.closed.store(true, Ordering::Release);
    if let Some(log) = &conn.log {
        if conn.backup.lock().take().is_some() {
            log.unpin_backup();
        }
    }
    for tree in conn.all_trees() {
        tree.close();
    }
    if let Some(file) = conn.lock_file.lock().take() {
        if let Err(e) = FileExt::unlock(&file) {
            warn!(error = %e, "failed to release the home lock");
        }
    }
    info!(home = %conn.home.display(), clean, "connection closed");
    result
}

fn final_checkpoint(conn: &ConnInner) -> Result<()> {
    let config = conn.env.config();
    if config.statistics_log.on_close {
        crate::server::write_stats_log(conn)?;
    }
    if !config.in_memory {
        crate::checkpoint::checkpoint(conn, &CheckpointConfig::default())?;
    }
    if let Some(log) = &conn.log {
        log.flush(SyncMethod::Fsync)?;
    }
    conn.meta.lock().store.set_unclean(false)
}
