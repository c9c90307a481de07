//! Live restore.
//!
//! A destination database opens over a source directory holding a backup.
//! Tree files that exist in the source start as [`RestoringFile`]s: reads
//! of unmigrated chunks come from the source and writes copy their chunk
//! first. A single background migrator drains a bounded queue of files,
//! copying a few chunks per step, until every file is complete.
//!
//! Progress moves through [`LiveRestoreState`] and is persisted with each
//! checkpoint, so a restart resumes where migration stopped.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use cellar_types::config::LiveRestoreConfig;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    bitmap::ChunkBitmap,
    block::{PlainFile, RawFile, RestoreSource, RestoreTracker, RestoringFile},
    env::Env,
    error::{Error, Result},
    log::LOG_PREFIX,
    meta::{META_FILE, RestoreProgress},
    metrics,
    stats::Stat,
};

/// Name of the metadata snapshot a backup cursor writes.
pub const BACKUP_META_FILE: &str = "cellar.backup";

/// Chunks copied per migrator step.
const CHUNKS_PER_STEP: usize = 16;

/// Migration states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LiveRestoreState {
    Uninitialized = 0,
    InProgress = 1,
    CleanUp = 2,
    Complete = 3,
}

impl LiveRestoreState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LiveRestoreState::Uninitialized,
            1 => LiveRestoreState::InProgress,
            2 => LiveRestoreState::CleanUp,
            _ => LiveRestoreState::Complete,
        }
    }
}

/// Live-restore state of a connection.
pub(crate) struct LiveRestore {
    source: RestoreSource,
    read_size: u64,
    env: Arc<Env>,
    files: Mutex<BTreeMap<String, Arc<RestoringFile>>>,
    state: AtomicU8,
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl std::fmt::Debug for LiveRestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveRestore").field("source", &self.source.root()).field("state", &self.state()).finish()
    }
}

impl LiveRestore {
    /// Sets up a restore from `cfg.path`. `files` bounds the migration queue.
    pub fn new(cfg: &LiveRestoreConfig, env: Arc<Env>, files: usize) -> Result<Self> {
        let root = PathBuf::from(&cfg.path);
        if !root.is_dir() {
            return Err(Error::invalid(format!("live_restore: source '{}' is not a directory", cfg.path)));
        }
        let (tx, rx) = bounded(files.max(1));
        Ok(Self {
            source: RestoreSource::new(root),
            read_size: cfg.read_size.max(512),
            env,
            files: Mutex::new(BTreeMap::new()),
            state: AtomicU8::new(LiveRestoreState::Uninitialized as u8),
            tx,
            rx,
        })
    }

    /// Source directory.
    pub fn source(&self) -> &Path {
        self.source.root()
    }

    /// Copies the metadata and log files from the source when the
    /// destination has none of its own yet.
    pub fn prepare_home(source: &Path, home: &Path) -> Result<()> {
        if home.join(META_FILE).exists() {
            return Ok(());
        }
        let meta = [META_FILE, BACKUP_META_FILE].iter().map(|n| source.join(n)).find(|p| p.exists());
        if let Some(meta) = meta {
            fs::copy(&meta, home.join(META_FILE))?;
        }
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(LOG_PREFIX) && !home.join(&name).exists() {
                fs::copy(entry.path(), home.join(&name))?;
            }
        }
        info!(source = %source.display(), home = %home.display(), "live restore seeded destination");
        Ok(())
    }

    /// Returns a restoring view of `name` when it still has chunks to copy.
    ///
    /// `progress` is the persisted state from an earlier run. A file with
    /// no recorded progress restores only when the destination lacks it.
    pub fn open_file(
        &self,
        home: &Path,
        name: &str,
        progress: Option<&RestoreProgress>,
    ) -> Result<Option<Arc<RestoringFile>>> {
        let dest_path = home.join(name);
        let Some(source) = self.source.open(name)? else { return Ok(None) };
        let (bitmap, chunk_size, source_len) = match progress {
            Some(p) if p.bitmap.is_complete() => return Ok(None),
            Some(p) => (p.bitmap.clone(), p.chunk_size, p.source_len),
            None if dest_path.exists() => return Ok(None),
            None => {
                let len = source.metadata()?.len();
                (ChunkBitmap::for_file(len, self.read_size), self.read_size, len)
            },
        };
        let dest = PlainFile::open(&dest_path, true)?;
        let tracker = Arc::new(RestoreTracker::new(bitmap, chunk_size, source_len));
        let file = Arc::new(RestoringFile::new(dest, Some(source), tracker)?);
        self.files.lock().insert(name.to_string(), file.clone());
        self.enqueue(name);
        self.set_state(LiveRestoreState::InProgress);
        debug!(file = name, "live restore tracking file");
        Ok(Some(file))
    }

    fn enqueue(&self, name: &str) {
        match self.tx.try_send(name.to_string()) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {},
        }
    }

    /// Finishes opening: with nothing left to copy the restore is complete.
    pub fn opened(&self) {
        if self.files.lock().values().all(|f| f.tracker().is_complete()) {
            self.set_state(LiveRestoreState::Complete);
        }
    }

    pub fn state(&self) -> LiveRestoreState {
        LiveRestoreState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LiveRestoreState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        self.env.stats.set(Stat::LiveRestoreState, state as i64);
        metrics::set_live_restore_state(state as u64);
        if prev != state as u8 {
            info!(state = ?state, "live restore state changed");
        }
    }

    /// Copies the next few chunks. Returns true while work remains.
    pub fn migrate_step(&self) -> Result<bool> {
        let Ok(name) = self.rx.try_recv() else {
            return Ok(self.finish_if_done());
        };
        let file = self.files.lock().get(&name).cloned();
        let Some(file) = file else { return Ok(true) };
        let mut more = true;
        for _ in 0..CHUNKS_PER_STEP {
            more = file.migrate_next()?;
            if !more {
                break;
            }
        }
        if more {
            self.enqueue(&name);
        } else {
            file.sync()?;
            debug!(file = %name, "live restore migrated file");
        }
        Ok(true)
    }

    fn finish_if_done(&self) -> bool {
        if self.state() == LiveRestoreState::Complete {
            return false;
        }
        let files = self.files.lock();
        if !files.values().all(|f| f.tracker().is_complete()) {
            // A file fell out of the queue while it was full.
            for (name, file) in files.iter() {
                if !file.tracker().is_complete() {
                    self.enqueue(name);
                }
            }
            return true;
        }
        drop(files);
        self.set_state(LiveRestoreState::CleanUp);
        self.set_state(LiveRestoreState::Complete);
        false
    }

    /// Migrates every remaining chunk of `name` now (before a rename or drop).
    pub fn finish_file(&self, name: &str) -> Result<()> {
        let file = self.files.lock().remove(name);
        if let Some(file) = file {
            while file.migrate_next()? {}
            file.sync()?;
        }
        Ok(())
    }

    /// Progress of every file still migrating, for the metadata image.
    pub fn progress(&self) -> BTreeMap<String, RestoreProgress> {
        self.files
            .lock()
            .iter()
            .filter(|(_, f)| !f.tracker().is_complete())
            .map(|(name, f)| {
                let tracker = f.tracker();
                let bitmap = tracker.snapshot();
                let source_len = bitmap.len() * tracker.chunk_size();
                (name.clone(), RestoreProgress { chunk_size: tracker.chunk_size(), source_len, bitmap })
            })
            .collect()
    }
}
