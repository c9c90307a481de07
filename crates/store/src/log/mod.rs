//! Write-ahead log.
//!
//! Commits to logged trees append one [`LogRecord::Commit`] each. Files are
//! named `CellarLog.<10-digit number>` and switch once the next record
//! would push the current file past `log.file_max`. Every file starts with
//! a file header and a system record pointing at the last record of the
//! previous file.
//!
//! A fresh file is taken from a pre-allocated `CellarPreplog.<n>` when one
//! exists. With `zero_fill` new files are filled with zeros up to
//! `file_max` before use; readers stop at the first all-zero frame, so
//! unused space never parses as a record.
//!
//! ## Structure
//!
//! - `record.rs`: record and operation types, `printlog` rendering
//! - `recovery.rs`: replay of commit records into logged trees

mod record;
mod recovery;

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use cellar_types::{codec, config::SyncMethod};
use parking_lot::Mutex;
pub use record::{LOG_VERSION, LogOp, LogRecord, Lsn, hex, printable};
pub(crate) use recovery::{ReplayStats, removal, replay};
use tracing::{debug, info, warn};

use crate::{
    block::write_all_at_offset,
    env::Env,
    error::{Error, Result},
    metrics,
    stats::Stat,
};

/// Prefix of log file names.
pub const LOG_PREFIX: &str = "CellarLog.";

/// Prefix of pre-allocated log file names.
pub const PREPLOG_PREFIX: &str = "CellarPreplog.";

const ZERO_FILL_CHUNK: usize = 1 << 20;

/// Name of log file `num`.
pub fn log_file_name(num: u32) -> String {
    format!("{LOG_PREFIX}{num:010}")
}

fn preplog_name(num: u32) -> String {
    format!("{PREPLOG_PREFIX}{num:010}")
}

fn parse_num(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?;
    if digits.len() != 10 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Numbers of the log files in `dir`, ascending.
pub fn list_log_files(dir: &Path) -> Result<Vec<u32>> {
    let mut nums = Vec::new();
    if !dir.exists() {
        return Ok(nums);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(num) = entry.file_name().to_str().and_then(|n| parse_num(n, LOG_PREFIX)) {
            nums.push(num);
        }
    }
    nums.sort_unstable();
    Ok(nums)
}

/// Reads every intact record of one log file.
///
/// Reading stops quietly at zero-filled space and with a warning at a torn
/// or corrupt frame; everything before it is returned.
pub fn read_log_file(dir: &Path, num: u32) -> Result<Vec<(Lsn, LogRecord)>> {
    let path = dir.join(log_file_name(num));
    let data = fs::read(&path)?;
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        match codec::decode_framed::<LogRecord>(&data[offset..]) {
            Ok(Some((record, used))) => {
                out.push((Lsn::new(num, offset as u64), record));
                offset += used;
            },
            Ok(None) => break,
            Err(e) => {
                warn!(file = num, offset, error = %e, "log file ends in a torn record");
                break;
            },
        }
    }
    Ok(out)
}

/// Every record at or after `from`, across all files in `dir`.
pub fn read_log(dir: &Path, from: Lsn) -> Result<Vec<(Lsn, LogRecord)>> {
    let mut out = Vec::new();
    for num in list_log_files(dir)? {
        if num < from.file {
            continue;
        }
        out.extend(read_log_file(dir, num)?.into_iter().filter(|(lsn, _)| *lsn >= from));
    }
    Ok(out)
}

struct LogState {
    file: File,
    num: u32,
    offset: u64,
    /// End of the file's header records.
    header_end: u64,
    last_lsn: Lsn,
    /// Records were appended since the last sync.
    unsynced: bool,
}

/// The open log.
pub(crate) struct Log {
    dir: PathBuf,
    env: Arc<Env>,
    state: Mutex<LogState>,
    /// Open backup cursors; file removal waits for zero.
    backup_pins: AtomicUsize,
    written: AtomicU64,
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log").field("dir", &self.dir).finish()
    }
}

impl Log {
    /// Opens the log in `dir`, starting a new file after any existing ones.
    pub fn open(dir: &Path, env: Arc<Env>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let existing = list_log_files(dir)?;
        let num = existing.last().map_or(1, |n| n + 1);
        let prev_lsn = match existing.last() {
            Some(&last) => read_log_file(dir, last)?.last().map_or(Lsn::new(last, 0), |(lsn, _)| *lsn),
            None => Lsn::default(),
        };
        let file = create_file(dir, &env, num)?;
        let log = Self {
            dir: dir.to_path_buf(),
            env,
            state: Mutex::new(LogState { file, num, offset: 0, header_end: 0, last_lsn: prev_lsn, unsynced: false }),
            backup_pins: AtomicUsize::new(0),
            written: AtomicU64::new(0),
        };
        {
            let mut st = log.state.lock();
            log.init_file(&mut st)?;
        }
        info!(dir = %dir.display(), file = num, "log opened");
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the header records of the file just installed in `st`.
    fn init_file(&self, st: &mut LogState) -> Result<()> {
        st.offset = 0;
        let prev = st.last_lsn;
        self.write_locked(st, &LogRecord::FileHeader { version: LOG_VERSION, file_num: st.num })?;
        self.write_locked(st, &LogRecord::System { prev_lsn: prev })?;
        st.header_end = st.offset;
        st.file.sync_all()?;
        st.unsynced = false;
        if self.env.config().log.prealloc {
            self.preallocate(st.num + 1)?;
        }
        Ok(())
    }

    /// Creates `CellarPreplog.<num>` ahead of the switch that will use it.
    fn preallocate(&self, num: u32) -> Result<()> {
        let path = self.dir.join(preplog_name(num));
        if path.exists() {
            return Ok(());
        }
        let cfg = self.env.config();
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        if cfg.log.zero_fill {
            zero_fill(&file, cfg.log.file_max)?;
        } else {
            file.set_len(cfg.log.file_max)?;
        }
        self.env.stats.incr(Stat::LogFilesCreated);
        debug!(file = num, "log file preallocated");
        Ok(())
    }

    fn write_locked(&self, st: &mut LogState, record: &LogRecord) -> Result<Lsn> {
        let frame = codec::encode_framed(record)?;
        let lsn = Lsn::new(st.num, st.offset);
        write_all_at_offset(&st.file, &frame, st.offset)?;
        st.offset += frame.len() as u64;
        st.last_lsn = lsn;
        st.unsynced = true;
        let bytes = frame.len() as u64;
        self.env.stats.add(Stat::LogBytesWritten, bytes);
        self.written.fetch_add(bytes, Ordering::Relaxed);
        metrics::record_log_write(bytes);
        Ok(lsn)
    }

    fn switch_locked(&self, st: &mut LogState) -> Result<u32> {
        st.file.sync_all()?;
        let next = st.num + 1;
        st.file = create_file(&self.dir, &self.env, next)?;
        st.num = next;
        self.init_file(st)?;
        metrics::record_log_switch();
        info!(file = next, "log switched");
        Ok(next)
    }

    /// Appends a record, switching files when it would not fit.
    pub fn append(&self, record: &LogRecord) -> Result<Lsn> {
        self.env.check_panic()?;
        let frame_len = codec::encode_framed(record)?.len() as u64;
        let file_max = self.env.config().log.file_max;
        let mut st = self.state.lock();
        // A file always takes at least one record after its header.
        if st.offset + frame_len > file_max && st.offset > st.header_end {
            self.switch_locked(&mut st)?;
        }
        self.write_locked(&mut st, record)
    }

    /// Makes appended records durable.
    pub fn flush(&self, method: SyncMethod) -> Result<()> {
        let mut st = self.state.lock();
        if !st.unsynced {
            return Ok(());
        }
        match method {
            SyncMethod::Fsync => st.file.sync_all()?,
            SyncMethod::Dsync => st.file.sync_data()?,
            SyncMethod::None => return Ok(()),
        }
        st.unsynced = false;
        self.env.stats.incr(Stat::LogSync);
        Ok(())
    }

    /// Starts a new file now. Returns its number; every earlier file is complete.
    pub fn force_switch(&self) -> Result<u32> {
        let mut st = self.state.lock();
        self.switch_locked(&mut st)
    }

    /// Position the next record will take.
    pub fn current_lsn(&self) -> Lsn {
        let st = self.state.lock();
        Lsn::new(st.num, st.offset)
    }

    /// Bytes appended since open.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn files(&self) -> Result<Vec<u32>> {
        list_log_files(&self.dir)
    }

    pub fn pin_backup(&self) {
        self.backup_pins.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin_backup(&self) {
        let _ = self.backup_pins.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Deletes files numbered below `num`, unless removal is disabled or a
    /// backup cursor is open. Returns the number removed.
    pub fn remove_before(&self, num: u32) -> Result<u32> {
        if !self.env.config().log.remove || self.backup_pins.load(Ordering::Acquire) > 0 {
            return Ok(0);
        }
        let current = self.state.lock().num;
        let mut removed = 0;
        for file in self.files()? {
            if file >= num || file >= current {
                break;
            }
            match fs::remove_file(self.dir.join(log_file_name(file))) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => return Err(Error::Io { source: e }),
            }
        }
        if removed > 0 {
            self.env.stats.add(Stat::LogFilesRemoved, u64::from(removed));
            debug!(removed, below = num, "log files removed");
        }
        Ok(removed)
    }
}

fn create_file(dir: &Path, env: &Env, num: u32) -> Result<File> {
    let path = dir.join(log_file_name(num));
    let prep = dir.join(preplog_name(num));
    if prep.exists() {
        fs::rename(&prep, &path)?;
        return Ok(OpenOptions::new().read(true).write(true).open(&path)?);
    }
    let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
    let cfg = env.config();
    if cfg.log.zero_fill {
        zero_fill(&file, cfg.log.file_max)?;
    }
    env.stats.incr(Stat::LogFilesCreated);
    Ok(file)
}

fn zero_fill(file: &File, len: u64) -> Result<()> {
    let zeros = vec![0u8; ZERO_FILL_CHUNK];
    let mut offset = 0u64;
    while offset < len {
        let take = (len - offset).min(ZERO_FILL_CHUNK as u64) as usize;
        write_all_at_offset(file, &zeros[..take], offset)?;
        offset += take as u64;
    }
    file.sync_all()?;
    Ok(())
}
