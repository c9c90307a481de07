//! Files that migrate from a restore source while in use.
//!
//! A [`RestoringFile`] starts as a sparse destination file the size of its
//! source. Each chunk is read from the source until it has been copied;
//! any write to an unmigrated chunk copies the chunk first so the write
//! never mixes with stale source bytes. Background migration and
//! foreground writes share one [`RestoreTracker`] bitmap.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use super::{
    RawFile,
    file::{PlainFile, read_exact_at_offset},
};
use crate::{bitmap::ChunkBitmap, error::Result};

/// Directory holding the backup being restored.
#[derive(Debug, Clone)]
pub(crate) struct RestoreSource {
    root: PathBuf,
}

impl RestoreSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens a source file read-only; `None` when it does not exist.
    pub fn open(&self, name: &str) -> Result<Option<File>> {
        let path = self.root.join(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(File::open(path)?))
    }
}

/// Migration progress for one file.
#[derive(Debug)]
pub(crate) struct RestoreTracker {
    bitmap: Mutex<ChunkBitmap>,
    chunk_size: u64,
    source_len: u64,
}

impl RestoreTracker {
    pub fn new(bitmap: ChunkBitmap, chunk_size: u64, source_len: u64) -> Self {
        Self { bitmap: Mutex::new(bitmap), chunk_size, source_len }
    }

    pub fn snapshot(&self) -> ChunkBitmap {
        self.bitmap.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.lock().is_complete()
    }

    pub fn migrated(&self) -> u64 {
        self.bitmap.lock().count()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }
}

/// A destination file that falls back to its source for unmigrated chunks.
pub(crate) struct RestoringFile {
    dest: PlainFile,
    source: Option<File>,
    tracker: Arc<RestoreTracker>,
}

impl RestoringFile {
    /// Wraps `dest`, sizing it to the source on first use.
    pub fn new(dest: PlainFile, source: Option<File>, tracker: Arc<RestoreTracker>) -> Result<Self> {
        if dest.len()? < tracker.source_len {
            dest.set_len(tracker.source_len)?;
        }
        Ok(Self { dest, source, tracker })
    }

    pub fn tracker(&self) -> &Arc<RestoreTracker> {
        &self.tracker
    }

    /// Copies the next unmigrated chunk. Returns false once the file is complete.
    pub fn migrate_next(&self) -> Result<bool> {
        let next = self.tracker.bitmap.lock().next_unset(0);
        match next {
            Some(chunk) => {
                self.migrate_chunk(chunk)?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn migrate_chunk(&self, chunk: u64) -> Result<()> {
        let mut bitmap = self.tracker.bitmap.lock();
        if bitmap.is_set(chunk) {
            return Ok(());
        }
        let start = chunk * self.tracker.chunk_size;
        let end = (start + self.tracker.chunk_size).min(self.tracker.source_len);
        if end > start {
            let mut buf = vec![0u8; (end - start) as usize];
            if let Some(source) = &self.source {
                read_exact_at_offset(source, &mut buf, start)?;
            }
            self.dest.write_at(&buf, start)?;
        }
        bitmap.set(chunk);
        Ok(())
    }

    fn chunks(&self, offset: u64, len: u64) -> std::ops::RangeInclusive<u64> {
        let size = self.tracker.chunk_size;
        offset / size..=(offset + len.max(1) - 1) / size
    }
}

impl RawFile for RestoringFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let size = self.tracker.chunk_size;
        let mut done = 0usize;
        for chunk in self.chunks(offset, buf.len() as u64) {
            let pos = offset + done as u64;
            let chunk_end = (chunk + 1) * size;
            let take = ((chunk_end - pos) as usize).min(buf.len() - done);
            let part = &mut buf[done..done + take];
            let migrated = self.tracker.bitmap.lock().is_set(chunk);
            match (&self.source, migrated) {
                (Some(source), false) if pos + take as u64 <= self.tracker.source_len => {
                    read_exact_at_offset(source, part, pos)?;
                },
                _ => self.dest.read_at(part, pos)?,
            }
            done += take;
        }
        Ok(())
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        for chunk in self.chunks(offset, data.len() as u64) {
            self.migrate_chunk(chunk)?;
        }
        self.dest.write_at(data, offset)
    }

    fn len(&self) -> Result<u64> {
        self.dest.len()
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.dest.set_len(len)
    }

    fn sync(&self) -> Result<()> {
        self.dest.sync()
    }
}
