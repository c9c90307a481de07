//! The metadata file (`cellar.meta`).
//!
//! The metadata file is the source of truth for schema, checkpoint roots,
//! the prepared catalog and everything else recovery needs. It is rewritten
//! as a whole at every checkpoint and schema change.
//!
//! # Crash Safety: Dual-Slot Commit
//!
//! The header holds TWO slots, each pointing at a postcard-encoded
//! [`MetaImage`] blob elsewhere in the file. A "god byte" selects the
//! primary slot. A commit writes the new blob where it cannot overlap the
//! primary blob, fills in the secondary slot, syncs, and then flips the god
//! byte and syncs again. A crash at any point leaves at least one slot whose
//! blob is intact.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     Magic ("CELLARMD")
//! 8       2     Format version
//! 10      5     Reserved
//! 15      1     God byte: bit 0 = primary slot, bit 1 = unclean shutdown
//! 16      40    Slot 0
//! 56      40    Slot 1
//! 96      32    Reserved
//! ```
//!
//! Each slot is `generation, blob offset, blob length, blob checksum,
//! slot checksum`, five little-endian u64s. The slot checksum covers the
//! first four fields.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use byteorder::{ByteOrder, LittleEndian};
use cellar_types::{TS_NONE, Timestamp, codec};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
    bitmap::ChunkBitmap,
    block::{BlockAddr, read_exact_at_offset, round_up, write_all_at_offset},
    error::{Error, Result},
    log::Lsn,
    schema::SchemaEntry,
    txn::PreparedCatalog,
};

/// Name of the metadata file inside the home directory.
pub const META_FILE: &str = "cellar.meta";

/// Header size in bytes.
pub const META_HEADER_SIZE: usize = 128;

/// Magic number for metadata files.
pub const META_MAGIC: &[u8; 8] = b"CELLARMD";

/// Current format version.
pub const META_VERSION: u16 = 1;

/// Name of the checkpoint every unnamed checkpoint replaces.
pub const DEFAULT_CHECKPOINT: &str = "WiredTigerCheckpoint";

const GOD_BYTE_OFFSET: usize = 15;
const GOD_BYTE_SLOT_MASK: u8 = 0x01;
const GOD_BYTE_UNCLEAN_MASK: u8 = 0x02;
const SLOT_OFFSET: usize = 16;

/// One checkpoint of one tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CheckpointRef {
    /// Root page; `None` for a tree that was empty.
    pub root: Option<BlockAddr>,
    /// Connection-wide checkpoint sequence number.
    pub order: u64,
    /// Timestamp the checkpoint was taken at (`TS_NONE` without timestamps).
    pub ts: Timestamp,
    pub write_gen: u64,
    /// File size when the checkpoint completed.
    pub file_size: u64,
    /// Wall-clock seconds since the epoch.
    pub time: i64,
}

/// Checkpoints of one tree, by name.
pub(crate) type TreeCheckpoints = BTreeMap<String, CheckpointRef>;

/// Persisted live-restore progress for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RestoreProgress {
    pub chunk_size: u64,
    pub source_len: u64,
    pub bitmap: ChunkBitmap,
}

/// Everything the metadata file records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MetaImage {
    /// Schema entries by URI.
    pub schema: BTreeMap<String, SchemaEntry>,
    pub next_btree_id: u64,
    /// Checkpoints by btree id (the history store included).
    pub checkpoints: BTreeMap<u64, TreeCheckpoints>,
    /// Every transaction id below this belongs to an earlier run.
    pub txn_id_base: u64,
    pub write_gen: u64,
    pub ckpt_order: u64,
    /// Log position recovery replays from.
    pub ckpt_lsn: Option<Lsn>,
    /// Log file numbers at each retained checkpoint, newest last.
    pub ckpt_log_files: Vec<u32>,
    pub stable_ts: Timestamp,
    pub oldest_ts: Timestamp,
    pub last_ckpt_ts: Timestamp,
    /// Prepared transactions captured by the last checkpoint.
    pub prepared: PreparedCatalog,
    /// Live-restore progress by file name; empty once restore completes.
    pub live_restore: BTreeMap<String, RestoreProgress>,
    /// Identity of the last checkpoint published to (or loaded from) the page log.
    pub disagg_checkpoint: u64,
}

impl MetaImage {
    /// Named checkpoint of one tree.
    pub fn checkpoint(&self, btree_id: u64, name: &str) -> Option<&CheckpointRef> {
        self.checkpoints.get(&btree_id).and_then(|c| c.get(name))
    }

    /// Newest checkpoint of one tree.
    pub fn latest(&self, btree_id: u64) -> Option<&CheckpointRef> {
        self.checkpoints.get(&btree_id).and_then(|c| c.values().max_by_key(|r| r.order))
    }

    /// True when any tree has a checkpoint called `name`.
    pub fn has_checkpoint(&self, name: &str) -> bool {
        self.checkpoints.values().any(|c| c.contains_key(name))
    }

    pub fn timestamps_set(&self) -> bool {
        self.stable_ts != TS_NONE || self.oldest_ts != TS_NONE
    }
}

/// A step of the metadata commit protocol, reported to the crash hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStep {
    /// The image blob is about to be written.
    BlobWrite,
    /// A header write (secondary slot, then god byte) is about to happen.
    HeaderWrite,
    /// An fsync is about to happen.
    Sync,
}

/// Crash hook: returning `true` abandons the commit at that step, leaving
/// the file exactly as a crash would.
pub type MetaHook = Arc<dyn Fn(MetaStep) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MetaSlot {
    generation: u64,
    offset: u64,
    len: u64,
    image_checksum: u64,
    checksum: u64,
}

impl MetaSlot {
    const SIZE: usize = 40;
    const CHECKSUMMED_SIZE: usize = 32;

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.generation);
        LittleEndian::write_u64(&mut buf[8..16], self.offset);
        LittleEndian::write_u64(&mut buf[16..24], self.len);
        LittleEndian::write_u64(&mut buf[24..32], self.image_checksum);
        let checksum = xxh3_64(&buf[0..Self::CHECKSUMMED_SIZE]);
        LittleEndian::write_u64(&mut buf[32..40], checksum);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            generation: LittleEndian::read_u64(&buf[0..8]),
            offset: LittleEndian::read_u64(&buf[8..16]),
            len: LittleEndian::read_u64(&buf[16..24]),
            image_checksum: LittleEndian::read_u64(&buf[24..32]),
            checksum: LittleEndian::read_u64(&buf[32..40]),
        }
    }

    fn is_valid(&self) -> bool {
        self.len > 0 && self.checksum == xxh3_64(&self.to_bytes()[0..Self::CHECKSUMMED_SIZE])
    }

    fn end(&self) -> u64 {
        self.offset + self.len
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MetaHeader {
    god_byte: u8,
    slots: [MetaSlot; 2],
}

impl MetaHeader {
    fn primary(&self) -> usize {
        (self.god_byte & GOD_BYTE_SLOT_MASK) as usize
    }

    fn unclean(&self) -> bool {
        self.god_byte & GOD_BYTE_UNCLEAN_MASK != 0
    }

    fn to_bytes(self) -> [u8; META_HEADER_SIZE] {
        let mut buf = [0u8; META_HEADER_SIZE];
        buf[0..8].copy_from_slice(META_MAGIC);
        LittleEndian::write_u16(&mut buf[8..10], META_VERSION);
        buf[GOD_BYTE_OFFSET] = self.god_byte;
        for (i, slot) in self.slots.iter().enumerate() {
            let at = SLOT_OFFSET + i * MetaSlot::SIZE;
            buf[at..at + MetaSlot::SIZE].copy_from_slice(&slot.to_bytes());
        }
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_HEADER_SIZE || &buf[0..8] != META_MAGIC {
            return Err(Error::corrupt("metadata file: bad magic"));
        }
        let version = LittleEndian::read_u16(&buf[8..10]);
        if version > META_VERSION {
            return Err(Error::corrupt(format!("metadata file: unsupported version {version}")));
        }
        let slot = |i: usize| {
            let at = SLOT_OFFSET + i * MetaSlot::SIZE;
            MetaSlot::from_bytes(&buf[at..at + MetaSlot::SIZE])
        };
        Ok(Self { god_byte: buf[GOD_BYTE_OFFSET], slots: [slot(0), slot(1)] })
    }
}

/// The open metadata file.
pub(crate) struct MetaFile {
    file: File,
    path: PathBuf,
    header: MetaHeader,
    hook: Option<MetaHook>,
}

impl std::fmt::Debug for MetaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaFile").field("path", &self.path).field("god_byte", &self.header.god_byte).finish()
    }
}

impl MetaFile {
    /// Creates an empty metadata file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        let header = MetaHeader::default();
        write_all_at_offset(&file, &header.to_bytes(), 0)?;
        file.sync_all()?;
        Ok(Self { file, path: path.to_path_buf(), header, hook: None })
    }

    /// Opens an existing metadata file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; META_HEADER_SIZE];
        read_exact_at_offset(&file, &mut buf, 0)?;
        let header = MetaHeader::from_bytes(&buf)?;
        Ok(Self { file, path: path.to_path_buf(), header, hook: None })
    }

    pub fn set_hook(&mut self, hook: Option<MetaHook>) {
        self.hook = hook;
    }

    /// True when the last run did not close cleanly.
    pub fn unclean(&self) -> bool {
        self.header.unclean()
    }

    /// Reads the newest intact image; `None` for a file never committed to.
    pub fn read(&self) -> Result<Option<MetaImage>> {
        let primary = self.header.primary();
        let order = [primary, 1 - primary];
        let mut saw_slot = false;
        for index in order {
            let slot = self.header.slots[index];
            if slot.len == 0 {
                continue;
            }
            saw_slot = true;
            if !slot.is_valid() {
                warn!(slot = index, "metadata slot checksum mismatch");
                continue;
            }
            match self.read_blob(&slot) {
                Ok(image) => {
                    if index != primary {
                        warn!(slot = index, "recovered metadata from secondary slot");
                    }
                    return Ok(Some(image));
                },
                Err(e) => warn!(slot = index, error = %e, "metadata image unreadable"),
            }
        }
        if saw_slot { Err(Error::corrupt("metadata file: no intact slot")) } else { Ok(None) }
    }

    fn read_blob(&self, slot: &MetaSlot) -> Result<MetaImage> {
        let mut buf = vec![0u8; slot.len as usize];
        read_exact_at_offset(&self.file, &mut buf, slot.offset)?;
        if xxh3_64(&buf) != slot.image_checksum {
            return Err(Error::corrupt("metadata image checksum mismatch"));
        }
        Ok(codec::decode(&buf)?)
    }

    fn step(&self, step: MetaStep) -> Result<()> {
        match &self.hook {
            Some(hook) if hook(step) => Err(Error::Io {
                source: std::io::Error::other(format!("injected crash at {step:?}")),
            }),
            _ => Ok(()),
        }
    }

    fn sync(&self) -> Result<()> {
        self.step(MetaStep::Sync)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Durably replaces the image.
    pub fn commit(&mut self, image: &MetaImage) -> Result<()> {
        let blob = codec::encode(image)?;
        let primary = self.header.slots[self.header.primary()];
        let start = META_HEADER_SIZE as u64;
        let offset = if !primary.is_valid() || start + blob.len() as u64 <= primary.offset {
            start
        } else {
            round_up(primary.end(), 512)
        };
        let slot = MetaSlot::from_bytes(
            &MetaSlot {
                generation: primary.generation + 1,
                offset,
                len: blob.len() as u64,
                image_checksum: xxh3_64(&blob),
                checksum: 0,
            }
            .to_bytes(),
        );

        self.step(MetaStep::BlobWrite)?;
        write_all_at_offset(&self.file, &blob, offset)?;

        let mut next = self.header;
        next.slots[1 - next.primary()] = slot;
        self.step(MetaStep::HeaderWrite)?;
        write_all_at_offset(&self.file, &next.to_bytes(), 0)?;
        self.sync()?;

        next.god_byte ^= GOD_BYTE_SLOT_MASK;
        self.step(MetaStep::HeaderWrite)?;
        write_all_at_offset(&self.file, &[next.god_byte], GOD_BYTE_OFFSET as u64)?;
        self.sync()?;
        self.header = next;

        // The previous image is now the fallback and must survive.
        let end = if primary.is_valid() { slot.end().max(primary.end()) } else { slot.end() };
        if self.file.metadata()?.len() > end {
            self.file.set_len(end)?;
        }
        debug!(generation = slot.generation, bytes = blob.len(), "metadata committed");
        Ok(())
    }

    /// Sets or clears the unclean-shutdown flag.
    pub fn set_unclean(&mut self, unclean: bool) -> Result<()> {
        let mut god = self.header.god_byte;
        if unclean {
            god |= GOD_BYTE_UNCLEAN_MASK;
        } else {
            god &= !GOD_BYTE_UNCLEAN_MASK;
        }
        if god == self.header.god_byte {
            return Ok(());
        }
        write_all_at_offset(&self.file, &[god], GOD_BYTE_OFFSET as u64)?;
        self.file.sync_data()?;
        self.header.god_byte = god;
        Ok(())
    }
}

/// Metadata storage: a file, or nothing for in-memory connections.
#[derive(Debug)]
pub(crate) enum MetaStore {
    File(MetaFile),
    Memory,
}

impl MetaStore {
    pub fn commit(&mut self, image: &MetaImage) -> Result<()> {
        match self {
            MetaStore::File(file) => file.commit(image),
            MetaStore::Memory => Ok(()),
        }
    }

    pub fn set_unclean(&mut self, unclean: bool) -> Result<()> {
        match self {
            MetaStore::File(file) => file.set_unclean(unclean),
            MetaStore::Memory => Ok(()),
        }
    }

    pub fn set_hook(&mut self, hook: Option<MetaHook>) {
        if let MetaStore::File(file) = self {
            file.set_hook(hook);
        }
    }
}
