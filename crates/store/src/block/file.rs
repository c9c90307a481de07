//! File-backed block store using position-based I/O (`pread`/`pwrite`).
//!
//! The first allocation unit of every tree file holds a descriptor
//! (magic, version, allocation size). Blocks follow, each padded to the
//! allocation unit. Reads never take a lock; writes serialize through
//! `write_lock` so file extension and `pwrite` do not interleave.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use cellar_types::codec::checksum32;
use parking_lot::Mutex;

use super::{
    BLOCK_HEADER_SIZE, BlockAddr, BlockStore, ExtentAllocator, RawFile, decode_block, round_up,
};
use crate::error::{Error, Result};

/// Tree file magic.
pub const FILE_MAGIC: &[u8; 8] = b"CELLARBF";

/// Tree file format version.
pub const FILE_VERSION: u16 = 1;

/// A plain file on the local filesystem.
#[derive(Debug)]
pub(crate) struct PlainFile {
    file: File,
    path: PathBuf,
}

impl PlainFile {
    /// Opens (or creates) the file at `path`.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(create).open(path)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawFile for PlainFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        read_exact_at_offset(&self.file, buf, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        write_all_at_offset(&self.file, data, offset)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Block store over a single tree file.
pub(crate) struct FileBlockStore {
    file: Box<dyn RawFile>,
    alloc: ExtentAllocator,
    /// Serializes writes and file-length changes.
    write_lock: Mutex<()>,
    unit: u64,
    name: String,
}

impl FileBlockStore {
    /// Initializes a new tree file, writing its descriptor.
    pub fn create(file: Box<dyn RawFile>, unit: u64, name: &str) -> Result<Self> {
        if !unit.is_power_of_two() || unit < 512 {
            return Err(Error::invalid(format!("invalid allocation size: {unit}")));
        }
        let mut desc = vec![0u8; unit as usize];
        desc[0..8].copy_from_slice(FILE_MAGIC);
        desc[8..10].copy_from_slice(&FILE_VERSION.to_le_bytes());
        desc[10..14].copy_from_slice(&(unit as u32).to_le_bytes());
        let sum = checksum32(&desc[0..14]);
        desc[14..18].copy_from_slice(&sum.to_le_bytes());
        file.set_len(0)?;
        file.write_at(&desc, 0)?;
        file.sync()?;
        Ok(Self {
            file,
            alloc: ExtentAllocator::new(unit, unit, unit),
            write_lock: Mutex::new(()),
            unit,
            name: name.to_string(),
        })
    }

    /// Opens an existing tree file.
    ///
    /// The free map starts empty; the caller rebuilds it with
    /// [`BlockStore::reclaim`] once the reachable blocks are known.
    pub fn open(file: Box<dyn RawFile>, name: &str) -> Result<Self> {
        let mut desc = [0u8; 18];
        file.read_at(&mut desc, 0)
            .map_err(|_| Error::corrupt(format!("{name}: missing file descriptor")))?;
        if &desc[0..8] != FILE_MAGIC {
            return Err(Error::corrupt(format!("{name}: not a cellar tree file")));
        }
        let version = u16::from_le_bytes([desc[8], desc[9]]);
        if version > FILE_VERSION {
            return Err(Error::corrupt(format!("{name}: unsupported file version {version}")));
        }
        let unit = u64::from(u32::from_le_bytes([desc[10], desc[11], desc[12], desc[13]]));
        let stored = u32::from_le_bytes([desc[14], desc[15], desc[16], desc[17]]);
        if stored != checksum32(&desc[0..14]) || !unit.is_power_of_two() {
            return Err(Error::corrupt(format!("{name}: file descriptor checksum mismatch")));
        }
        let end = round_up(file.len()?, unit).max(unit);
        Ok(Self {
            file,
            alloc: ExtentAllocator::new(unit, unit, end),
            write_lock: Mutex::new(()),
            unit,
            name: name.to_string(),
        })
    }
}

impl BlockStore for FileBlockStore {
    fn write(&self, block: &[u8], _prev: Option<&BlockAddr>) -> Result<BlockAddr> {
        let padded = round_up(block.len() as u64, self.unit);
        let offset = self.alloc.alloc(padded);
        let mut buf = Vec::with_capacity(padded as usize);
        buf.extend_from_slice(block);
        buf.resize(padded as usize, 0);

        let _guard = self.write_lock.lock();
        self.file.write_at(&buf, offset)?;
        Ok(BlockAddr { offset, size: block.len() as u32, checksum: checksum32(block), lsn: 0 })
    }

    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; addr.size as usize];
        self.file.read_at(&mut buf, addr.offset).map_err(|e| {
            Error::corrupt(format!("{}: read of block at {} failed: {e}", self.name, addr.offset))
        })?;
        if checksum32(&buf) != addr.checksum {
            return Err(Error::corrupt(format!(
                "{}: block at offset {} size {} checksum mismatch",
                self.name, addr.offset, addr.size
            )));
        }
        Ok(buf)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    fn size(&self) -> Result<u64> {
        self.file.len()
    }

    fn allocation_size(&self) -> u64 {
        self.unit
    }

    fn begin_reclaim(&self) {
        self.alloc.track();
    }

    fn reclaim(&self, live: &[BlockAddr]) -> Result<()> {
        let extents: Vec<(u64, u64)> = live.iter().map(|a| a.extent(self.unit)).collect();
        self.alloc.rebuild(&extents);
        Ok(())
    }

    fn free_bytes(&self) -> u64 {
        self.alloc.free_bytes()
    }

    fn relocatable(&self, addr: &BlockAddr) -> bool {
        let (offset, len) = addr.extent(self.unit);
        self.alloc.fits_below(offset, len)
    }

    fn truncate_tail(&self) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let before = self.file.len()?;
        let end = self.alloc.trim_tail().unwrap_or_else(|| self.alloc.end());
        if end < before {
            self.file.set_len(end)?;
            return Ok(before - end);
        }
        Ok(0)
    }

    fn scan(&self) -> Result<Vec<BlockAddr>> {
        let len = self.file.len()?;
        let mut found = Vec::new();
        let mut offset = self.unit;
        let mut header = vec![0u8; BLOCK_HEADER_SIZE];
        while offset + BLOCK_HEADER_SIZE as u64 <= len {
            self.file.read_at(&mut header, offset)?;
            let payload_len = u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
            let size = BLOCK_HEADER_SIZE as u64 + u64::from(payload_len);
            if offset + size <= len {
                let mut block = vec![0u8; size as usize];
                self.file.read_at(&mut block, offset)?;
                if decode_block(&block).is_ok() {
                    found.push(BlockAddr {
                        offset,
                        size: size as u32,
                        checksum: checksum32(&block),
                        lsn: 0,
                    });
                    offset += round_up(size, self.unit);
                    continue;
                }
            }
            offset += self.unit;
        }
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub(crate) fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::block::{BlockKind, encode_block};

    fn store(dir: &Path) -> FileBlockStore {
        let file = PlainFile::open(&dir.join("t.cdb"), true).unwrap();
        FileBlockStore::create(Box::new(file), 512, "t.cdb").unwrap()
    }

    #[test]
    fn test_write_read_block() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let block = encode_block(BlockKind::Leaf, 1, &[7u8; 700]);
        let addr = store.write(&block, None).unwrap();
        assert_eq!(addr.offset, 512);
        assert_eq!(store.read(&addr).unwrap(), block);
        assert_eq!(store.size().unwrap(), 512 + 1024);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let block = encode_block(BlockKind::Leaf, 1, b"abc");
        let mut addr = store.write(&block, None).unwrap();
        addr.checksum ^= 1;
        assert!(matches!(store.read(&addr), Err(Error::Corruption { .. })));
    }

    #[test]
    fn test_reopen_reads_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let addr = {
            let store = store(dir.path());
            let addr = store.write(&encode_block(BlockKind::Leaf, 3, b"persisted"), None).unwrap();
            store.sync().unwrap();
            addr
        };
        let file = PlainFile::open(&dir.path().join("t.cdb"), false).unwrap();
        let store = FileBlockStore::open(Box::new(file), "t.cdb").unwrap();
        assert_eq!(store.allocation_size(), 512);
        let (_, payload) = decode_block(&store.read(&addr).unwrap()).map(|(h, p)| (h, p.to_vec())).unwrap();
        assert_eq!(payload, b"persisted");
    }

    #[test]
    fn test_reclaim_and_truncate_shrinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let keep = store.write(&encode_block(BlockKind::Leaf, 1, b"keep"), None).unwrap();
        for _ in 0..8 {
            store.write(&encode_block(BlockKind::Leaf, 1, b"garbage"), None).unwrap();
        }
        assert_eq!(store.size().unwrap(), 512 * 10);
        store.reclaim(&[keep]).unwrap();
        assert_eq!(store.free_bytes(), 512 * 8);
        assert_eq!(store.truncate_tail().unwrap(), 512 * 8);
        assert_eq!(store.size().unwrap(), 1024);
        assert!(store.read(&keep).is_ok());
    }

    #[test]
    fn test_scan_finds_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let a = store.write(&encode_block(BlockKind::Leaf, 1, &[1u8; 600]), None).unwrap();
        let b = store.write(&encode_block(BlockKind::Internal, 1, b"root"), None).unwrap();
        let found = store.scan().unwrap();
        assert_eq!(found, vec![a, b]);
    }
}
