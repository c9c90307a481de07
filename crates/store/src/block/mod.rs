//! Block manager.
//!
//! Reconciled pages are written as self-describing, checksummed blocks.
//! A block store hands back a [`BlockAddr`] (offset, size, checksum) that
//! parents and checkpoint metadata use to find the block again.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     Magic ("CBLK")
//! 4       1     Block kind (BlockKind)
//! 5       1     Flags (reserved)
//! 6       2     Reserved
//! 8       8     Write generation of the page
//! 16      4     Payload length
//! 20      4     XXH3-64 of the payload, truncated to 32 bits
//! 24      ..    Payload (postcard page image)
//! ```
//!
//! Three stores implement [`BlockStore`]:
//! - [`FileBlockStore`]: one file per tree with an extent allocator
//! - [`MemBlockStore`]: in-memory connections and layered ingest tables
//! - the page-log store in the disaggregated module

mod extent;
mod file;
mod memory;
mod restore;

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use cellar_types::codec::checksum32;
pub(crate) use extent::ExtentAllocator;
pub(crate) use file::{FileBlockStore, PlainFile, read_exact_at_offset, write_all_at_offset};
pub(crate) use memory::MemBlockStore;
pub(crate) use restore::{RestoreSource, RestoreTracker, RestoringFile};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Block magic ("CBLK").
pub const BLOCK_MAGIC: u32 = 0x4342_4c4b;

/// Size of the block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Address of a block inside its store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockAddr {
    /// Byte offset for file stores; block or page id for the others.
    pub offset: u64,
    /// Unpadded block length.
    pub size: u32,
    /// Checksum of the whole block.
    pub checksum: u32,
    /// Page-log sequence number (zero outside disaggregated storage).
    pub lsn: u64,
}

impl BlockAddr {
    /// Byte range covered on disk once padded to `unit`.
    pub fn extent(&self, unit: u64) -> (u64, u64) {
        (self.offset, round_up(u64::from(self.size), unit))
    }
}

/// Kind of page stored in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    /// Row or column leaf page.
    Leaf = 1,
    /// Tree root listing child pages.
    Internal = 2,
    /// Leaf delta against an earlier image (page log only).
    Delta = 3,
}

impl TryFrom<u8> for BlockKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(BlockKind::Leaf),
            2 => Ok(BlockKind::Internal),
            3 => Ok(BlockKind::Delta),
            other => Err(Error::corrupt(format!("invalid block kind: {other}"))),
        }
    }
}

/// Decoded block header.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    /// Page kind.
    pub kind: BlockKind,
    /// Reserved flag bits.
    pub flags: u8,
    /// Write generation stamped at reconciliation.
    pub write_gen: u64,
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Payload checksum.
    pub checksum: u32,
}

/// Builds a block from a page payload.
pub fn encode_block(kind: BlockKind, write_gen: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    // Writes into a Vec cannot fail.
    let _ = write_header(&mut buf, kind, write_gen, payload);
    buf.extend_from_slice(payload);
    buf
}

fn write_header(buf: &mut Vec<u8>, kind: BlockKind, write_gen: u64, payload: &[u8]) -> std::io::Result<()> {
    buf.write_u32::<BigEndian>(BLOCK_MAGIC)?;
    buf.write_u8(kind as u8)?;
    buf.write_u8(0)?;
    buf.write_u16::<BigEndian>(0)?;
    buf.write_u64::<BigEndian>(write_gen)?;
    buf.write_u32::<BigEndian>(payload.len() as u32)?;
    buf.write_u32::<BigEndian>(checksum32(payload))
}

/// Parses and validates a block, returning the header and payload.
///
/// # Errors
///
/// Returns [`Error::Corruption`] on a bad magic, truncated payload or
/// payload checksum mismatch.
pub fn decode_block(block: &[u8]) -> Result<(BlockHeader, &[u8])> {
    if block.len() < BLOCK_HEADER_SIZE {
        return Err(Error::corrupt("block shorter than its header"));
    }
    let mut rd = Cursor::new(block);
    let header = read_header(&mut rd).map_err(|e| Error::corrupt(format!("block header: {e}")))?;
    if header.0 != BLOCK_MAGIC {
        return Err(Error::corrupt(format!("bad block magic {:#x}", header.0)));
    }
    let header = header.1;
    let end = BLOCK_HEADER_SIZE + header.payload_len as usize;
    if block.len() < end {
        return Err(Error::corrupt("block payload truncated"));
    }
    let payload = &block[BLOCK_HEADER_SIZE..end];
    if checksum32(payload) != header.checksum {
        return Err(Error::corrupt("block payload checksum mismatch"));
    }
    Ok((header, payload))
}

fn read_header(rd: &mut Cursor<&[u8]>) -> std::io::Result<(u32, BlockHeader)> {
    let magic = rd.read_u32::<BigEndian>()?;
    let kind = rd.read_u8()?;
    let flags = rd.read_u8()?;
    let _reserved = rd.read_u16::<BigEndian>()?;
    let write_gen = rd.read_u64::<BigEndian>()?;
    let payload_len = rd.read_u32::<BigEndian>()?;
    let checksum = rd.read_u32::<BigEndian>()?;
    let kind = BlockKind::try_from(kind)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    Ok((magic, BlockHeader { kind, flags, write_gen, payload_len, checksum }))
}

/// Storage for reconciled page blocks.
pub(crate) trait BlockStore: Send + Sync {
    /// Writes a block, returning its address. `prev` is the block this one
    /// replaces, which lets delta-capable stores write a delta instead.
    fn write(&self, block: &[u8], prev: Option<&BlockAddr>) -> Result<BlockAddr>;

    /// Reads a block and verifies its checksum.
    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>>;

    /// Makes written blocks durable.
    fn sync(&self) -> Result<()>;

    /// Current size of the underlying storage in bytes.
    fn size(&self) -> Result<u64>;

    /// Allocation granularity.
    fn allocation_size(&self) -> u64 {
        1
    }

    /// Starts tracking allocations so a following [`reclaim`](Self::reclaim)
    /// does not free blocks written while the live set was being collected.
    fn begin_reclaim(&self) {}

    /// Frees every block not in `live`.
    fn reclaim(&self, _live: &[BlockAddr]) -> Result<()> {
        Ok(())
    }

    /// Bytes currently free for reuse.
    fn free_bytes(&self) -> u64 {
        0
    }

    /// True when `addr` could move to a lower free extent.
    fn relocatable(&self, _addr: &BlockAddr) -> bool {
        false
    }

    /// Shrinks storage by dropping trailing free space. Returns bytes released.
    fn truncate_tail(&self) -> Result<u64> {
        Ok(0)
    }

    /// Lists every readable block, for salvage.
    fn scan(&self) -> Result<Vec<BlockAddr>> {
        Err(Error::unsupported("block scan"))
    }

    /// True for stores shared between nodes (page log).
    fn is_shared(&self) -> bool {
        false
    }

    /// Number of leaf deltas written since open.
    fn deltas_written(&self) -> u64 {
        0
    }
}

/// Random-access file used underneath a [`FileBlockStore`].
pub(crate) trait RawFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn write_at(&self, data: &[u8], offset: u64) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn set_len(&self, len: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

impl<T: RawFile + ?Sized> RawFile for std::sync::Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        (**self).read_at(buf, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<()> {
        (**self).write_at(data, offset)
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn set_len(&self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Rounds `value` up to a multiple of `unit`.
pub fn round_up(value: u64, unit: u64) -> u64 {
    if unit <= 1 { value } else { value.div_ceil(unit) * unit }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_block_header_round_trip() {
        let block = encode_block(BlockKind::Leaf, 42, b"payload");
        assert_eq!(block.len(), BLOCK_HEADER_SIZE + 7);
        let (header, payload) = decode_block(&block).unwrap();
        assert_eq!(header.kind, BlockKind::Leaf);
        assert_eq!(header.write_gen, 42);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let mut block = encode_block(BlockKind::Internal, 1, b"root entries");
        block[BLOCK_HEADER_SIZE + 2] ^= 0xFF;
        assert!(matches!(decode_block(&block), Err(Error::Corruption { .. })));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut block = encode_block(BlockKind::Leaf, 1, b"abc");
        block[0] = 0;
        assert!(decode_block(&block).is_err());
        let block = encode_block(BlockKind::Leaf, 1, b"abc");
        assert!(decode_block(&block[..BLOCK_HEADER_SIZE + 1]).is_err());
        assert!(decode_block(&block[..4]).is_err());
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
        assert_eq!(round_up(7, 1), 7);
    }
}
