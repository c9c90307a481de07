//! Page images and cache accounting.
//!
//! A tree is a single-level index of leaf pages under a root. Leaves are
//! reconciled into [`LeafImage`]s, roots into [`RootImage`]s, and on the
//! page log a leaf may also be written as a [`DeltaImage`] against its
//! previous image. Images are postcard payloads inside checksummed blocks.

pub(crate) mod cache;
pub(crate) mod cell;

pub use cell::{Cell, PageDel, PrepareState, TimeWindow};
use serde::{Deserialize, Serialize};

use crate::{
    block::{BlockAddr, BlockKind, BlockStore, decode_block, encode_block},
    error::{Error, Result},
};

/// Maximum number of deltas applied on top of a full image when loading.
const MAX_DELTA_CHAIN: usize = 64;

/// Reconciled leaf page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafImage {
    /// Cells sorted by key.
    pub cells: Vec<(Vec<u8>, Cell)>,
}

/// Root entry describing one leaf page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootEntry {
    /// Smallest key the page covers.
    pub lower: Vec<u8>,
    /// Leaf block, or `None` for an empty page.
    pub addr: Option<BlockAddr>,
    /// Fast-truncate marker for the whole page.
    pub page_del: Option<PageDel>,
}

/// Reconciled tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootImage {
    pub entries: Vec<RootEntry>,
    /// Largest record number allocated (column stores).
    pub max_recno: u64,
}

/// Changes to a leaf relative to an earlier image of the same page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaImage {
    pub base: BlockAddr,
    /// Depth of this delta above the last full image.
    pub depth: u32,
    /// Per-key replacement cells; `None` removes the key.
    pub changes: Vec<(Vec<u8>, Option<Cell>)>,
}

/// Any decoded page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageImage {
    Leaf(LeafImage),
    Root(RootImage),
    Delta(DeltaImage),
}

impl PageImage {
    /// Encodes the image as a block.
    pub fn encode(&self, write_gen: u64) -> Result<Vec<u8>> {
        let (kind, payload) = match self {
            PageImage::Leaf(leaf) => (BlockKind::Leaf, postcard::to_allocvec(leaf)),
            PageImage::Root(root) => (BlockKind::Internal, postcard::to_allocvec(root)),
            PageImage::Delta(delta) => (BlockKind::Delta, postcard::to_allocvec(delta)),
        };
        let payload = payload.map_err(|e| Error::corrupt(format!("page encode: {e}")))?;
        Ok(encode_block(kind, write_gen, &payload))
    }

    /// Decodes a block, returning the image and its write generation.
    pub fn decode(block: &[u8]) -> Result<(Self, u64)> {
        let (header, payload) = decode_block(block)?;
        let image = match header.kind {
            BlockKind::Leaf => PageImage::Leaf(decode_payload(payload)?),
            BlockKind::Internal => PageImage::Root(decode_payload(payload)?),
            BlockKind::Delta => PageImage::Delta(decode_payload(payload)?),
        };
        Ok((image, header.write_gen))
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    postcard::from_bytes(payload).map_err(|e| Error::corrupt(format!("page decode: {e}")))
}

/// Reads a leaf, following delta chains back to a full image.
pub(crate) fn read_leaf(store: &dyn BlockStore, addr: &BlockAddr) -> Result<LeafImage> {
    let mut deltas = Vec::new();
    let mut next = *addr;
    let base = loop {
        let (image, _) = PageImage::decode(&store.read(&next)?)?;
        match image {
            PageImage::Leaf(leaf) => break leaf,
            PageImage::Delta(delta) => {
                if deltas.len() >= MAX_DELTA_CHAIN {
                    return Err(Error::corrupt("delta chain too long"));
                }
                next = delta.base;
                deltas.push(delta);
            },
            PageImage::Root(_) => return Err(Error::corrupt("expected leaf page, found root")),
        }
    };
    if deltas.is_empty() {
        return Ok(base);
    }
    let mut cells: std::collections::BTreeMap<Vec<u8>, Cell> = base.cells.into_iter().collect();
    for delta in deltas.into_iter().rev() {
        for (key, cell) in delta.changes {
            match cell {
                Some(cell) => cells.insert(key, cell),
                None => cells.remove(&key),
            };
        }
    }
    Ok(LeafImage { cells: cells.into_iter().collect() })
}

/// Reads a tree root.
pub(crate) fn read_root(store: &dyn BlockStore, addr: &BlockAddr) -> Result<RootImage> {
    match PageImage::decode(&store.read(addr)?)?.0 {
        PageImage::Root(root) => Ok(root),
        _ => Err(Error::corrupt("expected root page")),
    }
}
