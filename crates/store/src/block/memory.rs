//! In-memory block store.
//!
//! Used for `in_memory` connections and for the ingest side of layered
//! tables. Blocks live in a map keyed by a monotonically increasing id and
//! are dropped by [`BlockStore::reclaim`] once nothing references them.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use cellar_types::codec::checksum32;
use parking_lot::RwLock;

use super::{BlockAddr, BlockStore};
use crate::error::{Error, Result};

/// Block store that keeps every block in memory.
#[derive(Debug, Default)]
pub(crate) struct MemBlockStore {
    blocks: RwLock<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
    /// Ids written since reclaim tracking started.
    recent: RwLock<Option<Vec<u64>>>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), ..Self::default() }
    }

    /// Number of blocks currently held.
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

impl BlockStore for MemBlockStore {
    fn write(&self, block: &[u8], _prev: Option<&BlockAddr>) -> Result<BlockAddr> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.blocks.write().insert(id, block.to_vec());
        if let Some(recent) = self.recent.write().as_mut() {
            recent.push(id);
        }
        Ok(BlockAddr { offset: id, size: block.len() as u32, checksum: checksum32(block), lsn: 0 })
    }

    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let blocks = self.blocks.read();
        let block = blocks
            .get(&addr.offset)
            .ok_or_else(|| Error::corrupt(format!("memory block {} not found", addr.offset)))?;
        if checksum32(block) != addr.checksum {
            return Err(Error::corrupt(format!("memory block {} checksum mismatch", addr.offset)));
        }
        Ok(block.clone())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.blocks.read().values().map(|b| b.len() as u64).sum())
    }

    fn begin_reclaim(&self) {
        *self.recent.write() = Some(Vec::new());
    }

    fn reclaim(&self, live: &[BlockAddr]) -> Result<()> {
        let mut keep: std::collections::HashSet<u64> = live.iter().map(|a| a.offset).collect();
        if let Some(recent) = self.recent.write().take() {
            keep.extend(recent);
        }
        self.blocks.write().retain(|id, _| keep.contains(id));
        Ok(())
    }
}
