//! History store.
//!
//! Versions displaced from leaf pages by reconciliation live in a regular
//! btree keyed by `(btree id, key length, key, stop ts, stop txn)`. Every
//! entry's value is the encoded [`Cell`] with its full time window, so a
//! reader at timestamp T finds its version by scanning a key's entries in
//! stop order and taking the first one whose window contains T.
//!
//! Only reconciliation, rollback-to-stable and the obsolete-entry sweep
//! write here, and always outside any transaction.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use cellar_types::{Timestamp, codec};

use crate::{
    btree::{Btree, Expect, KeyRange, Lookup, WriteCtx},
    error::{Error, Result},
    page::Cell,
    stats::Stat,
    txn::{CellVisible, Reader, VisibleAll},
    update::UpdateKind,
};

/// Btree id reserved for the history store.
pub(crate) const HS_BTREE_ID: u64 = 1;

/// URI of the history store table.
pub const HS_URI: &str = "file:CellarHS.cdb";

/// One decoded history store entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HsEntry {
    pub btree_id: u64,
    pub key: Vec<u8>,
    pub cell: Cell,
    /// Raw history store key.
    pub hs_key: Vec<u8>,
}

fn prefix(btree_id: u64, key: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + key.map_or(0, <[u8]>::len));
    out.extend_from_slice(&btree_id.to_be_bytes());
    if let Some(key) = key {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key);
    }
    out
}

fn hs_key(btree_id: u64, key: &[u8], stop_ts: Timestamp, stop_txn: u64) -> Vec<u8> {
    let mut out = prefix(btree_id, Some(key));
    out.extend_from_slice(&stop_ts.to_be_bytes());
    out.extend_from_slice(&stop_txn.to_be_bytes());
    out
}

fn split_key(raw: &[u8]) -> Option<(u64, Vec<u8>)> {
    if raw.len() < 12 {
        return None;
    }
    let btree_id = BigEndian::read_u64(&raw[0..8]);
    let len = BigEndian::read_u32(&raw[8..12]) as usize;
    let key = raw.get(12..12 + len)?.to_vec();
    Some((btree_id, key))
}

/// The history store.
pub(crate) struct HistoryStore {
    tree: Arc<Btree>,
}

impl HistoryStore {
    pub fn new(tree: Arc<Btree>) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Arc<Btree> {
        &self.tree
    }

    /// Records an older version of `key`. The cell's stop point is the
    /// start of the version that displaced it.
    pub fn insert(&self, btree_id: u64, key: &[u8], cell: &Cell) -> Result<()> {
        let raw = hs_key(btree_id, key, cell.tw.stop_ts, cell.tw.stop_txn);
        let value = codec::encode(cell)?;
        self.tree.write(&raw, UpdateKind::Standard(value), &WriteCtx::global(), Expect::Any)?;
        self.tree.stats.incr(Stat::HsInsert);
        self.tree.env.stats.incr(Stat::HsInsert);
        Ok(())
    }

    /// Deletes one entry.
    pub fn remove(&self, entry: &HsEntry) -> Result<()> {
        self.tree.write(&entry.hs_key, UpdateKind::Tombstone, &WriteCtx::global(), Expect::Any)?;
        self.tree.env.stats.incr(Stat::HsRemoved);
        Ok(())
    }

    /// Entries for one key (or a whole tree when `key` is `None`), oldest
    /// stop first.
    pub fn entries(&self, btree_id: u64, key: Option<&[u8]>) -> Result<Vec<HsEntry>> {
        let start = prefix(btree_id, key);
        let range = KeyRange { lower: Some(start.clone()), upper: None };
        let reader = Reader::global();
        let mut out = Vec::new();
        let mut pos: Option<Vec<u8>> = None;
        while let Some((raw, value)) = self.tree.walk(pos.as_deref(), true, &range, &reader, None)? {
            if !raw.starts_with(&start) {
                break;
            }
            let (id, user_key) = split_key(&raw).ok_or_else(|| Error::corrupt("malformed history store key"))?;
            let cell: Cell = codec::decode(&value)?;
            out.push(HsEntry { btree_id: id, key: user_key, cell, hs_key: raw.clone() });
            pos = Some(raw);
        }
        Ok(out)
    }

    /// Every entry in the store.
    pub fn all_entries(&self) -> Result<Vec<HsEntry>> {
        let reader = Reader::global();
        let range = KeyRange::default();
        let mut out = Vec::new();
        let mut pos: Option<Vec<u8>> = None;
        while let Some((raw, value)) = self.tree.walk(pos.as_deref(), true, &range, &reader, None)? {
            let (btree_id, key) = split_key(&raw).ok_or_else(|| Error::corrupt("malformed history store key"))?;
            let cell: Cell = codec::decode(&value)?;
            out.push(HsEntry { btree_id, key, cell, hs_key: raw.clone() });
            pos = Some(raw);
        }
        Ok(out)
    }

    /// The version of `key` a reader sees, from history.
    pub fn lookup(&self, btree_id: u64, key: &[u8], reader: &Reader) -> Result<Lookup> {
        for entry in self.entries(btree_id, Some(key))? {
            match reader.cell(&entry.cell.tw) {
                CellVisible::Value => return Ok(Lookup::Found(entry.cell.value)),
                CellVisible::Deleted | CellVisible::Prepared => continue,
                CellVisible::TooNew => break,
            }
        }
        Ok(Lookup::Absent)
    }

    /// Drops every entry of a tree.
    pub fn remove_tree(&self, btree_id: u64) -> Result<u64> {
        let entries = self.entries(btree_id, None)?;
        for entry in &entries {
            self.remove(entry)?;
        }
        Ok(entries.len() as u64)
    }

    /// Removes entries no reader can reach: their stop is globally visible.
    pub fn sweep(&self, horizon: &VisibleAll) -> Result<u64> {
        let mut removed = 0;
        for entry in self.all_entries()? {
            let tw = &entry.cell.tw;
            if horizon.visible(tw.stop_txn, tw.durable_stop_ts.max(tw.stop_ts)) {
                self.remove(&entry)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
