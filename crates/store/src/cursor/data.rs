//! Cursors over tables, files, column groups, indices and layered tables.
//!
//! A data cursor remembers its position as a tree key: the table key for
//! tables, files and layered tables, the full index key (indexed columns
//! followed by the primary key) for indices. Bounds are kept packed in the
//! same key space and steps never leave them.

use std::sync::Arc;

use cellar_types::{
    Format, Item, Row,
    config::{BoundConfig, BoundSide, ConfigSection, CursorConfig},
    pack::FieldType,
};

use crate::{
    btree::{Expect, KeyRange, Lookup, TreeKind, key_recno, recno_key},
    conn::{ConnInner, DataTarget, HandleGuard, IndexTarget, Layered, TargetKind},
    error::{Error, Result},
    evict,
    hs::HistoryStore,
    log::removal,
    modify::{ModifyEntry, apply_modifies, calc_modify},
    session::Op,
    stats::Stat,
    txn::Reader,
    update::UpdateKind,
};

/// Largest modify list written for a string value before falling back
/// to a whole-value update.
const MAX_STRING_MODIFIES: usize = 16;

/// Resolves `key` in `target`: layered tables read ingest first and fall
/// through to stable only when ingest has never seen the key.
pub(crate) fn lookup(target: &DataTarget, key: &[u8], reader: &Reader, hs: Option<&HistoryStore>) -> Result<Lookup> {
    match &target.kind {
        TargetKind::Layered(layered) => match layered.ingest.search(key, reader, hs)? {
            Lookup::Absent => layered.stable.search(key, reader, hs),
            found => Ok(found),
        },
        _ => target.tree.search(key, reader, hs),
    }
}

fn layered_step(
    layered: &Layered,
    from: Option<&[u8]>,
    forward: bool,
    range: &KeyRange,
    reader: &Reader,
    hs: Option<&HistoryStore>,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let ingest = layered.ingest.walk(from, forward, range, reader, hs)?;
    let mut stable_from = from.map(<[u8]>::to_vec);
    let stable = loop {
        match layered.stable.walk(stable_from.as_deref(), forward, range, reader, hs)? {
            Some((key, value)) => {
                // Removed on this node since the stable tree was written.
                if layered.ingest.search(&key, reader, hs)? == Lookup::Deleted {
                    stable_from = Some(key);
                    continue;
                }
                break Some((key, value));
            },
            None => break None,
        }
    };
    Ok(match (ingest, stable) {
        (Some(i), Some(s)) => {
            let ingest_first = if forward { i.0 <= s.0 } else { i.0 >= s.0 };
            Some(if ingest_first { i } else { s })
        },
        (i, s) => i.or(s),
    })
}

/// The visible entry of `target` after (or before) `from` in tree-key order.
pub(crate) fn visible_step(
    target: &DataTarget,
    from: Option<&[u8]>,
    forward: bool,
    range: &KeyRange,
    reader: &Reader,
    hs: Option<&HistoryStore>,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    match &target.kind {
        TargetKind::Layered(layered) => layered_step(layered, from, forward, range, reader, hs),
        TargetKind::Index(index) => index.tree.walk(from, forward, range, reader, hs),
        TargetKind::Plain | TargetKind::Colgroup { .. } => target.tree.walk(from, forward, range, reader, hs),
    }
}

/// Next visible entry strictly after `from`.
pub(crate) fn visible_next(
    target: &DataTarget,
    from: Option<&[u8]>,
    range: &KeyRange,
    reader: &Reader,
    hs: Option<&HistoryStore>,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    visible_step(target, from, true, range, reader, hs)
}

fn index_key_of(index: &IndexTarget, key: &Row, value: Option<&[u8]>, format: &Format) -> Result<Option<Vec<u8>>> {
    match value {
        Some(value) => Ok(Some(index.index_key(key, &format.unpack(value)?)?)),
        None => Ok(None),
    }
}

/// Keeps the indices of `target` in step with one row changing from `old`
/// to `new`.
pub(crate) fn update_indices(
    op: &mut Op<'_>,
    target: &DataTarget,
    key: &[u8],
    old: Option<&[u8]>,
    new: Option<&[u8]>,
) -> Result<()> {
    if target.indices.is_empty() {
        return Ok(());
    }
    let key_row = target.key_format.unpack(key)?;
    for index in &target.indices {
        let before = index_key_of(index, &key_row, old, &target.value_format)?;
        let after = index_key_of(index, &key_row, new, &target.value_format)?;
        if before == after {
            continue;
        }
        if let Some(stale) = before {
            op.write(&index.tree, &stale, UpdateKind::Tombstone, Expect::Any)?;
        }
        if let Some(fresh) = after {
            op.write(&index.tree, &fresh, UpdateKind::Standard(Vec::new()), Expect::Any)?;
        }
    }
    Ok(())
}

/// Drops the index entries of a row that is about to be removed.
pub(crate) fn remove_indexed(op: &mut Op<'_>, target: &DataTarget, key: &[u8], value: &[u8]) -> Result<()> {
    update_indices(op, target, key, Some(value), None)
}

#[derive(Debug, Clone)]
struct KeyBound {
    key: Vec<u8>,
    inclusive: bool,
}

/// A positioned entry: where it sits in the tree and what the caller sees.
struct Entry {
    at: Vec<u8>,
    key: Row,
    value: Row,
}

pub(crate) struct DataCursor {
    pub target: DataTarget,
    cfg: CursorConfig,
    key_format: Format,
    key: Option<Row>,
    value: Option<Row>,
    pos: Option<Vec<u8>>,
    lower: Option<KeyBound>,
    upper: Option<KeyBound>,
    epoch: u64,
    /// Checkpoint cursors read their tree as written, without history.
    fixed: Option<Reader>,
    _hold: HandleGuard,
}

impl std::fmt::Debug for DataCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCursor")
            .field("uri", &self.target.uri)
            .field("positioned", &self.pos.is_some())
            .field("checkpoint", &self.cfg.checkpoint)
            .finish()
    }
}

impl DataCursor {
    pub fn open(conn: &Arc<ConnInner>, uri: &str, cfg: CursorConfig, epoch: u64) -> Result<Self> {
        let (target, hold, fixed) = match &cfg.checkpoint {
            Some(name) => {
                if cfg.bulk {
                    return Err(Error::invalid("bulk cursors cannot read a checkpoint"));
                }
                let name = ConnInner::checkpoint_name(name);
                let target = conn.checkpoint_target(uri, name)?;
                let hold = conn.hold_checkpoint(target.tree_ids(), name);
                (target, hold, Some(Reader::global()))
            },
            None => {
                let target = conn.data_target(uri)?;
                let hold = conn.hold(target.tree_ids());
                (target, hold, None)
            },
        };
        if cfg.bulk {
            if !matches!(target.kind, TargetKind::Plain) {
                return Err(Error::unsupported(format!("bulk load into {uri}")));
            }
            if target.tree.largest_key()?.is_some() {
                return Err(Error::invalid(format!("{uri}: bulk load requires an empty object")));
            }
        }
        let key_format = target.presented_key()?;
        Ok(Self {
            target,
            cfg,
            key_format,
            key: None,
            value: None,
            pos: None,
            lower: None,
            upper: None,
            epoch,
            fixed,
            _hold: hold,
        })
    }

    /// Forgets the position and bounds when the session resolved a
    /// transaction, checkpointed, reset or reconfigured since the last call.
    pub fn sync(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.pos = None;
            self.lower = None;
            self.upper = None;
            self.epoch = epoch;
        }
    }

    fn is_index(&self) -> bool {
        matches!(self.target.kind, TargetKind::Index(_))
    }

    fn is_layered(&self) -> bool {
        matches!(self.target.kind, TargetKind::Layered(_))
    }

    fn view<'a>(&'a self, op: &'a Op<'_>) -> (&'a Reader, Option<&'a HistoryStore>) {
        match &self.fixed {
            Some(reader) => (reader, None),
            None => (op.reader(), op.hs()),
        }
    }

    fn stat(&self, op: &Op<'_>, stat: Stat) {
        op.conn.env.stats.incr(stat);
        self.target.tree.stats.incr(stat);
    }

    fn check_write(&self) -> Result<()> {
        if self.fixed.is_some() || self.cfg.readonly {
            return Err(Error::ReadOnly);
        }
        match &self.target.kind {
            TargetKind::Index(_) | TargetKind::Colgroup { .. } => {
                Err(Error::unsupported(format!("{}: writes through an index or column group", self.target.uri)))
            },
            TargetKind::Plain | TargetKind::Layered(_) => Ok(()),
        }
    }

    pub fn set_key(&mut self, key: Row) {
        self.key = Some(key);
        self.pos = None;
    }

    pub fn set_value(&mut self, value: Row) {
        self.value = Some(value);
    }

    pub fn get_key(&self) -> Result<Row> {
        self.key.clone().ok_or_else(|| Error::invalid("cursor key is not set"))
    }

    pub fn get_value(&self) -> Result<Row> {
        self.value.clone().ok_or_else(|| Error::invalid("cursor value is not set"))
    }

    fn raw_bytes(row: &Row, what: &str) -> Result<Vec<u8>> {
        row.get(0)
            .and_then(Item::as_bytes_like)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::invalid(format!("raw cursors take byte {what}s")))
    }

    fn pack_key(&self, row: &Row) -> Result<Vec<u8>> {
        if self.cfg.raw && !self.is_index() {
            return Self::raw_bytes(row, "key");
        }
        Ok(self.key_format.pack(row)?)
    }

    fn packed_value(&self) -> Result<Vec<u8>> {
        let value = self.value.as_ref().ok_or_else(|| Error::invalid("cursor value is not set"))?;
        if self.cfg.raw {
            return Self::raw_bytes(value, "value");
        }
        Ok(self.target.value_format.pack(value)?)
    }

    /// The tree key the cursor stands on, or its key packed.
    pub fn packed_key(&self) -> Result<Vec<u8>> {
        if !self.is_index() {
            if let Some(pos) = &self.pos {
                return Ok(pos.clone());
            }
        }
        let key = self.key.as_ref().ok_or_else(|| Error::invalid("cursor key is not set"))?;
        self.pack_key(key)
    }

    /// Turns a tree entry into what the caller sees. `None` for index
    /// entries whose row is no longer visible.
    fn present(&self, key: &[u8], value: &[u8], reader: &Reader, hs: Option<&HistoryStore>) -> Result<Option<(Row, Row)>> {
        let target = &self.target;
        match &target.kind {
            TargetKind::Index(index) => {
                let (columns, primary) = index.split(index.format.unpack(key)?);
                let primary_key = target.key_format.pack(&primary)?;
                match target.tree.search(&primary_key, reader, hs)? {
                    Lookup::Found(row) => Ok(Some((columns, target.value_format.unpack(&row)?))),
                    _ => Ok(None),
                }
            },
            TargetKind::Colgroup { columns, .. } => {
                let full = target.value_format.unpack(value)?;
                let projected = columns.iter().filter_map(|&c| full.get(c).cloned()).collect::<Vec<_>>();
                Ok(Some((target.key_format.unpack(key)?, Row::new(projected))))
            },
            TargetKind::Plain | TargetKind::Layered(_) if self.cfg.raw => {
                Ok(Some((Row::from(key.to_vec()), Row::from(value.to_vec()))))
            },
            TargetKind::Plain | TargetKind::Layered(_) => {
                Ok(Some((target.key_format.unpack(key)?, target.value_format.unpack(value)?)))
            },
        }
    }

    fn range(&self) -> KeyRange {
        KeyRange {
            lower: self.lower.as_ref().map(|b| b.key.clone()),
            upper: self.upper.as_ref().map(|b| b.key.clone()),
        }
    }

    /// True for a key sitting on an exclusive bound.
    fn excluded(&self, key: &[u8]) -> bool {
        let on = |bound: &Option<KeyBound>| bound.as_ref().is_some_and(|b| !b.inclusive && b.key == key);
        on(&self.lower) || on(&self.upper)
    }

    fn in_bounds(&self, key: &[u8]) -> bool {
        self.range().contains(key) && !self.excluded(key)
    }

    fn seek(&self, from: Option<&[u8]>, forward: bool, op: &Op<'_>) -> Result<Option<Entry>> {
        let (reader, hs) = self.view(op);
        let range = self.range();
        let mut from = from.map(<[u8]>::to_vec);
        loop {
            let Some((at, value)) = visible_step(&self.target, from.as_deref(), forward, &range, reader, hs)? else {
                return Ok(None);
            };
            if !self.excluded(&at) {
                if let Some((key, value)) = self.present(&at, &value, reader, hs)? {
                    return Ok(Some(Entry { at, key, value }));
                }
            }
            from = Some(at);
        }
    }

    fn exact(&self, key: &[u8], op: &Op<'_>) -> Result<Option<Entry>> {
        if !self.in_bounds(key) {
            return Ok(None);
        }
        let (reader, hs) = self.view(op);
        match lookup(&self.target, key, reader, hs)? {
            Lookup::Found(value) => {
                Ok(self.present(key, &value, reader, hs)?.map(|(row, value)| Entry { at: key.to_vec(), key: row, value }))
            },
            Lookup::Deleted | Lookup::Absent => Ok(None),
        }
    }

    fn land(&mut self, entry: Option<Entry>) -> Result<()> {
        match entry {
            Some(entry) => {
                self.pos = Some(entry.at);
                self.key = Some(entry.key);
                self.value = Some(entry.value);
                Ok(())
            },
            None => {
                self.pos = None;
                Err(Error::NotFound)
            },
        }
    }

    fn index_matches(&self, entry: &Entry, prefix: &[u8]) -> Result<bool> {
        Ok(self.key_format.pack(&entry.key)? == prefix)
    }

    pub fn step(&mut self, op: &mut Op<'_>, forward: bool) -> Result<()> {
        self.stat(op, if forward { Stat::CursorNext } else { Stat::CursorPrev });
        let entry = self.seek(self.pos.as_deref(), forward, op)?;
        self.land(entry)
    }

    pub fn search(&mut self, op: &mut Op<'_>) -> Result<()> {
        self.stat(op, Stat::CursorSearch);
        let key = self.get_key()?;
        let packed = self.pack_key(&key)?;
        let entry = if self.is_index() {
            match self.seek(Some(&packed), true, op)? {
                Some(entry) => self.index_matches(&entry, &packed)?.then_some(entry),
                None => None,
            }
        } else {
            self.exact(&packed, op)?
        };
        self.land(entry)
    }

    /// Positions on the key, or the nearest visible key after it, or
    /// before it. Returns 0, 1 or -1 to say which.
    pub fn search_near(&mut self, op: &mut Op<'_>) -> Result<i32> {
        self.stat(op, Stat::CursorSearchNear);
        let key = self.get_key()?;
        let packed = self.pack_key(&key)?;
        if !self.is_index() {
            if let Some(entry) = self.exact(&packed, op)? {
                self.land(Some(entry))?;
                return Ok(0);
            }
        }
        if let Some(entry) = self.seek(Some(&packed), true, op)? {
            let exact = self.is_index() && self.index_matches(&entry, &packed)?;
            self.land(Some(entry))?;
            return Ok(if exact { 0 } else { 1 });
        }
        let entry = self.seek(Some(&packed), false, op)?;
        self.land(entry)?;
        Ok(-1)
    }

    /// Positions on the largest key present, visible or not. The value is
    /// not available afterwards.
    pub fn largest_key(&mut self) -> Result<()> {
        let largest = match &self.target.kind {
            TargetKind::Layered(layered) => layered.ingest.largest_key()?.max(layered.stable.largest_key()?),
            TargetKind::Index(index) => index.tree.largest_key()?,
            TargetKind::Plain | TargetKind::Colgroup { .. } => self.target.tree.largest_key()?,
        };
        let at = largest.ok_or(Error::NotFound)?;
        let key = match &self.target.kind {
            TargetKind::Index(index) => index.split(index.format.unpack(&at)?).0,
            _ if self.cfg.raw => Row::from(at.clone()),
            _ => self.target.key_format.unpack(&at)?,
        };
        self.pos = Some(at);
        self.key = Some(key);
        self.value = None;
        Ok(())
    }

    /// Index and layered writes check existence through the merged view.
    fn check_exists(&self, op: &Op<'_>, key: &[u8], want: bool) -> Result<()> {
        let found = lookup(&self.target, key, op.reader(), op.hs())?.is_found();
        match (found, want) {
            (true, false) => Err(Error::DuplicateKey),
            (false, true) => Err(Error::NotFound),
            _ => Ok(()),
        }
    }

    fn old_value(&self, op: &Op<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.target.indices.is_empty() {
            return Ok(None);
        }
        Ok(self.target.tree.search(key, op.reader(), op.hs())?.into_value())
    }

    /// Writes `kind` at `key` and brings the indices along.
    fn write(&self, op: &mut Op<'_>, key: &[u8], kind: UpdateKind, expect: Expect) -> Result<()> {
        let expect = if self.is_layered() && expect != Expect::Any {
            self.check_exists(op, key, expect == Expect::Exists)?;
            Expect::Any
        } else {
            expect
        };
        let old = self.old_value(op, key)?;
        let new = match &kind {
            UpdateKind::Standard(value) => Some(value.clone()),
            UpdateKind::Modify(_) | UpdateKind::Reserve => old.clone(),
            UpdateKind::Tombstone => None,
        };
        let tree = self.target.tree.clone();
        let modifies = matches!(kind, UpdateKind::Modify(_));
        op.write(&tree, key, kind, expect)?;
        if self.target.indices.is_empty() {
            return Ok(());
        }
        let new = if modifies { tree.search(key, op.reader(), op.hs())?.into_value() } else { new };
        update_indices(op, &self.target, key, old.as_deref(), new.as_deref())
    }

    pub fn insert(&mut self, op: &mut Op<'_>) -> Result<()> {
        self.check_write()?;
        self.stat(op, Stat::CursorInsert);
        let value = self.packed_value()?;
        let tree = &self.target.tree;
        let (key, row) = if self.cfg.append && tree.kind.is_column() {
            let recno = tree.next_recno();
            (recno_key(recno), Row::from(recno))
        } else {
            let row = self.get_key()?;
            (self.pack_key(&row)?, row)
        };
        let expect = if self.cfg.overwrite || self.cfg.bulk { Expect::Any } else { Expect::Absent };
        self.write(op, &key, UpdateKind::Standard(value), expect)?;
        self.pos = None;
        self.key = Some(row);
        Ok(())
    }

    pub fn update(&mut self, op: &mut Op<'_>) -> Result<()> {
        self.check_write()?;
        self.stat(op, Stat::CursorUpdate);
        let value = self.packed_value()?;
        let key = self.packed_key()?;
        let expect = if self.cfg.overwrite { Expect::Any } else { Expect::Exists };
        self.write(op, &key, UpdateKind::Standard(value), expect)?;
        self.pos = Some(key);
        Ok(())
    }

    pub fn remove(&mut self, op: &mut Op<'_>) -> Result<()> {
        self.check_write()?;
        self.stat(op, Stat::CursorRemove);
        let key = self.packed_key()?;
        let tree = &self.target.tree;
        if tree.kind == TreeKind::ColFix {
            // Removed records read back as zero, so removal is a write of
            // zero. Past the end it extends the table.
            if key_recno(&key).unwrap_or(0) == 0 {
                return Err(Error::invalid("record number 0 is not a valid key"));
            }
            let kind = removal(tree);
            self.write(op, &key, kind, Expect::Any)?;
        } else {
            self.write(op, &key, UpdateKind::Tombstone, Expect::Exists)?;
        }
        self.pos = None;
        self.value = None;
        Ok(())
    }

    /// Locks the key against other writers without changing it.
    pub fn reserve(&mut self, op: &mut Op<'_>) -> Result<()> {
        if !op.explicit() {
            return Err(Error::invalid("reserve requires an explicit transaction"));
        }
        self.check_write()?;
        self.stat(op, Stat::CursorReserve);
        let key = self.packed_key()?;
        self.write(op, &key, UpdateKind::Reserve, Expect::Exists)?;
        let entry = self.exact(&key, op)?;
        self.land(entry)
    }

    pub fn modify(&mut self, op: &mut Op<'_>, entries: &[ModifyEntry]) -> Result<()> {
        if !op.explicit_snapshot() {
            return Err(Error::invalid("modify requires an explicit transaction at snapshot isolation"));
        }
        self.check_write()?;
        if self.target.tree.kind == TreeKind::ColFix {
            return Err(Error::unsupported("modify on a fixed-length column store"));
        }
        self.stat(op, Stat::CursorModify);
        let fields = self.target.value_format.fields();
        let bytes = self.cfg.raw || fields == [FieldType::Bytes];
        if !bytes && fields != [FieldType::Str] {
            return Err(Error::unsupported(format!("modify on value format {}", self.target.value_format)));
        }
        let key = self.packed_key()?;
        let kind = if bytes {
            UpdateKind::Modify(entries.to_vec())
        } else {
            // Packed strings carry a terminator, so apply to the text and
            // diff the packed results.
            let current = match lookup(&self.target, &key, op.reader(), op.hs())? {
                Lookup::Found(value) => value,
                Lookup::Deleted | Lookup::Absent => return Err(Error::NotFound),
            };
            let mut text = self
                .target
                .value_format
                .unpack(&current)?
                .get(0)
                .and_then(Item::as_bytes_like)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            apply_modifies(&mut text, entries);
            let text = String::from_utf8(text).map_err(|_| Error::invalid("modify produced a value that is not UTF-8"))?;
            let packed = self.target.value_format.pack(&Row::from(text))?;
            match calc_modify(&current, &packed, packed.len(), MAX_STRING_MODIFIES) {
                Some(entries) => UpdateKind::Modify(entries),
                None => UpdateKind::Standard(packed),
            }
        };
        self.write(op, &key, kind, Expect::Exists)?;
        let entry = self.exact(&key, op)?;
        self.land(entry)
    }

    /// Sets or clears a bound from the current key.
    pub fn bound(&mut self, config: &str) -> Result<()> {
        let cfg = BoundConfig::parse(config)?;
        if !cfg.set {
            self.lower = None;
            self.upper = None;
            return Ok(());
        }
        if self.is_index() {
            return Err(Error::unsupported("bounds on an index cursor"));
        }
        if self.pos.is_some() {
            return Err(Error::invalid("bounds cannot be set on a positioned cursor"));
        }
        let key = self.get_key()?;
        let bound = KeyBound { key: self.pack_key(&key)?, inclusive: cfg.inclusive };
        let (lower, upper) = match cfg.side {
            BoundSide::Lower => (Some(&bound), self.upper.as_ref()),
            BoundSide::Upper => (self.lower.as_ref(), Some(&bound)),
        };
        if let (Some(lower), Some(upper)) = (lower, upper) {
            let empty = lower.key > upper.key || (lower.key == upper.key && !(lower.inclusive && upper.inclusive));
            if empty {
                return Err(Error::invalid("the lower bound is above the upper bound"));
            }
        }
        match cfg.side {
            BoundSide::Lower => self.lower = Some(bound),
            BoundSide::Upper => self.upper = Some(bound),
        }
        Ok(())
    }

    /// Drops the position, key, value and bounds, evicting the page first
    /// when `release_evict` asks for it.
    pub fn reset(&mut self, conn: &ConnInner) -> Result<()> {
        let release = self.cfg.release_evict || conn.env.config().debug_mode.release_evict_page;
        if let (true, Some(pos), None) = (release, &self.pos, &self.fixed) {
            evict::release_page(conn, &self.target.tree, pos)?;
        }
        self.pos = None;
        self.key = None;
        self.value = None;
        self.lower = None;
        self.upper = None;
        Ok(())
    }
}
