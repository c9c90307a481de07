//! First-fit extent allocator.
//!
//! Blocks are variable-sized multiples of the allocation unit. Free space
//! is tracked as a map of `offset -> length` extents that coalesce with
//! their neighbours. Nothing is freed when a page is rewritten: space is
//! only recovered by [`ExtentAllocator::rebuild`], which recomputes the
//! free map from the set of blocks still reachable after a checkpoint.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Extent allocator state.
#[derive(Debug)]
struct ExtentState {
    /// Free extents keyed by offset.
    free: BTreeMap<u64, u64>,
    /// First byte past the last allocated extent.
    end: u64,
    /// Extents handed out since tracking started.
    recent: Option<Vec<(u64, u64)>>,
}

/// First-fit allocator over a growable file.
#[derive(Debug)]
pub(crate) struct ExtentAllocator {
    state: Mutex<ExtentState>,
    unit: u64,
    /// Offset of the first allocatable byte.
    start: u64,
}

impl ExtentAllocator {
    /// Creates an allocator whose space begins at `start` and currently ends at `end`.
    pub fn new(unit: u64, start: u64, end: u64) -> Self {
        Self {
            state: Mutex::new(ExtentState { free: BTreeMap::new(), end: end.max(start), recent: None }),
            unit: unit.max(1),
            start,
        }
    }

    /// Allocates `len` bytes (already rounded to the unit) and returns the offset.
    pub fn alloc(&self, len: u64) -> u64 {
        let mut st = self.state.lock();
        let found = st.free.iter().find(|&(_, &l)| l >= len).map(|(&o, &l)| (o, l));
        let offset = match found {
            Some((offset, extent_len)) => {
                st.free.remove(&offset);
                if extent_len > len {
                    st.free.insert(offset + len, extent_len - len);
                }
                offset
            },
            None => {
                let offset = st.end;
                st.end += len;
                offset
            },
        };
        if let Some(recent) = st.recent.as_mut() {
            recent.push((offset, len));
        }
        offset
    }

    /// Starts recording allocations for the next rebuild.
    pub fn track(&self) {
        self.state.lock().recent = Some(Vec::new());
    }

    /// Recomputes the free map: everything between `start` and `end` that is
    /// not covered by `live` (or allocated since [`track`](Self::track)) is free.
    pub fn rebuild(&self, live: &[(u64, u64)]) {
        let mut st = self.state.lock();
        let mut used: Vec<(u64, u64)> = live.to_vec();
        if let Some(recent) = st.recent.take() {
            used.extend(recent);
        }
        used.sort_unstable();

        let mut free = BTreeMap::new();
        let mut cursor = self.start;
        for (offset, len) in used {
            if offset > cursor {
                free.insert(cursor, offset - cursor);
            }
            cursor = cursor.max(offset + len);
        }
        if st.end > cursor {
            free.insert(cursor, st.end - cursor);
        }
        st.free = free;
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().free.values().sum()
    }

    /// End of allocated space.
    pub fn end(&self) -> u64 {
        self.state.lock().end
    }

    /// True when a free extent below `offset` can hold `len` bytes.
    pub fn fits_below(&self, offset: u64, len: u64) -> bool {
        self.state.lock().free.range(..offset).any(|(&o, &l)| l >= len && o + len <= offset)
    }

    /// Drops the trailing free extent, if any. Returns the new end when it moved.
    pub fn trim_tail(&self) -> Option<u64> {
        let mut st = self.state.lock();
        let (&offset, &len) = st.free.iter().next_back()?;
        if offset + len != st.end {
            return None;
        }
        st.free.remove(&offset);
        st.end = offset;
        Some(offset)
    }

    /// Allocation unit.
    pub fn unit(&self) -> u64 {
        self.unit
    }
}
