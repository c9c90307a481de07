//! Partial value updates.
//!
//! A modify replaces `size` bytes at `offset` with `data`, growing or
//! shrinking the value as needed. Offsets past the end pad the value with
//! zero bytes. A list of modifies applies in order.

use serde::{Deserialize, Serialize};

/// One byte-range replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyEntry {
    /// Replacement bytes.
    pub data: Vec<u8>,
    /// Start of the replaced range.
    pub offset: usize,
    /// Length of the replaced range.
    pub size: usize,
}

impl ModifyEntry {
    pub fn new(data: impl Into<Vec<u8>>, offset: usize, size: usize) -> Self {
        Self { data: data.into(), offset, size }
    }
}

/// Applies `entries` to `value` in order.
pub fn apply_modifies(value: &mut Vec<u8>, entries: &[ModifyEntry]) {
    for entry in entries {
        if entry.offset > value.len() {
            value.resize(entry.offset, 0);
        }
        let end = (entry.offset + entry.size).min(value.len());
        value.splice(entry.offset..end, entry.data.iter().copied());
    }
}

/// Bytes a modify list adds to an update chain.
pub(crate) fn modify_footprint(entries: &[ModifyEntry]) -> u64 {
    entries.iter().map(|e| e.data.len() as u64 + 16).sum()
}

/// Equal bytes needed to end one entry and start another.
const MIN_GAP: usize = 8;

/// Builds a modify list turning `old` into `new`.
///
/// Returns `None` when the change needs more than `maxdiff` replacement
/// bytes or more than `maxmod` entries; the caller should write the whole
/// value instead.
pub fn calc_modify(old: &[u8], new: &[u8], maxdiff: usize, maxmod: usize) -> Option<Vec<ModifyEntry>> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old.iter().rev().zip(new.iter().rev()).take(max_suffix).take_while(|(a, b)| a == b).count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];
    if old_mid.is_empty() && new_mid.is_empty() {
        return Some(Vec::new());
    }

    let mut entries = Vec::new();
    if old_mid.len() == new_mid.len() {
        // Same-size change: emit one entry per run of differing bytes.
        let mut i = 0;
        while i < new_mid.len() {
            if old_mid[i] == new_mid[i] {
                i += 1;
                continue;
            }
            let start = i;
            let mut end = i + 1;
            let mut same = 0;
            while end < new_mid.len() && same < MIN_GAP {
                if old_mid[end] == new_mid[end] { same += 1 } else { same = 0 }
                end += 1;
            }
            let end = end - same;
            entries.push(ModifyEntry::new(&new_mid[start..end], prefix + start, end - start));
            i = end;
        }
    } else {
        entries.push(ModifyEntry::new(new_mid, prefix, old_mid.len()));
    }

    let bytes: usize = entries.iter().map(|e| e.data.len()).sum();
    if bytes > maxdiff || entries.len() > maxmod {
        return None;
    }
    Some(entries)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn apply(base: &str, entries: &[ModifyEntry]) -> String {
        let mut value = base.as_bytes().to_vec();
        apply_modifies(&mut value, entries);
        String::from_utf8(value).unwrap()
    }

    #[test]
    fn test_replace_in_place() {
        assert_eq!(apply("abcdef", &[ModifyEntry::new("XY", 2, 2)]), "abXYef");
    }

    #[test]
    fn test_grow_and_shrink() {
        assert_eq!(apply("abcdef", &[ModifyEntry::new("XYZ", 1, 1)]), "aXYZcdef");
        assert_eq!(apply("abcdef", &[ModifyEntry::new("", 1, 4)]), "af");
    }

    #[test]
    fn test_append_past_end_pads() {
        let mut value = b"ab".to_vec();
        apply_modifies(&mut value, &[ModifyEntry::new("z", 4, 0)]);
        assert_eq!(value, b"ab\0\0z");
    }

    #[test]
    fn test_entries_apply_in_order() {
        let entries = [ModifyEntry::new("1", 0, 1), ModifyEntry::new("22", 0, 1)];
        assert_eq!(apply("abc", &entries), "22bc");
    }

    #[test]
    fn test_calc_modify_reproduces_new_value() {
        let old = b"the quick brown fox jumps over the lazy dog".to_vec();
        let new = b"the quick green fox jumps over the lazy cat".to_vec();
        let entries = calc_modify(&old, &new, 100, 10).unwrap();
        assert_eq!(entries.len(), 2);
        let mut value = old.clone();
        apply_modifies(&mut value, &entries);
        assert_eq!(value, new);
    }

    #[test]
    fn test_calc_modify_size_change() {
        let entries = calc_modify(b"abcdef", b"abXYZdef", 10, 1).unwrap();
        assert_eq!(entries, vec![ModifyEntry::new("XYZ", 2, 1)]);
        assert!(calc_modify(b"abcdef", b"abcdef", 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_calc_modify_limits() {
        let old = vec![b'a'; 100];
        let new = vec![b'b'; 100];
        assert!(calc_modify(&old, &new, 10, 10).is_none());
        assert!(calc_modify(b"a.........b", b"x.........y", 10, 1).is_none());
    }
}
