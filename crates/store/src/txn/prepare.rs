//! Prepared transaction bookkeeping.
//!
//! Prepared transactions whose changes reached a checkpoint are recorded in
//! the prepared catalog inside the metadata image. After a restart with
//! `preserve_prepared`, catalog entries with a prepared id are recovered and
//! can be claimed by a new transaction.

use std::collections::BTreeMap;

use cellar_types::{TS_NONE, Timestamp};
use serde::{Deserialize, Serialize};

use super::{TimestampRecord, TxnOp};
use crate::error::{Error, Result};

/// One prepared transaction captured at checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PreparedEntry {
    pub prepared_id: Option<u64>,
    pub prepare_ts: Timestamp,
    /// Keys written, as (btree id, key).
    pub keys: Vec<(u64, Vec<u8>)>,
    /// Fast-truncated ranges, as (btree id, lower, upper).
    pub truncates: Vec<(u64, Vec<u8>, Option<Vec<u8>>)>,
}

impl PreparedEntry {
    pub fn from_ops(prepared_id: Option<u64>, prepare_ts: Timestamp, ops: &[TxnOp]) -> Self {
        let mut keys = Vec::new();
        let mut truncates = Vec::new();
        for op in ops {
            match op {
                TxnOp::Update { btree, key, .. } => keys.push((*btree, key.clone())),
                TxnOp::Truncate { btree, lower, upper } => truncates.push((*btree, lower.clone(), upper.clone())),
            }
        }
        keys.sort();
        keys.dedup();
        Self { prepared_id, prepare_ts, keys, truncates }
    }

    /// Operations that resolve this entry's changes.
    pub fn ops(&self) -> Vec<TxnOp> {
        let mut ops: Vec<TxnOp> = self
            .keys
            .iter()
            .map(|(btree, key)| TxnOp::Update { btree: *btree, key: key.clone() })
            .collect();
        ops.extend(
            self.truncates
                .iter()
                .map(|(btree, lower, upper)| TxnOp::Truncate { btree: *btree, lower: lower.clone(), upper: upper.clone() }),
        );
        ops
    }
}

/// Catalog of prepared transactions keyed by the transaction id they had
/// when the checkpoint was taken.
pub(crate) type PreparedCatalog = BTreeMap<u64, PreparedEntry>;

/// A prepared transaction reinstated after restart, waiting to be claimed.
#[derive(Debug, Clone)]
pub(crate) struct RecoveredPrepared {
    /// Id assigned in this run; owns the reinstated prepared updates.
    pub txn_id: u64,
    pub prepared_id: u64,
    pub prepare_ts: Timestamp,
    pub ops: Vec<TxnOp>,
}

/// Validates (and possibly rounds) a prepare timestamp.
///
/// The prepare timestamp must be newer than the stable timestamp and the
/// oldest timestamp. With `roundup` a timestamp older than oldest is moved
/// up to oldest and the stable check is skipped.
pub(crate) fn check_prepare_timestamp(
    record: &TimestampRecord,
    prepare_ts: Timestamp,
    read_ts: Option<Timestamp>,
    roundup: bool,
) -> Result<Timestamp> {
    if prepare_ts == TS_NONE {
        return Err(Error::invalid("prepare timestamp must be non-zero"));
    }
    let mut ts = prepare_ts;
    if roundup && record.oldest != TS_NONE && ts < record.oldest {
        ts = record.oldest;
    }
    if let Some(read_ts) = read_ts {
        if ts < read_ts {
            return Err(Error::invalid(format!(
                "prepare timestamp {ts} must not be older than the read timestamp {read_ts}"
            )));
        }
    }
    if roundup {
        return Ok(ts);
    }
    if record.stable != TS_NONE && ts <= record.stable {
        return Err(Error::invalid(format!(
            "prepare timestamp {ts} is not newer than the stable timestamp {}",
            record.stable
        )));
    }
    if record.oldest != TS_NONE && ts <= record.oldest {
        return Err(Error::invalid(format!(
            "prepare timestamp {ts} is not newer than the oldest timestamp {}",
            record.oldest
        )));
    }
    Ok(ts)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn record(oldest: Timestamp, stable: Timestamp) -> TimestampRecord {
        TimestampRecord { oldest, stable, ..Default::default() }
    }

    #[test]
    fn test_prepare_must_follow_stable() {
        let ts = record(10, 100);
        assert!(check_prepare_timestamp(&ts, 100, None, false).is_err());
        assert!(check_prepare_timestamp(&ts, 99, None, false).is_err());
        assert_eq!(check_prepare_timestamp(&ts, 101, None, false).unwrap(), 101);
        assert!(check_prepare_timestamp(&ts, 0, None, false).is_err());
    }

    #[test]
    fn test_roundup_moves_to_oldest() {
        let ts = record(50, 60);
        assert_eq!(check_prepare_timestamp(&ts, 20, None, true).unwrap(), 50);
        assert!(check_prepare_timestamp(&ts, 20, None, false).is_err());
    }

    #[test]
    fn test_entry_ops_round_trip() {
        let ops = vec![
            TxnOp::Update { btree: 2, key: b"b".to_vec() },
            TxnOp::Update { btree: 2, key: b"a".to_vec() },
            TxnOp::Update { btree: 2, key: b"a".to_vec() },
            TxnOp::Truncate { btree: 3, lower: b"x".to_vec(), upper: None },
        ];
        let entry = PreparedEntry::from_ops(Some(7), 200, &ops);
        assert_eq!(entry.keys, vec![(2, b"a".to_vec()), (2, b"b".to_vec())]);
        assert_eq!(entry.ops().len(), 3);
    }
}
