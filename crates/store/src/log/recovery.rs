//! Log replay.
//!
//! Recovery reapplies every commit record at or after the checkpoint LSN
//! to the logged trees that still exist. Writes are global (no transaction)
//! and carry the record's commit and durable timestamps, so replaying a
//! change the checkpoint already holds just adds an identical version.

use std::sync::Arc;

use cellar_types::TS_NONE;
use tracing::{debug, info};

use super::{LogOp, LogRecord, Lsn};
use crate::{
    btree::{Btree, Expect, KeyRange, TreeKind, WriteCtx},
    error::{Error, Result},
    txn::Reader,
    update::UpdateKind,
};

/// What a replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReplayStats {
    pub commits: u64,
    pub ops: u64,
    /// Operations on trees that no longer exist or are not logged.
    pub skipped: u64,
    pub max_txn_id: u64,
}

/// The update that removes a key from `tree`.
pub(crate) fn removal(tree: &Btree) -> UpdateKind {
    if tree.kind == TreeKind::ColFix { UpdateKind::Standard(vec![0]) } else { UpdateKind::Tombstone }
}

fn apply(tree: &Btree, op: &LogOp, ctx: &WriteCtx<'_>) -> Result<()> {
    match op {
        LogOp::Put { key, value, .. } => tree.write(key, UpdateKind::Standard(value.clone()), ctx, Expect::Any),
        LogOp::Remove { key, .. } => tree.write(key, removal(tree), ctx, Expect::Any),
        LogOp::Modify { key, entries, .. } => {
            match tree.write(key, UpdateKind::Modify(entries.clone()), ctx, Expect::Any) {
                Err(Error::NotFound) => Ok(()),
                other => other,
            }
        },
        LogOp::Truncate { lower, upper, .. } => {
            let range = KeyRange { lower: lower.clone(), upper: upper.clone() };
            let reader = Reader::global();
            let mut pos: Option<Vec<u8>> = None;
            while let Some((key, _)) = tree.walk(pos.as_deref(), true, &range, &reader, None)? {
                tree.write(&key, removal(tree), ctx, Expect::Any)?;
                pos = Some(key);
            }
            Ok(())
        },
    }
}

/// Replays `records` from `from` onwards. `tree` resolves a btree id to an
/// open logged tree.
pub(crate) fn replay<F>(records: &[(Lsn, LogRecord)], from: Lsn, tree: F) -> Result<ReplayStats>
where
    F: Fn(u64) -> Option<Arc<Btree>>,
{
    let mut stats = ReplayStats::default();
    for (lsn, record) in records {
        if *lsn < from {
            continue;
        }
        let LogRecord::Commit { txn_id, commit_ts, durable_ts, ops } = record else { continue };
        stats.commits += 1;
        stats.max_txn_id = stats.max_txn_id.max(*txn_id);
        let durable = if *durable_ts == TS_NONE { *commit_ts } else { *durable_ts };
        let ctx = WriteCtx { durable_ts: durable, ..WriteCtx::global_at(*commit_ts) };
        for op in ops {
            match tree(op.btree()) {
                Some(target) if target.is_logged() => {
                    apply(&target, op, &ctx)?;
                    stats.ops += 1;
                },
                _ => stats.skipped += 1,
            }
        }
        debug!(lsn = %lsn, txn_id, ops = ops.len(), "replayed commit");
    }
    info!(commits = stats.commits, ops = stats.ops, skipped = stats.skipped, "log replay complete");
    Ok(stats)
}
