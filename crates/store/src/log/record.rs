//! Log records.
//!
//! Every record is postcard-encoded and framed with a length and an XXH3
//! checksum. A reader stops at the first all-zero frame (pre-allocated or
//! zero-filled space) or at the first torn frame.

use std::fmt;

use cellar_types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::modify::ModifyEntry;

/// Position of a record: log file number and byte offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn {
    /// Log file number.
    pub file: u32,
    /// Byte offset inside the file.
    pub offset: u64,
}

impl Lsn {
    /// Creates an LSN.
    pub fn new(file: u32, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.file, self.offset)
    }
}

/// One change inside a commit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// Full value written.
    Put {
        /// Tree id.
        btree: u64,
        /// Tree key.
        key: Vec<u8>,
        /// New value.
        value: Vec<u8>,
    },
    /// Key removed.
    Remove {
        /// Tree id.
        btree: u64,
        /// Tree key.
        key: Vec<u8>,
    },
    /// Partial update.
    Modify {
        /// Tree id.
        btree: u64,
        /// Tree key.
        key: Vec<u8>,
        /// Byte replacements.
        entries: Vec<ModifyEntry>,
    },
    /// Range removal; an open bound runs to the end of the tree.
    Truncate {
        /// Tree id.
        btree: u64,
        /// First key removed.
        lower: Option<Vec<u8>>,
        /// Last key removed.
        upper: Option<Vec<u8>>,
    },
}

impl LogOp {
    /// Tree the operation applies to.
    pub fn btree(&self) -> u64 {
        match self {
            LogOp::Put { btree, .. }
            | LogOp::Remove { btree, .. }
            | LogOp::Modify { btree, .. }
            | LogOp::Truncate { btree, .. } => *btree,
        }
    }

    fn to_json(&self, hex: bool) -> Value {
        let bytes = |b: &[u8]| render(b, hex);
        match self {
            LogOp::Put { btree, key, value } => {
                json!({ "optype": "row_put", "fileid": btree, "key": bytes(key), "value": bytes(value) })
            },
            LogOp::Remove { btree, key } => json!({ "optype": "row_remove", "fileid": btree, "key": bytes(key) }),
            LogOp::Modify { btree, key, entries } => json!({
                "optype": "row_modify",
                "fileid": btree,
                "key": bytes(key),
                "modify": entries
                    .iter()
                    .map(|e| json!({ "data": bytes(&e.data), "offset": e.offset, "size": e.size }))
                    .collect::<Vec<_>>(),
            }),
            LogOp::Truncate { btree, lower, upper } => json!({
                "optype": "row_truncate",
                "fileid": btree,
                "start": lower.as_deref().map(bytes),
                "stop": upper.as_deref().map(bytes),
            }),
        }
    }
}

/// A log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// First record of every file.
    FileHeader {
        /// Log format version.
        version: u16,
        /// Number of this file.
        file_num: u32,
    },
    /// A committed transaction's changes to logged trees.
    Commit {
        /// Transaction id.
        txn_id: u64,
        /// Commit timestamp, zero when none.
        commit_ts: Timestamp,
        /// Durable timestamp, zero when none.
        durable_ts: Timestamp,
        /// Changes in the order they were made.
        ops: Vec<LogOp>,
    },
    /// A checkpoint completed; recovery may start at `ckpt_lsn`.
    Checkpoint {
        /// First record the checkpoint does not cover.
        ckpt_lsn: Lsn,
    },
    /// A tree's file was synced by a checkpoint.
    FileSync {
        /// Tree id.
        btree_id: u64,
        /// True at the start of the sync, false at the end.
        start: bool,
    },
    /// Application message from `log_printf`.
    Message {
        /// Message text.
        text: String,
    },
    /// Link to the last record of the previous file.
    System {
        /// Position of that record.
        prev_lsn: Lsn,
    },
}

/// Log format version written into file headers.
pub const LOG_VERSION: u16 = 1;

impl LogRecord {
    /// Type name used by `printlog`.
    pub fn type_name(&self) -> &'static str {
        match self {
            LogRecord::FileHeader { .. } => "file_header",
            LogRecord::Commit { .. } => "commit",
            LogRecord::Checkpoint { .. } => "checkpoint",
            LogRecord::FileSync { .. } => "file_sync",
            LogRecord::Message { .. } => "message",
            LogRecord::System { .. } => "system",
        }
    }

    /// JSON rendering for `printlog`. Keys and values print as escaped
    /// text, or as hex with `hex`.
    pub fn to_json(&self, lsn: Lsn, hex: bool) -> Value {
        let mut out = json!({
            "lsn": [lsn.file, lsn.offset],
            "type": self.type_name(),
        });
        let body = match self {
            LogRecord::FileHeader { version, file_num } => json!({ "version": version, "file": file_num }),
            LogRecord::Commit { txn_id, commit_ts, durable_ts, ops } => json!({
                "txnid": txn_id,
                "commit_ts": commit_ts,
                "durable_ts": durable_ts,
                "ops": ops.iter().map(|op| op.to_json(hex)).collect::<Vec<_>>(),
            }),
            LogRecord::Checkpoint { ckpt_lsn } => json!({ "ckpt_lsn": [ckpt_lsn.file, ckpt_lsn.offset] }),
            LogRecord::FileSync { btree_id, start } => json!({ "fileid": btree_id, "start": start }),
            LogRecord::Message { text } => json!({ "message": text }),
            LogRecord::System { prev_lsn } => json!({ "prev_lsn": [prev_lsn.file, prev_lsn.offset] }),
        };
        if let (Value::Object(out), Value::Object(body)) = (&mut out, body) {
            out.extend(body);
        }
        out
    }
}

/// Escapes bytes the way `dump -p` does: printable ASCII as-is, the rest
/// as `\xx`.
pub fn printable(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        if b == b'\\' {
            out.push_str("\\\\");
        } else if b.is_ascii_graphic() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{b:02x}"));
        }
    }
    out
}

/// Lower-case hex.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn render(bytes: &[u8], as_hex: bool) -> String {
    if as_hex { hex(bytes) } else { printable(bytes) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use cellar_types::codec;

    use super::*;

    #[test]
    fn test_lsn_orders_by_file_then_offset() {
        assert!(Lsn::new(1, 500) < Lsn::new(2, 0));
        assert!(Lsn::new(2, 10) < Lsn::new(2, 11));
        assert_eq!(Lsn::new(3, 128).to_string(), "[3,128]");
    }

    #[test]
    fn test_commit_json_shows_ops() {
        let rec = LogRecord::Commit {
            txn_id: 9,
            commit_ts: 0,
            durable_ts: 0,
            ops: vec![
                LogOp::Put { btree: 2, key: b"k\x01".to_vec(), value: b"v".to_vec() },
                LogOp::Remove { btree: 2, key: b"gone".to_vec() },
            ],
        };
        let text = rec.to_json(Lsn::new(1, 64), false);
        assert_eq!(text["type"], "commit");
        assert_eq!(text["ops"][0]["key"], "k\\01");
        assert_eq!(text["ops"][1]["optype"], "row_remove");
        let hexed = rec.to_json(Lsn::new(1, 64), true);
        assert_eq!(hexed["ops"][0]["key"], "6b01");
    }

    #[test]
    fn test_framed_record_decodes() {
        let rec = LogRecord::Message { text: "hello".into() };
        let framed = codec::encode_framed(&rec).unwrap();
        let (back, used): (LogRecord, usize) = codec::decode_framed(&framed).unwrap().unwrap();
        assert_eq!(back, rec);
        assert_eq!(used, framed.len());
        assert!(codec::decode_framed::<LogRecord>(&[0u8; 16]).unwrap().is_none());
    }
}
