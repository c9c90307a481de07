//! cellar-store: a transactional, timestamped key-value storage engine.
//!
//! Applications open a [`Connection`] on a home directory, open
//! [`Session`]s on it and read and write through [`Cursor`]s. Every
//! change belongs to a transaction; transactions see a snapshot of the
//! committed state and may read and commit at application timestamps.
//!
//! - **Btrees** of row-store, variable-length and fixed-length column-store
//!   objects, with per-key MVCC update chains and a history store
//! - **Checkpoints** write dirty pages copy-on-write and commit them with
//!   one atomic metadata write
//! - **Write-ahead log** with recovery, optional and per-table
//! - **Rollback to stable** removes everything newer than the stable
//!   timestamp
//! - **Backup**, live restore and layered (disaggregated) tables
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Connection / Session / Cursor        │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │             Transaction Layer               │
//! │  (snapshots, timestamps, prepare, commit)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │      Btrees, history store, eviction        │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │   Reconciliation, checkpoint, block files   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use cellar_store::Connection;
//!
//! let conn = Connection::open("db", "create")?;
//! let session = conn.open_session("")?;
//! session.create("table:users", "key_format=S,value_format=S")?;
//!
//! let mut cursor = session.open_cursor("table:users", "")?;
//! cursor.set_key("alice");
//! cursor.set_value("admin");
//! cursor.insert()?;
//!
//! cursor.set_key("alice");
//! cursor.search()?;
//! assert_eq!(cursor.get_value()?.as_str(), Some("admin"));
//! # Ok::<(), cellar_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]
#![allow(clippy::type_complexity)]

mod backup;
mod bitmap;
mod block;
mod btree;
mod checkpoint;
mod compact;
mod conn;
mod cursor;
mod disagg;
mod env;
pub mod error;
mod evict;
mod hs;
mod live_restore;
pub mod log;
mod meta;
pub mod metrics;
pub mod modify;
mod page;
mod reconcile;
mod rts;
mod schema;
mod server;
mod session;
pub mod stats;
mod truncate;
mod txn;
mod update;
mod verify;

pub use cellar_types::{Format, Item, Row, TS_MAX, TS_NONE, Timestamp};
pub use compact::CompactOutcome;
pub use conn::{ConnTimestamp, Connection, LOCK_FILE, TxnTimestamp, VERSION_FILE};
pub use cursor::Cursor;
pub use error::{Error, Result};
pub use hs::HS_URI;
pub use live_restore::LiveRestoreState;
pub use meta::{DEFAULT_CHECKPOINT, META_FILE, MetaHook, MetaStep};
pub use modify::{ModifyEntry, apply_modifies, calc_modify};
pub use page::cache::CacheUsage;
pub use rts::RtsStats;
pub use schema::FILE_SUFFIX;
pub use session::Session;
pub use stats::{Stat, StatEntry};
pub use truncate::TruncateOutcome;
pub use txn::TimestampRecord;
pub use verify::{SalvageOutcome, VerifyReport};
