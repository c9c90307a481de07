//! Cursors.
//!
//! A [`Cursor`] belongs to one session and reads and writes through that
//! session's transaction. Keys and values are [`Row`]s packed with the
//! object's `key_format` and `value_format`; raw cursors take and return
//! the packed bytes.
//!
//! ## Structure
//!
//! - `data.rs`: tables, files, column groups, indices and layered tables
//! - `list.rs`: `metadata:`, `statistics:`, `backup:` and
//!   `prepared_discover:`, all fixed at open

mod data;
mod list;

use cellar_types::{
    Row,
    config::{ConfigSection, CursorConfig},
};
pub(crate) use data::{remove_indexed, visible_next};
use data::DataCursor;
use list::{BackupCursor, ListCursor};

use crate::{
    conn::DataTarget,
    error::{Error, Result},
    modify::ModifyEntry,
    schema::Uri,
    session::Session,
};

enum Kind {
    Data(Box<DataCursor>),
    List(ListCursor),
    Backup(BackupCursor),
}

/// A cursor over one object.
pub struct Cursor<'s> {
    session: &'s Session,
    uri: String,
    kind: Kind,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("uri", &self.uri).finish()
    }
}

/// Opens a cursor on `uri` for `session`.
pub(crate) fn open<'s>(session: &'s Session, uri: &str, config: &str) -> Result<Cursor<'s>> {
    let cfg = CursorConfig::parse(config)?;
    let conn = session.conn();
    conn.check_open()?;
    let kind = match Uri::parse(uri)? {
        Uri::Metadata => Kind::List(ListCursor::metadata(conn)),
        Uri::Statistics(target) => Kind::List(ListCursor::statistics(conn, target.as_deref(), &cfg)?),
        Uri::PreparedDiscover => Kind::List(ListCursor::prepared(conn)),
        Uri::Backup => Kind::Backup(BackupCursor::open(conn, &cfg)?),
        Uri::Table(_) | Uri::Colgroup { .. } | Uri::Index { .. } | Uri::File(_) | Uri::Layered(_) => {
            Kind::Data(Box::new(DataCursor::open(conn, uri, cfg, session.epoch())?))
        },
    };
    Ok(Cursor { session, uri: uri.to_string(), kind })
}

impl Cursor<'_> {
    /// The URI the cursor was opened on.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn list(&mut self) -> Option<&mut ListCursor> {
        match &mut self.kind {
            Kind::List(list) => Some(list),
            Kind::Backup(backup) => Some(&mut backup.list),
            Kind::Data(_) => None,
        }
    }

    /// Runs a data-cursor operation in the session's transaction.
    fn data_op<R>(
        &mut self,
        write: bool,
        f: impl FnOnce(&mut DataCursor, &mut crate::session::Op<'_>) -> Result<R>,
    ) -> Result<R> {
        let session = self.session;
        match &mut self.kind {
            Kind::Data(data) => {
                data.sync(session.epoch());
                session.run(write, |op| f(&mut **data, op))
            },
            Kind::List(_) | Kind::Backup(_) => Err(Error::unsupported(format!("{}: cursor is read-only", self.uri))),
        }
    }

    /// Sets the key for the next operation.
    pub fn set_key(&mut self, key: impl Into<Row>) {
        let key = key.into();
        match &mut self.kind {
            Kind::Data(data) => data.set_key(key),
            Kind::List(list) => list.set_key(key),
            Kind::Backup(backup) => backup.list.set_key(key),
        }
    }

    /// Sets the value for the next write.
    pub fn set_value(&mut self, value: impl Into<Row>) {
        if let Kind::Data(data) = &mut self.kind {
            data.set_value(value.into());
        }
    }

    /// The key at the cursor's position, or the key last set.
    pub fn get_key(&self) -> Result<Row> {
        match &self.kind {
            Kind::Data(data) => data.get_key(),
            Kind::List(list) => list.get_key(),
            Kind::Backup(backup) => backup.list.get_key(),
        }
    }

    /// The value at the cursor's position.
    pub fn get_value(&self) -> Result<Row> {
        match &self.kind {
            Kind::Data(data) => data.get_value(),
            Kind::List(list) => list.get_value(),
            Kind::Backup(backup) => backup.list.get_value(),
        }
    }

    /// Moves to the next key; from an unpositioned cursor, the first.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] past the last key, leaving the cursor unpositioned.
    pub fn next(&mut self) -> Result<()> {
        if let Some(list) = self.list() {
            return list.step(true);
        }
        self.data_op(false, |data, op| data.step(op, true))
    }

    /// Moves to the previous key; from an unpositioned cursor, the last.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] before the first key.
    pub fn prev(&mut self) -> Result<()> {
        if let Some(list) = self.list() {
            return list.step(false);
        }
        self.data_op(false, |data, op| data.step(op, false))
    }

    /// Positions on the key set with [`set_key`](Self::set_key).
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when no visible value exists;
    /// [`Error::PrepareConflict`] on a prepared update.
    pub fn search(&mut self) -> Result<()> {
        if let Some(list) = self.list() {
            return list.search();
        }
        self.data_op(false, |data, op| data.search(op))
    }

    /// Positions on the key or its nearest visible neighbour. Returns 0
    /// for an exact match, 1 when the cursor landed on a larger key and -1
    /// for a smaller one.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when nothing is visible.
    pub fn search_near(&mut self) -> Result<i32> {
        if let Some(list) = self.list() {
            return list.search_near();
        }
        self.data_op(false, |data, op| data.search_near(op))
    }

    /// Inserts the key and value. With `append` on a record-number table
    /// the key is allocated and available from [`get_key`](Self::get_key).
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateKey`] with `overwrite=false` when the key exists;
    /// [`Error::Rollback`] on a write conflict.
    pub fn insert(&mut self) -> Result<()> {
        self.data_op(true, |data, op| data.insert(op))
    }

    /// Replaces the value of the key.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] with `overwrite=false` when the key does not exist.
    pub fn update(&mut self) -> Result<()> {
        self.data_op(true, |data, op| data.update(op))
    }

    /// Removes the key.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the key does not exist.
    pub fn remove(&mut self) -> Result<()> {
        self.data_op(true, |data, op| data.remove(op))
    }

    /// Claims the key for the running transaction without changing it.
    pub fn reserve(&mut self) -> Result<()> {
        self.data_op(true, |data, op| data.reserve(op))
    }

    /// Applies byte-range replacements to the value of the key.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] outside an explicit snapshot transaction;
    /// [`Error::Unsupported`] for value formats other than `S` and `u`.
    pub fn modify(&mut self, entries: &[ModifyEntry]) -> Result<()> {
        self.data_op(true, |data, op| data.modify(op, entries))
    }

    /// Positions on the largest key in the object, visible or not.
    pub fn largest_key(&mut self) -> Result<()> {
        match &mut self.kind {
            Kind::Data(data) => data.largest_key(),
            Kind::List(list) => list.largest_key(),
            Kind::Backup(backup) => backup.list.largest_key(),
        }
    }

    /// Sets (`action=set,bound=lower|upper,inclusive=…`) or clears
    /// (`action=clear`) a bound from the current key.
    pub fn bound(&mut self, config: &str) -> Result<()> {
        match &mut self.kind {
            Kind::Data(data) => {
                data.sync(self.session.epoch());
                data.bound(config)
            },
            Kind::List(_) | Kind::Backup(_) => Err(Error::unsupported(format!("{}: bounds", self.uri))),
        }
    }

    /// Unpositions the cursor and clears its key, value and bounds.
    pub fn reset(&mut self) -> Result<()> {
        let conn = self.session.conn();
        match &mut self.kind {
            Kind::Data(data) => data.reset(conn),
            Kind::List(list) => {
                list.reset();
                Ok(())
            },
            Kind::Backup(backup) => {
                backup.list.reset();
                Ok(())
            },
        }
    }

    /// Closes the cursor. Dropping it has the same effect.
    pub fn close(mut self) -> Result<()> {
        self.reset()
    }

    pub(crate) fn data_target(&self) -> Option<&DataTarget> {
        match &self.kind {
            Kind::Data(data) => Some(&data.target),
            Kind::List(_) | Kind::Backup(_) => None,
        }
    }

    /// The packed key of the cursor's position or its set key.
    pub(crate) fn packed_key(&self) -> Result<Vec<u8>> {
        match &self.kind {
            Kind::Data(data) => data.packed_key(),
            Kind::List(_) | Kind::Backup(_) => Err(Error::invalid(format!("{}: not a data cursor", self.uri))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{conn::Connection, stats::Stat};

    fn setup(config: &str) -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,statistics=(fast)").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", config).unwrap();
        (dir, conn)
    }

    fn keys(c: &mut Cursor<'_>, forward: bool) -> Vec<i64> {
        let mut out = Vec::new();
        loop {
            let step = if forward { c.next() } else { c.prev() };
            match step {
                Ok(()) => out.push(c.get_key().unwrap().as_i64().unwrap()),
                Err(e) if e.is_not_found() => return out,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn test_insert_search_update_remove() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1i64);
        c.set_value("one");
        c.insert().unwrap();
        c.set_key(1i64);
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_str(), Some("one"));

        c.set_value("uno");
        c.update().unwrap();
        c.set_key(1i64);
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_str(), Some("uno"));

        c.set_key(1i64);
        c.remove().unwrap();
        c.set_key(1i64);
        assert!(c.search().unwrap_err().is_not_found());
        c.set_key(1i64);
        assert!(c.remove().unwrap_err().is_not_found());
        assert_eq!(conn.stat(Stat::CursorInsert), 1);
    }

    #[test]
    fn test_overwrite_false() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "overwrite=false").unwrap();
        c.set_key(7i64);
        c.set_value("a");
        c.insert().unwrap();
        c.set_key(7i64);
        c.set_value("b");
        assert!(matches!(c.insert(), Err(Error::DuplicateKey)));
        c.set_key(8i64);
        c.set_value("b");
        assert!(c.update().unwrap_err().is_not_found());
    }

    #[test]
    fn test_iteration_both_ways() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for i in [5i64, -3, 9, 0] {
            c.set_key(i);
            c.set_value("v");
            c.insert().unwrap();
        }
        assert_eq!(keys(&mut c, true), vec![-3, 0, 5, 9]);
        assert_eq!(keys(&mut c, false), vec![9, 5, 0, -3]);
    }

    #[test]
    fn test_search_near_directions() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for i in [10i64, 20] {
            c.set_key(i);
            c.set_value("v");
            c.insert().unwrap();
        }
        c.set_key(10i64);
        assert_eq!(c.search_near().unwrap(), 0);
        c.set_key(15i64);
        assert_eq!(c.search_near().unwrap(), 1);
        assert_eq!(c.get_key().unwrap().as_i64(), Some(20));
        c.set_key(25i64);
        assert_eq!(c.search_near().unwrap(), -1);
        assert_eq!(c.get_key().unwrap().as_i64(), Some(20));
    }

    #[test]
    fn test_bounds_limit_iteration() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for i in 0..10i64 {
            c.set_key(i);
            c.set_value("v");
            c.insert().unwrap();
        }
        c.set_key(3i64);
        c.bound("bound=lower,inclusive=false").unwrap();
        c.set_key(6i64);
        c.bound("bound=upper").unwrap();
        assert_eq!(keys(&mut c, true), vec![4, 5, 6]);
        assert_eq!(keys(&mut c, false), vec![6, 5, 4]);
        c.set_key(1i64);
        assert!(c.search().unwrap_err().is_not_found());

        c.set_key(2i64);
        assert!(matches!(c.bound("bound=upper"), Err(Error::InvalidArgument { .. })));
        c.reset().unwrap();
        assert_eq!(keys(&mut c, true).len(), 10);
    }

    #[test]
    fn test_bounds_cleared_when_transaction_ends() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for i in 0..10i64 {
            c.set_key(i);
            c.set_value("v");
            c.insert().unwrap();
        }
        let bound = |c: &mut Cursor<'_>| {
            c.set_key(7i64);
            c.bound("bound=lower").unwrap();
        };

        session.begin_transaction("").unwrap();
        bound(&mut c);
        assert_eq!(keys(&mut c, true), vec![7, 8, 9]);
        session.commit_transaction("").unwrap();
        assert_eq!(keys(&mut c, true).len(), 10);

        session.begin_transaction("").unwrap();
        bound(&mut c);
        session.rollback_transaction("").unwrap();
        assert_eq!(keys(&mut c, true).len(), 10);

        bound(&mut c);
        session.checkpoint("").unwrap();
        assert_eq!(keys(&mut c, true).len(), 10);

        bound(&mut c);
        session.reset().unwrap();
        assert_eq!(keys(&mut c, true).len(), 10);

        bound(&mut c);
        session.reconfigure("isolation=snapshot").unwrap();
        assert_eq!(keys(&mut c, true).len(), 10);

        // Without an epoch change the bound holds.
        bound(&mut c);
        assert_eq!(keys(&mut c, true), vec![7, 8, 9]);
    }

    #[test]
    fn test_append_allocates_record_numbers() {
        let (_dir, conn) = setup("key_format=r,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "append").unwrap();
        for value in ["a", "b", "c"] {
            c.set_value(value);
            c.insert().unwrap();
        }
        assert_eq!(c.get_key().unwrap().as_u64(), Some(3));
        c.set_key(2u64);
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_str(), Some("b"));
    }

    #[test]
    fn test_fixed_length_remove_reads_zero() {
        let (_dir, conn) = setup("key_format=r,value_format=8t");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for recno in 1..=3u64 {
            c.set_key(recno);
            c.set_value(7u8);
            c.insert().unwrap();
        }
        c.set_key(2u64);
        c.remove().unwrap();
        c.set_key(2u64);
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_u64(), Some(0));

        // Removing past the end grows the table with zeroed records.
        c.set_key(5u64);
        c.remove().unwrap();
        c.reset().unwrap();
        let mut seen = Vec::new();
        while c.next().is_ok() {
            seen.push((c.get_key().unwrap().as_u64().unwrap(), c.get_value().unwrap().as_u64().unwrap()));
        }
        assert_eq!(seen, vec![(1, 7), (2, 0), (3, 7), (4, 0), (5, 0)]);

        c.set_key(0u64);
        assert!(c.remove().is_err());
    }

    #[test]
    fn test_fixed_length_iteration_yields_gap_records() {
        let (_dir, conn) = setup("key_format=r,value_format=8t");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for recno in [2u64, 5] {
            c.set_key(recno);
            c.set_value(9u8);
            c.insert().unwrap();
        }

        let mut forward = Vec::new();
        while c.next().is_ok() {
            forward.push((c.get_key().unwrap().as_u64().unwrap(), c.get_value().unwrap().as_u64().unwrap()));
        }
        assert_eq!(forward, vec![(1, 0), (2, 9), (3, 0), (4, 0), (5, 9)]);

        c.reset().unwrap();
        let mut backward = Vec::new();
        while c.prev().is_ok() {
            backward.push(c.get_key().unwrap().as_u64().unwrap());
        }
        assert_eq!(backward, vec![5, 4, 3, 2, 1]);

        // Iteration and point lookups agree on a gap.
        c.set_key(3u64);
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_u64(), Some(0));
    }

    #[test]
    fn test_modify_needs_explicit_transaction() {
        let (_dir, conn) = setup("key_format=S,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key("k");
        c.set_value("hello world");
        c.insert().unwrap();

        c.set_key("k");
        let entries = [ModifyEntry::new("there", 6, 5)];
        assert!(matches!(c.modify(&entries), Err(Error::InvalidArgument { .. })));
        session.begin_transaction("").unwrap();
        c.set_key("k");
        c.modify(&entries).unwrap();
        assert_eq!(c.get_value().unwrap().as_str(), Some("hello there"));
        session.commit_transaction("").unwrap();
        c.set_key("k");
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_str(), Some("hello there"));
    }

    #[test]
    fn test_reserve_claims_key_without_changing_it() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let other = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1i64);
        c.set_value("kept");
        c.insert().unwrap();

        c.set_key(1i64);
        assert!(matches!(c.reserve(), Err(Error::InvalidArgument { .. })));
        session.begin_transaction("").unwrap();
        c.set_key(1i64);
        c.reserve().unwrap();
        assert_eq!(c.get_value().unwrap().as_str(), Some("kept"));

        let mut o = other.open_cursor("table:t", "").unwrap();
        o.set_key(1i64);
        o.set_value("stolen");
        assert!(o.update().unwrap_err().is_rollback());
        session.commit_transaction("").unwrap();

        o.set_key(1i64);
        o.search().unwrap();
        assert_eq!(o.get_value().unwrap().as_str(), Some("kept"));
    }

    #[test]
    fn test_largest_key_ignores_visibility() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let writer = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        assert!(c.largest_key().unwrap_err().is_not_found());
        for i in [1i64, 5, 3] {
            c.set_key(i);
            c.set_value("v");
            c.insert().unwrap();
        }

        writer.begin_transaction("").unwrap();
        let mut w = writer.open_cursor("table:t", "").unwrap();
        w.set_key(99i64);
        w.set_value("uncommitted");
        w.insert().unwrap();

        c.largest_key().unwrap();
        assert_eq!(c.get_key().unwrap().as_i64(), Some(99));
        c.set_key(99i64);
        assert!(c.search().unwrap_err().is_not_found());
        drop(w);
        writer.rollback_transaction("").unwrap();
    }

    #[test]
    fn test_raw_cursor_sees_packed_bytes() {
        let (_dir, conn) = setup("key_format=S,value_format=u");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key("k");
        c.set_value(b"abc".as_slice());
        c.insert().unwrap();
        let mut raw = session.open_cursor("table:t", "raw").unwrap();
        raw.next().unwrap();
        assert_eq!(raw.get_key().unwrap().as_bytes(), Some(b"k\0".as_slice()));
        assert_eq!(raw.get_value().unwrap().as_bytes(), Some(b"abc".as_slice()));
    }

    #[test]
    fn test_index_cursor_reads_through_primary() {
        let (_dir, conn) = setup("key_format=q,value_format=SS,columns=(id,name,city)");
        let session = conn.open_session("").unwrap();
        session.create("index:t:city", "columns=(city)").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for (id, name, city) in [(1i64, "ann", "oslo"), (2, "bob", "lima"), (3, "cy", "oslo")] {
            c.set_key(id);
            c.set_value((name, city));
            c.insert().unwrap();
        }
        c.set_key(2i64);
        c.set_value(("bob", "rome"));
        c.update().unwrap();

        let mut idx = session.open_cursor("index:t:city", "").unwrap();
        let mut cities = Vec::new();
        while idx.next().is_ok() {
            cities.push(idx.get_key().unwrap().as_str().unwrap().to_string());
        }
        assert_eq!(cities, vec!["oslo", "oslo", "rome"]);

        idx.set_key("rome");
        idx.search().unwrap();
        assert_eq!(idx.get_value().unwrap().as_str(), Some("bob"));
        idx.set_key("lima");
        assert!(idx.search().unwrap_err().is_not_found());
        idx.set_key("x");
        assert!(matches!(idx.insert(), Err(Error::Unsupported { .. })));
    }

    #[test]
    fn test_position_cleared_by_commit() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        for i in 0..3i64 {
            c.set_key(i);
            c.set_value("v");
            c.insert().unwrap();
        }
        session.begin_transaction("").unwrap();
        c.next().unwrap();
        c.next().unwrap();
        session.commit_transaction("").unwrap();
        c.next().unwrap();
        assert_eq!(c.get_key().unwrap().as_i64(), Some(0));
    }

    #[test]
    fn test_metadata_and_statistics_cursors() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut meta = session.open_cursor("metadata:", "").unwrap();
        let mut uris = Vec::new();
        while meta.next().is_ok() {
            uris.push(meta.get_key().unwrap().as_str().unwrap().to_string());
        }
        assert!(uris.iter().any(|u| u == "table:t"));
        assert!(matches!(meta.insert(), Err(Error::Unsupported { .. })));

        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1i64);
        c.set_value("v");
        c.insert().unwrap();
        let mut stats = session.open_cursor("statistics:", "").unwrap();
        stats.set_key(Stat::CursorInsert.id());
        stats.search().unwrap();
        let value = stats.get_value().unwrap();
        assert_eq!(value.get(0).and_then(|i| i.as_str()), Some(Stat::CursorInsert.description()));
        assert_eq!(value.get(2).and_then(|i| i.to_i64()), Some(1));
    }

    #[test]
    fn test_statistics_cursor_needs_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let session = conn.open_session("").unwrap();
        assert!(matches!(session.open_cursor("statistics:", ""), Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn test_checkpoint_cursor_is_read_only_snapshot() {
        let (_dir, conn) = setup("key_format=q,value_format=S");
        let session = conn.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key(1i64);
        c.set_value("before");
        c.insert().unwrap();
        session.checkpoint("").unwrap();
        c.set_key(1i64);
        c.set_value("after");
        c.update().unwrap();

        let mut ckpt = session.open_cursor("table:t", "checkpoint=WiredTigerCheckpoint").unwrap();
        ckpt.set_key(1i64);
        ckpt.search().unwrap();
        assert_eq!(ckpt.get_value().unwrap().as_str(), Some("before"));
        ckpt.set_value("x");
        assert!(matches!(ckpt.update(), Err(Error::ReadOnly)));
    }
}
