//! Cursors over a list of rows fixed at open: `metadata:`, `statistics:`,
//! `backup:` and `prepared_discover:`.

use std::{cmp::Ordering, sync::Arc};

use cellar_types::{
    Item, Row,
    config::{CursorConfig, StatisticsLevel},
};

use crate::{
    backup::{close_backup, open_backup},
    conn::ConnInner,
    error::{Error, Result},
};

/// Orders items numerically when both are numbers, so a statistics key
/// set from an `i32` finds the `u32` id.
fn cmp_items(a: &Item, b: &Item) -> Ordering {
    match (a.to_i64(), b.to_i64()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn cmp_rows(a: &Row, b: &Row) -> Ordering {
    for (x, y) in a.items().iter().zip(b.items()) {
        match cmp_items(x, y) {
            Ordering::Equal => {},
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

#[derive(Debug, Default)]
pub(crate) struct ListCursor {
    rows: Vec<(Row, Row)>,
    pos: Option<usize>,
    key: Option<Row>,
}

impl ListCursor {
    pub fn new(mut rows: Vec<(Row, Row)>) -> Self {
        rows.sort_by(|a, b| cmp_rows(&a.0, &b.0));
        Self { rows, pos: None, key: None }
    }

    /// `metadata:`: object URI to configuration string.
    pub fn metadata(conn: &ConnInner) -> Self {
        let meta = conn.meta.lock();
        let rows =
            meta.image.schema.values().map(|e| (Row::from(e.uri.as_str()), Row::from(e.config.as_str()))).collect();
        Self::new(rows)
    }

    /// `statistics:` or `statistics:<uri>`: metric id to (description,
    /// printable value, raw value).
    pub fn statistics(conn: &ConnInner, uri: Option<&str>, cfg: &CursorConfig) -> Result<Self> {
        if conn.env.config().statistics == StatisticsLevel::None {
            return Err(Error::invalid("statistics cursors require statistics to be configured"));
        }
        let clear = cfg.statistics.iter().any(|s| s == "clear");
        let entries = match uri {
            Some(uri) => {
                let tree = conn.data_target(uri)?.tree;
                let entries = tree.stats.snapshot();
                if clear {
                    tree.stats.clear();
                }
                entries
            },
            None => {
                conn.env.refresh_cache_stats();
                let entries = conn.env.stats.snapshot();
                if clear {
                    conn.env.stats.clear();
                }
                entries
            },
        };
        let rows = entries
            .into_iter()
            .map(|entry| {
                let value = Row::new(vec![
                    Item::from(entry.description),
                    Item::from(entry.printable()),
                    Item::Int(entry.value),
                ]);
                (Row::from(entry.stat.id()), value)
            })
            .collect();
        Ok(Self::new(rows))
    }

    /// `prepared_discover:`: prepared ids waiting to be claimed.
    pub fn prepared(conn: &ConnInner) -> Self {
        let rows = conn.recovered.lock().keys().map(|id| (Row::from(*id), Row::default())).collect();
        Self::new(rows)
    }

    pub fn set_key(&mut self, key: Row) {
        self.key = Some(key);
        self.pos = None;
    }

    pub fn get_key(&self) -> Result<Row> {
        match self.pos {
            Some(pos) => Ok(self.rows[pos].0.clone()),
            None => self.key.clone().ok_or_else(|| Error::invalid("cursor key is not set")),
        }
    }

    pub fn get_value(&self) -> Result<Row> {
        let pos = self.pos.ok_or_else(|| Error::invalid("cursor is not positioned"))?;
        Ok(self.rows[pos].1.clone())
    }

    pub fn step(&mut self, forward: bool) -> Result<()> {
        let next = match (self.pos, forward) {
            (None, true) => Some(0),
            (None, false) => self.rows.len().checked_sub(1),
            (Some(pos), true) => Some(pos + 1),
            (Some(pos), false) => pos.checked_sub(1),
        };
        match next.filter(|n| *n < self.rows.len()) {
            Some(n) => {
                self.pos = Some(n);
                Ok(())
            },
            None => {
                self.pos = None;
                Err(Error::NotFound)
            },
        }
    }

    pub fn search(&mut self) -> Result<()> {
        let key = self.key.as_ref().ok_or_else(|| Error::invalid("cursor key is not set"))?;
        match self.rows.iter().position(|(k, _)| cmp_rows(k, key) == Ordering::Equal) {
            Some(pos) => {
                self.pos = Some(pos);
                Ok(())
            },
            None => Err(Error::NotFound),
        }
    }

    pub fn search_near(&mut self) -> Result<i32> {
        let key = self.key.as_ref().ok_or_else(|| Error::invalid("cursor key is not set"))?;
        let at = self.rows.partition_point(|(k, _)| cmp_rows(k, key) == Ordering::Less);
        let (pos, exact) = match self.rows.get(at) {
            Some((k, _)) if cmp_rows(k, key) == Ordering::Equal => (at, 0),
            Some(_) => (at, 1),
            None if at > 0 => (at - 1, -1),
            None => return Err(Error::NotFound),
        };
        self.pos = Some(pos);
        Ok(exact)
    }

    pub fn largest_key(&mut self) -> Result<()> {
        let last = self.rows.len().checked_sub(1).ok_or(Error::NotFound)?;
        self.pos = Some(last);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.pos = None;
        self.key = None;
    }
}

/// A `backup:` cursor: the file list, and the open backup until dropped.
pub(crate) struct BackupCursor {
    pub list: ListCursor,
    conn: Arc<ConnInner>,
}

impl BackupCursor {
    pub fn open(conn: &Arc<ConnInner>, cfg: &CursorConfig) -> Result<Self> {
        let files = open_backup(conn, cfg)?;
        let rows = files.into_iter().map(|f| (Row::from(f), Row::default())).collect();
        Ok(Self { list: ListCursor::new(rows), conn: conn.clone() })
    }
}

impl Drop for BackupCursor {
    fn drop(&mut self) {
        if let Err(e) = close_backup(&self.conn) {
            tracing::warn!(error = %e, "closing backup failed");
        }
    }
}
