//! Hot backup.
//!
//! Opening a backup captures the metadata image of the last checkpoint
//! into `cellar.backup`, switches the log so every record written so far
//! sits in a complete file, and lists the files an external copy needs.
//! While a backup is open, checkpoints keep the blocks of earlier
//! checkpoints and log files are not removed, so the listed files stay
//! consistent with the captured image until the backup closes.
//!
//! A database opened from the copy finds `cellar.backup`, takes it as its
//! metadata and replays the copied log.

use std::path::Path;

use cellar_types::config::CursorConfig;
use tracing::{debug, info};

use crate::{
    conn::{ConnInner, VERSION_FILE},
    error::{Error, Result},
    hs::HS_URI,
    live_restore::BACKUP_META_FILE,
    log::log_file_name,
    meta::{MetaFile, MetaImage},
    metrics,
    schema::{EntryKind, SchemaEntry},
    stats::Stat,
};

/// An open backup.
#[derive(Debug, Clone)]
pub(crate) struct BackupState {
    /// Files to copy, relative to the home directory.
    pub files: Vec<String>,
}

/// Files backing `uri` and everything it owns.
fn object_files(schema: &std::collections::BTreeMap<String, SchemaEntry>, uri: &str) -> Result<Vec<String>> {
    let entry = schema.get(uri).ok_or_else(|| Error::invalid(format!("backup target {uri}: no such object")))?;
    let file_name = |file_uri: &str| -> Option<String> {
        match schema.get(file_uri).map(|e| &e.kind) {
            Some(EntryKind::File { file_name, .. }) if !crate::disagg::is_ingest(file_name) => Some(file_name.clone()),
            _ => None,
        }
    };
    let mut files = Vec::new();
    match &entry.kind {
        EntryKind::Table { file, indices, .. } => {
            files.extend(file_name(file));
            for index in indices {
                if let Some(EntryKind::Index { file, .. }) = schema.get(index).map(|e| &e.kind) {
                    files.extend(file_name(file));
                }
            }
        },
        EntryKind::Index { file, .. } => files.extend(file_name(file)),
        EntryKind::File { .. } => files.extend(file_name(uri)),
        EntryKind::Layered { stable, .. } => files.extend(file_name(stable)),
        EntryKind::Colgroup { table, .. } => return object_files(schema, table),
    }
    Ok(files)
}

/// Log files a copy needs, relative to home: every complete file from the
/// one holding the checkpoint position up to (excluding) `current`.
fn log_files(conn: &ConnInner, image: &MetaImage, current: u32) -> Result<Vec<String>> {
    let Some(log) = &conn.log else { return Ok(Vec::new()) };
    let first = image.ckpt_lsn.map_or(0, |lsn| lsn.file);
    let dir = Path::new(&conn.env.config().log.path).to_path_buf();
    Ok(log
        .files()?
        .into_iter()
        .filter(|n| *n >= first && *n < current)
        .map(|n| dir.join(log_file_name(n)).to_string_lossy().to_string())
        .collect())
}

/// Opens a backup and returns the files to copy.
///
/// With `target` only the named objects' files are listed; with
/// `incremental` only the log files written since the last checkpoint.
///
/// # Errors
///
/// - [`Error::Busy`] when a backup is already open
/// - [`Error::Unsupported`] for in-memory databases
pub(crate) fn open_backup(conn: &ConnInner, cfg: &CursorConfig) -> Result<Vec<String>> {
    conn.check_open()?;
    let config = conn.env.config();
    if config.in_memory {
        return Err(Error::unsupported("backup of an in-memory database"));
    }
    let _ckpt = conn.checkpoint_lock.lock();
    let mut backup = conn.backup.lock();
    if backup.is_some() {
        return Err(Error::busy("a backup cursor is already open"));
    }

    let image = conn.meta.lock().image.clone();
    let current = match &conn.log {
        Some(log) => {
            let num = log.force_switch()?;
            log.pin_backup();
            num
        },
        None => 0,
    };
    let logs = log_files(conn, &image, current)?;

    let mut files = Vec::new();
    if !cfg.incremental {
        let mut meta = MetaFile::create(&conn.home.join(BACKUP_META_FILE))?;
        meta.commit(&image)?;
        files.push(BACKUP_META_FILE.to_string());
        files.push(VERSION_FILE.to_string());
        if cfg.target.is_empty() {
            files.push(HS_URI.trim_start_matches("file:").to_string());
            let shared = crate::disagg::stable_files(&image.schema);
            for entry in image.schema.values() {
                if let EntryKind::File { file_name, .. } = &entry.kind {
                    if !crate::disagg::is_ingest(file_name) && !shared.contains(&entry.uri) {
                        files.push(file_name.clone());
                    }
                }
            }
        } else {
            for uri in &cfg.target {
                for file in object_files(&image.schema, uri)? {
                    if !files.contains(&file) {
                        files.push(file);
                    }
                }
            }
        }
    }
    files.extend(logs);

    conn.txn.ts.update(|r| {
        r.backup_checkpoint = image.last_ckpt_ts;
        Ok(())
    })?;
    *backup = Some(BackupState { files: files.clone() });
    conn.env.stats.incr(Stat::BackupCursorOpen);
    metrics::record_backup_opened();
    info!(files = files.len(), log_file = current, incremental = cfg.incremental, "backup opened");
    Ok(files)
}

/// Closes the open backup, if any.
pub(crate) fn close_backup(conn: &ConnInner) -> Result<()> {
    let Some(state) = conn.backup.lock().take() else { return Ok(()) };
    if let Some(log) = &conn.log {
        log.unpin_backup();
    }
    let meta = conn.home.join(BACKUP_META_FILE);
    if meta.exists() {
        std::fs::remove_file(&meta)?;
    }
    debug!(files = state.files.len(), "backup closed");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{conn::Connection, log::list_log_files};

    #[test]
    fn test_open_switches_log_and_lists_files() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,log=(enabled,prealloc=false)").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        let before = list_log_files(dir.path()).unwrap();

        let files = open_backup(conn.inner(), &CursorConfig::default()).unwrap();
        let after = list_log_files(dir.path()).unwrap();
        assert_eq!(after.len(), before.len() + 1);
        assert!(files.contains(&BACKUP_META_FILE.to_string()));
        assert!(files.contains(&"t.cdb".to_string()));
        assert!(files.iter().any(|f| f.starts_with("CellarLog.")));
        assert!(dir.path().join(BACKUP_META_FILE).exists());

        assert!(matches!(open_backup(conn.inner(), &CursorConfig::default()), Err(Error::Busy { .. })));
        close_backup(conn.inner()).unwrap();
        assert!(!dir.path().join(BACKUP_META_FILE).exists());
    }

    #[test]
    fn test_open_pins_checkpoint_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:t", "key_format=q,value_format=S").unwrap();
        conn.set_timestamp("oldest_timestamp=1,stable_timestamp=20").unwrap();
        session.checkpoint("").unwrap();

        open_backup(conn.inner(), &CursorConfig::default()).unwrap();
        assert_eq!(conn.query_timestamp("get=backup_checkpoint").unwrap(), "20");
        close_backup(conn.inner()).unwrap();
    }

    #[test]
    fn test_target_and_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,log=(enabled,prealloc=false)").unwrap();
        let session = conn.open_session("").unwrap();
        session.create("table:a", "key_format=q,value_format=S").unwrap();
        session.create("table:b", "key_format=q,value_format=S").unwrap();

        let cfg = CursorConfig { target: vec!["table:a".into()], ..CursorConfig::default() };
        let files = open_backup(conn.inner(), &cfg).unwrap();
        assert!(files.contains(&"a.cdb".to_string()));
        assert!(!files.contains(&"b.cdb".to_string()));
        close_backup(conn.inner()).unwrap();

        let cfg = CursorConfig { incremental: true, ..CursorConfig::default() };
        let files = open_backup(conn.inner(), &cfg).unwrap();
        assert!(!files.is_empty());
        assert!(files.iter().all(|f| f.starts_with("CellarLog.")));
        close_backup(conn.inner()).unwrap();
    }

    #[test]
    fn test_in_memory_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create,in_memory=true").unwrap();
        assert!(matches!(open_backup(conn.inner(), &CursorConfig::default()), Err(Error::Unsupported { .. })));
    }
}
