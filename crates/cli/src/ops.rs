//! The smaller `wt` commands: `list`, `verify`, `write`, `backup` and
//! `compact`.

use std::{fs, io::Write, path::Path};

use cellar_store::{CompactOutcome, Error, Session, VerifyReport};
use snafu::ResultExt;
use tracing::{info, warn};

use crate::{
    dump::object_config,
    error::{CliError, FileSnafu, Result},
    format::{formats, row_from_text},
};

/// Writes every object URI starting with `prefix`, with its configuration
/// when `verbose`.
pub fn list(session: &Session, prefix: Option<&str>, verbose: bool, out: &mut impl Write) -> Result<u64> {
    let mut meta = session.open_cursor("metadata:", "")?;
    let mut listed = 0;
    while meta.next().is_ok() {
        let key = meta.get_key()?;
        let uri = key.as_str().unwrap_or_default();
        if !prefix.is_none_or(|p| uri.starts_with(p)) {
            continue;
        }
        if verbose {
            writeln!(out, "{uri}\n\t{}", meta.get_value()?.as_str().unwrap_or_default())?;
        } else {
            writeln!(out, "{uri}")?;
        }
        listed += 1;
    }
    Ok(listed)
}

/// What `verify -d` may ask for.
pub const VERIFY_DUMPS: [&str; 2] = ["dump_address", "dump_pages"];

/// Verifies `uri`, writing any requested dump output.
pub fn verify(session: &Session, uri: &str, dumps: &[String], out: &mut impl Write) -> Result<VerifyReport> {
    let mut config = Vec::new();
    for dump in dumps {
        if !VERIFY_DUMPS.contains(&dump.as_str()) {
            return Err(CliError::Usage {
                message: format!("verify -d: unknown option '{dump}' (expected {})", VERIFY_DUMPS.join(" or ")),
            });
        }
        config.push(format!("{dump}=true"));
    }
    let report = session.verify(uri, &config.join(","))?;
    for line in &report.lines {
        writeln!(out, "{line}")?;
    }
    if !report.errors.is_empty() {
        for e in &report.errors {
            warn!(uri, error = %e, "verify");
        }
        return Err(Error::Corruption { reason: format!("{uri}: {} problems found", report.errors.len()) }.into());
    }
    info!(uri, pages = report.pages, cells = report.cells, "verified");
    Ok(report)
}

/// How `write` changes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert; existing keys are an error.
    Insert,
    /// Insert or replace.
    Overwrite,
    /// Remove the listed keys.
    Remove,
}

/// Applies `args` to `uri` in one transaction: key/value pairs, or keys
/// alone when removing.
pub fn write(session: &Session, uri: &str, mode: WriteMode, args: &[String]) -> Result<u64> {
    let (key_format, value_format) = formats(&object_config(session, uri)?)?;
    if mode != WriteMode::Remove && args.len() % 2 != 0 {
        return Err(CliError::Usage { message: "write expects key/value pairs".into() });
    }
    let cursor_config = if mode == WriteMode::Insert { "overwrite=false" } else { "" };

    session.begin_transaction("")?;
    let result = (|| -> Result<u64> {
        let mut cursor = session.open_cursor(uri, cursor_config)?;
        let mut changed = 0;
        if mode == WriteMode::Remove {
            for key in args {
                cursor.set_key(row_from_text(&key_format, key)?);
                cursor.remove()?;
                changed += 1;
            }
        } else {
            for pair in args.chunks(2) {
                cursor.set_key(row_from_text(&key_format, &pair[0])?);
                cursor.set_value(row_from_text(&value_format, &pair[1])?);
                cursor.insert()?;
                changed += 1;
            }
        }
        Ok(changed)
    })();
    match result {
        Ok(changed) => {
            session.commit_transaction("")?;
            Ok(changed)
        },
        Err(e) => {
            session.rollback_transaction("")?;
            Err(e)
        },
    }
}

/// Copies a hot backup of the database into `dest`. Returns the files
/// copied.
pub fn backup(session: &Session, home: &Path, dest: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(dest).context(FileSnafu { path: dest })?;
    let mut cursor = session.open_cursor("backup:", "")?;
    let mut files = Vec::new();
    while cursor.next().is_ok() {
        let name = cursor.get_key()?.as_str().unwrap_or_default().to_string();
        let from = home.join(&name);
        let to = dest.join(&name);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).context(FileSnafu { path: parent })?;
        }
        fs::copy(&from, &to).context(FileSnafu { path: &from })?;
        files.push(name);
    }
    info!(dest = %dest.display(), files = files.len(), "backup copied");
    Ok(files)
}

/// Compacts `uri`, or every object.
pub fn compact(session: &Session, uri: Option<&str>) -> Result<CompactOutcome> {
    let outcome = session.compact(uri, "")?;
    info!(uri = uri.unwrap_or("all"), files = outcome.files, bytes_recovered = outcome.bytes_recovered, "compacted");
    Ok(outcome)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use cellar_store::Connection;

    use super::*;

    fn setup() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        conn.open_session("").unwrap().create("table:t", "key_format=S,value_format=q").unwrap();
        (dir, conn)
    }

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_write_modes() {
        let (_dir, conn) = setup();
        let session = conn.open_session("").unwrap();
        assert_eq!(write(&session, "table:t", WriteMode::Insert, &args(&["a", "1", "b", "2"])).unwrap(), 2);

        // A duplicate rolls the whole batch back.
        let err = write(&session, "table:t", WriteMode::Insert, &args(&["c", "3", "a", "9"])).unwrap_err();
        assert_eq!(err.code_name(), Some("WT_DUPLICATE_KEY"));
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key("c");
        assert!(c.search().unwrap_err().is_not_found());

        write(&session, "table:t", WriteMode::Overwrite, &args(&["a", "9"])).unwrap();
        c.set_key("a");
        c.search().unwrap();
        assert_eq!(c.get_value().unwrap().as_i64(), Some(9));

        write(&session, "table:t", WriteMode::Remove, &args(&["a"])).unwrap();
        c.set_key("a");
        assert!(c.search().unwrap_err().is_not_found());

        assert!(write(&session, "table:t", WriteMode::Insert, &args(&["odd"])).is_err());
        assert!(write(&session, "table:t", WriteMode::Insert, &args(&["k", "not-a-number"])).is_err());
    }

    #[test]
    fn test_list_filters_by_prefix() {
        let (_dir, conn) = setup();
        let session = conn.open_session("").unwrap();
        session.create("table:other", "key_format=S,value_format=S").unwrap();
        let mut out = Vec::new();
        assert_eq!(list(&session, Some("table:"), false, &mut out).unwrap(), 2);
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().any(|l| l == "table:t"));
        assert!(text.lines().any(|l| l == "table:other"));

        let mut out = Vec::new();
        list(&session, Some("table:t"), true, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("key_format=S"));
    }

    #[test]
    fn test_verify_rejects_unknown_dump() {
        let (_dir, conn) = setup();
        let session = conn.open_session("").unwrap();
        session.checkpoint("").unwrap();
        assert!(verify(&session, "table:t", &args(&["dump_everything"]), &mut Vec::new()).is_err());
        verify(&session, "table:t", &[], &mut Vec::new()).unwrap();
    }

    #[test]
    fn test_backup_copies_listed_files() {
        let (dir, conn) = setup();
        let session = conn.open_session("").unwrap();
        write(&session, "table:t", WriteMode::Insert, &args(&["a", "1"])).unwrap();
        session.checkpoint("").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let files = backup(&session, dir.path(), dest.path()).unwrap();
        assert!(files.iter().any(|f| f == "t.cdb"));
        for f in &files {
            assert!(dest.path().join(f).exists(), "{f} missing from the copy");
        }
        drop(session);
        drop(conn);

        let copy = Connection::open(dest.path(), "").unwrap();
        let session = copy.open_session("").unwrap();
        let mut c = session.open_cursor("table:t", "").unwrap();
        c.set_key("a");
        c.search().unwrap();
    }
}
