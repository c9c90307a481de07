//! `wt printlog`: prints log records as a JSON array.
//!
//! User keys and values are redacted unless `-u` is given.

use std::{io::Write, path::Path};

use cellar_store::log::{list_log_files, read_log_file};
use serde_json::Value;

use crate::error::{CliError, Result};

const REDACTED: &str = "REDACTED";

/// Fields of a commit operation that carry user data.
const USER_FIELDS: [&str; 4] = ["key", "value", "start", "stop"];

/// A range of log file numbers, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRange {
    pub start: u32,
    pub stop: Option<u32>,
}

impl FileRange {
    /// Parses `start[,stop]`.
    pub fn parse(text: &str) -> Result<Self> {
        let bad = || CliError::Usage { message: format!("-l expects start[,stop] file numbers, got '{text}'") };
        let (start, stop) = match text.split_once(',') {
            Some((a, b)) => (a, Some(b)),
            None => (text, None),
        };
        let start = start.trim().parse().map_err(|_| bad())?;
        let stop = stop.map(|s| s.trim().parse()).transpose().map_err(|_| bad())?;
        if stop.is_some_and(|s| s < start) {
            return Err(bad());
        }
        Ok(Self { start, stop })
    }

    fn contains(&self, num: u32) -> bool {
        num >= self.start && self.stop.is_none_or(|s| num <= s)
    }
}

fn redact(record: &mut Value) {
    let Some(ops) = record.get_mut("ops").and_then(Value::as_array_mut) else { return };
    for op in ops {
        let Some(op) = op.as_object_mut() else { continue };
        for field in USER_FIELDS {
            if let Some(v) = op.get_mut(field) {
                if v.is_string() {
                    *v = Value::from(REDACTED);
                }
            }
        }
        if let Some(entries) = op.get_mut("modify").and_then(Value::as_array_mut) {
            for entry in entries {
                if let Some(data) = entry.get_mut("data") {
                    *data = Value::from(REDACTED);
                }
            }
        }
    }
}

/// Prints the records of the log files in `dir`. Returns the record count.
pub fn print_log(
    dir: &Path,
    range: Option<FileRange>,
    hex: bool,
    user_data: bool,
    out: &mut impl Write,
) -> Result<u64> {
    let mut count = 0;
    writeln!(out, "[")?;
    for num in list_log_files(dir)? {
        if !range.is_none_or(|r| r.contains(num)) {
            continue;
        }
        for (lsn, record) in read_log_file(dir, num)? {
            let mut json = record.to_json(lsn, hex);
            if !user_data {
                redact(&mut json);
            }
            if count > 0 {
                writeln!(out, ",")?;
            }
            write!(out, "  {}", serde_json::to_string(&json)?)?;
            count += 1;
        }
    }
    if count > 0 {
        writeln!(out)?;
    }
    writeln!(out, "]")?;
    Ok(count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use cellar_store::Connection;

    use super::*;

    #[test]
    fn test_file_range_parsing() {
        assert_eq!(FileRange::parse("3").unwrap(), FileRange { start: 3, stop: None });
        assert_eq!(FileRange::parse("2,5").unwrap(), FileRange { start: 2, stop: Some(5) });
        assert!(FileRange::parse("5,2").is_err());
        assert!(FileRange::parse("x").is_err());
        assert!(FileRange::parse("2,5").unwrap().contains(5));
        assert!(!FileRange::parse("2,5").unwrap().contains(6));
    }

    #[test]
    fn test_printlog_redacts_user_data_by_default() {
        let dir = tempfile::tempdir().unwrap();
        {
            let conn = Connection::open(dir.path(), "create,log=(enabled=true,prealloc=false)").unwrap();
            let session = conn.open_session("").unwrap();
            session.create("table:t", "key_format=S,value_format=S").unwrap();
            let mut c = session.open_cursor("table:t", "").unwrap();
            c.set_key("secret-key");
            c.set_value("secret-value");
            c.insert().unwrap();
            session.log_printf("hello from the test").unwrap();
            session.log_flush("").unwrap();
        }

        let mut out = Vec::new();
        let records = print_log(dir.path(), None, false, false, &mut out).unwrap();
        assert!(records > 0);
        let text = String::from_utf8(out).unwrap();
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc.as_array().unwrap().len() as u64, records);
        assert!(!text.contains("secret-key"));
        assert!(text.contains(REDACTED));
        assert!(text.contains("hello from the test"));

        let mut out = Vec::new();
        print_log(dir.path(), None, false, true, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("secret-key"));
    }

    #[test]
    fn test_empty_range_prints_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        assert_eq!(print_log(dir.path(), Some(FileRange { start: 9, stop: None }), false, false, &mut out).unwrap(), 0);
        let doc: Value = serde_json::from_slice(&out).unwrap();
        assert!(doc.as_array().unwrap().is_empty());
    }
}
