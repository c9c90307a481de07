//! `wt load`: recreates objects from `dump` output.

use std::io::BufRead;

use cellar_store::Session;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    error::{CliError, Result},
    format::{DUMP_BANNER, DumpStyle, decode, formats, row_from_json},
};

/// Options shared by text and JSON loads.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Replaces the object name (`table:old` loads as `table:<rename>`).
    pub rename: Option<String>,
    /// Column stores allocate fresh record numbers instead of using the
    /// dumped keys.
    pub append: bool,
}

fn renamed(uri: &str, rename: Option<&str>) -> String {
    match (rename, uri.split_once(':')) {
        (Some(name), Some((kind, _))) => format!("{kind}:{name}"),
        _ => uri.to_string(),
    }
}

fn bad(line: usize, message: impl Into<String>) -> CliError {
    CliError::DumpFormat { line, message: message.into() }
}

/// Loads a text dump. Returns the object loaded and the row count.
pub fn load_text(session: &Session, input: impl BufRead, opts: &LoadOptions) -> Result<(String, u64)> {
    let mut lines = input.lines().enumerate().map(|(i, l)| (i + 1, l));
    let mut next = |what: &str| -> Result<(usize, String)> {
        match lines.next() {
            Some((n, Ok(line))) => Ok((n, line)),
            Some((_, Err(e))) => Err(e.into()),
            None => Err(bad(0, format!("unexpected end of input, expected {what}"))),
        }
    };

    let (n, banner) = next("the dump banner")?;
    if !banner.starts_with(DUMP_BANNER) {
        return Err(bad(n, "not a cellar dump"));
    }
    let (n, format) = next("a Format line")?;
    let style = format
        .strip_prefix("Format=")
        .and_then(DumpStyle::from_name)
        .ok_or_else(|| bad(n, format!("unknown format line '{format}'")))?;
    let (n, header) = next("Header")?;
    if header != "Header" {
        return Err(bad(n, "expected Header"));
    }
    let (_, uri) = next("the object URI")?;
    let (_, config) = next("the object configuration")?;
    let (n, data) = next("Data")?;
    if data != "Data" {
        return Err(bad(n, "expected Data"));
    }

    let uri = renamed(&uri, opts.rename.as_deref());
    session.create(&uri, &config)?;
    let append = opts.append && formats(&config)?.0.is_recno();
    let mut cursor = session.open_cursor(&uri, if append { "raw,append" } else { "raw" })?;

    let mut rows = 0;
    loop {
        let (kn, key) = match lines_next(&mut next)? {
            Some(line) => line,
            None => break,
        };
        let (vn, value) = next("a value line")?;
        let key = decode(&key, style.key_is_hex()).ok_or_else(|| bad(kn, "undecodable key"))?;
        let value = decode(&value, style.value_is_hex()).ok_or_else(|| bad(vn, "undecodable value"))?;
        if !append {
            cursor.set_key(key);
        }
        cursor.set_value(value);
        cursor.insert()?;
        rows += 1;
    }
    info!(uri = %uri, rows, "loaded");
    Ok((uri, rows))
}

/// Reads the next key line, or `None` at a clean end of input.
fn lines_next(next: &mut impl FnMut(&str) -> Result<(usize, String)>) -> Result<Option<(usize, String)>> {
    match next("a key line") {
        Ok(line) => Ok(Some(line)),
        Err(CliError::DumpFormat { line: 0, .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Loads every object of a JSON dump. Returns `(uri, rows)` per object.
pub fn load_json(session: &Session, doc: &Value, opts: &LoadOptions) -> Result<Vec<(String, u64)>> {
    let objects = doc.as_object().ok_or_else(|| CliError::Usage { message: "JSON dump is not an object".into() })?;
    let mut loaded = Vec::new();
    for (uri, parts) in objects {
        let config = parts[0]["config"]
            .as_str()
            .ok_or_else(|| CliError::Usage { message: format!("{uri}: missing config") })?;
        let data = parts[1]["data"]
            .as_array()
            .ok_or_else(|| CliError::Usage { message: format!("{uri}: missing data") })?;
        let (key_format, value_format) = formats(config)?;
        let uri = renamed(uri, opts.rename.as_deref());
        session.create(&uri, config)?;
        let append = opts.append && key_format.is_recno();
        let mut cursor = session.open_cursor(&uri, if append { "append" } else { "" })?;
        for record in data {
            let record = record
                .as_object()
                .ok_or_else(|| CliError::Usage { message: format!("{uri}: data entries must be objects") })?;
            if !append {
                cursor.set_key(row_from_json(&key_format, record, "key")?);
            }
            cursor.set_value(row_from_json(&value_format, record, "value")?);
            cursor.insert()?;
        }
        debug!(uri = %uri, rows = data.len(), "loaded from JSON");
        loaded.push((uri, data.len() as u64));
    }
    Ok(loaded)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use cellar_store::Connection;

    use super::*;
    use crate::dump::{dump_json, dump_text};

    fn source() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path(), "create").unwrap();
        {
            let session = conn.open_session("").unwrap();
            session.create("table:t", "key_format=S,value_format=u").unwrap();
            let mut c = session.open_cursor("table:t", "").unwrap();
            for i in 0..20 {
                c.set_key(format!("key{i:02}"));
                c.set_value(vec![i as u8, 0, b'\\', 0xff]);
                c.insert().unwrap();
            }
        }
        (dir, conn)
    }

    fn values(session: &Session, uri: &str) -> Vec<(String, Vec<u8>)> {
        let mut c = session.open_cursor(uri, "").unwrap();
        let mut out = Vec::new();
        while c.next().is_ok() {
            out.push((
                c.get_key().unwrap().as_str().unwrap().to_string(),
                c.get_value().unwrap().as_bytes().unwrap().to_vec(),
            ));
        }
        out
    }

    #[test]
    fn test_text_dump_loads_under_new_name() {
        let (_dir, conn) = source();
        let session = conn.open_session("").unwrap();
        for style in [DumpStyle::Print, DumpStyle::Hex, DumpStyle::PrintHex] {
            let mut dump = Vec::new();
            dump_text(&session, "table:t", style, &mut dump).unwrap();
            let name = format!("copy_{}", style.name());
            let opts = LoadOptions { rename: Some(name.clone()), append: false };
            let (uri, rows) = load_text(&session, dump.as_slice(), &opts).unwrap();
            assert_eq!(uri, format!("table:{name}"));
            assert_eq!(rows, 20);
            assert_eq!(values(&session, &uri), values(&session, "table:t"));
        }
    }

    #[test]
    fn test_json_dump_loads_under_new_name() {
        let (_dir, conn) = source();
        let session = conn.open_session("").unwrap();
        let mut dump = Vec::new();
        dump_json(&session, "table:t", &mut dump).unwrap();
        let doc: Value = serde_json::from_slice(&dump).unwrap();
        let opts = LoadOptions { rename: Some("json_copy".into()), append: false };
        let loaded = load_json(&session, &doc, &opts).unwrap();
        assert_eq!(loaded, vec![("table:json_copy".to_string(), 20)]);
        assert_eq!(values(&session, "table:json_copy"), values(&session, "table:t"));
    }

    #[test]
    fn test_truncated_dump_is_rejected() {
        let (_dir, conn) = source();
        let session = conn.open_session("").unwrap();
        let text = format!("{DUMP_BANNER} (version 0)\nFormat=print\nHeader\ntable:x\nkey_format=S,value_format=S\n");
        let err = load_text(&session, text.as_bytes(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, CliError::DumpFormat { .. }));
        let err = load_text(&session, "garbage\n".as_bytes(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, CliError::DumpFormat { line: 1, .. }));
    }
}
