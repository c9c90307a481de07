//! `wt dump`: writes an object's configuration and rows.
//!
//! ```text
//! cellar dump (version 0.1.0)
//! Format=print
//! Header
//! table:users
//! key_format=S,value_format=S
//! Data
//! alice\00
//! admin\00
//! ```

use std::io::Write;

use cellar_store::Session;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{
    error::Result,
    format::{DUMP_BANNER, DumpStyle, encode, row_to_json},
};

/// Configuration string `uri` was created with.
pub fn object_config(session: &Session, uri: &str) -> Result<String> {
    let mut meta = session.open_cursor("metadata:", "")?;
    meta.set_key(uri);
    meta.search()?;
    Ok(meta.get_value()?.as_str().unwrap_or_default().to_string())
}

/// Writes a text dump of `uri`. Returns the number of rows written.
pub fn dump_text(session: &Session, uri: &str, style: DumpStyle, out: &mut impl Write) -> Result<u64> {
    let config = object_config(session, uri)?;
    writeln!(out, "{DUMP_BANNER} (version {})", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "Format={}", style.name())?;
    writeln!(out, "Header")?;
    writeln!(out, "{uri}")?;
    writeln!(out, "{config}")?;
    writeln!(out, "Data")?;

    let mut cursor = session.open_cursor(uri, "raw")?;
    let mut rows = 0;
    loop {
        match cursor.next() {
            Ok(()) => {},
            Err(e) if e.is_not_found() => break,
            Err(e) => return Err(e.into()),
        }
        let key = cursor.get_key()?;
        let value = cursor.get_value()?;
        writeln!(out, "{}", encode(key.as_bytes().unwrap_or_default(), style.key_is_hex()))?;
        writeln!(out, "{}", encode(value.as_bytes().unwrap_or_default(), style.value_is_hex()))?;
        rows += 1;
    }
    debug!(uri, rows, style = style.name(), "dumped");
    Ok(rows)
}

/// Writes a JSON dump of `uri`:
/// `{ uri: [ { "config": … }, { "data": [ { "key0": …, "value0": … } ] } ] }`.
pub fn dump_json(session: &Session, uri: &str, out: &mut impl Write) -> Result<u64> {
    let config = object_config(session, uri)?;
    let mut cursor = session.open_cursor(uri, "")?;
    let mut data = Vec::new();
    loop {
        match cursor.next() {
            Ok(()) => {},
            Err(e) if e.is_not_found() => break,
            Err(e) => return Err(e.into()),
        }
        let mut record = Map::new();
        row_to_json(&cursor.get_key()?, "key", &mut record);
        row_to_json(&cursor.get_value()?, "value", &mut record);
        data.push(Value::Object(record));
    }
    let rows = data.len() as u64;
    let mut doc = Map::new();
    doc.insert(uri.to_string(), json!([
        { "config": config, "colgroups": [], "indices": [] },
        { "data": data },
    ]));
    serde_json::to_writer_pretty(&mut *out, &doc)?;
    writeln!(out)?;
    debug!(uri, rows, "dumped as JSON");
    Ok(rows)
}
