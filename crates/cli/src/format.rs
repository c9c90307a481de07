//! Text renderings shared by `dump`, `load` and `write`.
//!
//! Text dumps carry packed bytes, escaped (`print`) or hex encoded
//! (`hex`), so a load reproduces the exact bytes. JSON dumps carry
//! unpacked fields, one JSON scalar per format field.

use cellar_store::{Format, Item, Row};
use cellar_types::{
    config::{ConfigValue, ParsedConfig},
    pack::FieldType,
};
use serde_json::{Map, Value};

use crate::error::{CliError, Result};

/// First line of every text dump.
pub const DUMP_BANNER: &str = "cellar dump";

/// How keys and values are written in a text dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpStyle {
    /// Escaped bytes for both.
    Print,
    /// Hex for both.
    Hex,
    /// Escaped keys, hex values.
    PrintHex,
}

impl DumpStyle {
    /// Value of the `Format=` header line.
    pub fn name(self) -> &'static str {
        match self {
            DumpStyle::Print => "print",
            DumpStyle::Hex => "hex",
            DumpStyle::PrintHex => "print_hex",
        }
    }

    /// Parses a `Format=` header value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "print" => Some(DumpStyle::Print),
            "hex" => Some(DumpStyle::Hex),
            "print_hex" => Some(DumpStyle::PrintHex),
            _ => None,
        }
    }

    pub fn key_is_hex(self) -> bool {
        self == DumpStyle::Hex
    }

    pub fn value_is_hex(self) -> bool {
        self != DumpStyle::Print
    }
}

/// Renders bytes in a text dump.
pub fn encode(bytes: &[u8], as_hex: bool) -> String {
    if as_hex { cellar_store::log::hex(bytes) } else { cellar_store::log::printable(bytes) }
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decodes a hex string.
pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let raw = text.as_bytes();
    if raw.len() % 2 != 0 {
        return None;
    }
    raw.chunks(2).map(|pair| Some(hex_digit(pair[0])? << 4 | hex_digit(pair[1])?)).collect()
}

/// Reverses [`cellar_store::log::printable`].
pub fn decode_printable(text: &str) -> Option<Vec<u8>> {
    let raw = text.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'\\' {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        match raw.get(i + 1) {
            Some(b'\\') => {
                out.push(b'\\');
                i += 2;
            },
            Some(_) => {
                let hi = hex_digit(*raw.get(i + 1)?)?;
                let lo = hex_digit(*raw.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            },
            None => return None,
        }
    }
    Some(out)
}

/// Decodes one line of a text dump.
pub fn decode(text: &str, as_hex: bool) -> Option<Vec<u8>> {
    if as_hex { decode_hex(text) } else { decode_printable(text) }
}

/// Looks up a top-level scalar in a configuration string.
pub fn config_value(config: &str, key: &str) -> Option<String> {
    let parsed = ParsedConfig::parse(config).ok()?;
    parsed.entries().iter().rev().find(|e| e.key == key).and_then(|e| match &e.value {
        Some(ConfigValue::Scalar(v)) => Some(v.clone()),
        _ => None,
    })
}

/// The key and value formats an object was created with.
pub fn formats(config: &str) -> Result<(Format, Format)> {
    let parse = |key: &str| -> Result<Format> {
        let text = config_value(config, key).unwrap_or_else(|| "u".to_string());
        Format::parse(&text).map_err(|e| CliError::Usage { message: format!("{key}: {e}") })
    };
    Ok((parse("key_format")?, parse("value_format")?))
}

fn item_from_text(field: FieldType, text: &str) -> Result<Item> {
    let bad = || CliError::Usage { message: format!("'{text}' is not a valid {} field", field.code()) };
    Ok(match field {
        FieldType::Int { .. } => Item::Int(text.parse().map_err(|_| bad())?),
        FieldType::Uint { .. } | FieldType::Recno | FieldType::Bits(_) => Item::Uint(text.parse().map_err(|_| bad())?),
        FieldType::Str | FieldType::FixedStr(_) => Item::from(text),
        FieldType::Bytes => Item::from(text.as_bytes()),
    })
}

/// Parses a command-line argument into a row of `format`. Multi-field
/// formats take their fields comma separated.
pub fn row_from_text(format: &Format, text: &str) -> Result<Row> {
    let fields = format.fields();
    if fields.len() == 1 {
        return Ok(Row::from(item_from_text(fields[0], text)?));
    }
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != fields.len() {
        return Err(CliError::Usage {
            message: format!("format '{format}' needs {} comma-separated fields, got '{text}'", fields.len()),
        });
    }
    let items = fields.iter().zip(parts).map(|(f, p)| item_from_text(*f, p)).collect::<Result<Vec<_>>>()?;
    Ok(Row::new(items))
}

fn item_to_json(item: &Item) -> Value {
    match item {
        Item::Int(v) => Value::from(*v),
        Item::Uint(v) => Value::from(*v),
        Item::Str(s) => Value::from(s.as_str()),
        Item::Bytes(b) => Value::from(cellar_store::log::hex(b)),
    }
}

/// Renders a row as `{"<prefix>0": …, "<prefix>1": …}` entries of `out`.
pub fn row_to_json(row: &Row, prefix: &str, out: &mut Map<String, Value>) {
    for (i, item) in row.items().iter().enumerate() {
        out.insert(format!("{prefix}{i}"), item_to_json(item));
    }
}

fn item_from_json(field: FieldType, value: &Value) -> Option<Item> {
    match field {
        FieldType::Int { .. } => value.as_i64().map(Item::Int),
        FieldType::Uint { .. } | FieldType::Recno | FieldType::Bits(_) => value.as_u64().map(Item::Uint),
        FieldType::Str | FieldType::FixedStr(_) => value.as_str().map(Item::from),
        FieldType::Bytes => value.as_str().and_then(decode_hex).map(Item::Bytes),
    }
}

/// Reads the `<prefix>N` entries of a JSON record back into a row.
pub fn row_from_json(format: &Format, record: &Map<String, Value>, prefix: &str) -> Result<Row> {
    let mut items = Vec::with_capacity(format.fields().len());
    for (i, field) in format.fields().iter().enumerate() {
        let name = format!("{prefix}{i}");
        let item = record.get(&name).and_then(|v| item_from_json(*field, v)).ok_or_else(|| CliError::Usage {
            message: format!("record field '{name}' is missing or not a {} value", field.code()),
        })?;
        items.push(item);
    }
    Ok(Row::new(items))
}
