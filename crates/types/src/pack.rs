//! Order-preserving packing of keys and values.
//!
//! Tables declare their key and value layout with short format strings
//! (`"i"`, `"S"`, `"r"`, `"u"`, `"8t"`, `"iS"`, ...). A [`Row`] of [`Item`]s
//! is packed into bytes whose lexicographic order matches the logical order
//! of the tuple, so btrees compare packed keys as plain byte strings.
//!
//! | Char | Type                | Encoding                               |
//! |------|---------------------|----------------------------------------|
//! | `b` `h` `i` `l` `q` | signed 8/16/32/32/64-bit | big-endian, sign bit flipped |
//! | `B` `H` `I` `L` `Q` | unsigned             | big-endian                     |
//! | `r`  | record number       | big-endian u64                         |
//! | `S`  | NUL-terminated string | bytes + `0x00`                        |
//! | `Ns` | fixed string        | exactly N bytes, zero padded           |
//! | `u`  | raw bytes           | raw when last, else u32 length prefix  |
//! | `Nt` | N-bit field (N ≤ 8) | one byte                               |

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use snafu::Snafu;

/// Errors raised while parsing formats or packing rows.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum PackError {
    /// The format string is malformed.
    #[snafu(display("invalid format '{format}': {message}"))]
    InvalidFormat {
        /// The offending format.
        format: String,
        /// What is wrong with it.
        message: String,
    },

    /// The row has the wrong number of fields.
    #[snafu(display("format '{format}' expects {expected} fields, got {found}"))]
    FieldCount {
        /// The format being packed.
        format: String,
        /// Fields the format declares.
        expected: usize,
        /// Fields the row supplied.
        found: usize,
    },

    /// A field's value does not fit its declared type.
    #[snafu(display("field {index} of format '{format}': {message}"))]
    FieldType {
        /// The format being packed.
        format: String,
        /// Zero-based field index.
        index: usize,
        /// What is wrong with the value.
        message: String,
    },

    /// Packed bytes ended before the format was satisfied.
    #[snafu(display("truncated packed data for format '{format}'"))]
    Truncated {
        /// The format being unpacked.
        format: String,
    },
}

/// A single field type within a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Signed integer of the given byte width.
    Int {
        /// Width in bytes.
        bytes: u8,
    },
    /// Unsigned integer of the given byte width.
    Uint {
        /// Width in bytes.
        bytes: u8,
    },
    /// Record number.
    Recno,
    /// NUL-terminated string.
    Str,
    /// Fixed-length string.
    FixedStr(usize),
    /// Raw bytes.
    Bytes,
    /// Bit field of the given width.
    Bits(u8),
}

impl FieldType {
    /// Format text for this single field.
    pub fn code(&self) -> String {
        match self {
            FieldType::Int { bytes: 1 } => "b".into(),
            FieldType::Int { bytes: 2 } => "h".into(),
            FieldType::Int { bytes: 4 } => "i".into(),
            FieldType::Int { .. } => "q".into(),
            FieldType::Uint { bytes: 1 } => "B".into(),
            FieldType::Uint { bytes: 2 } => "H".into(),
            FieldType::Uint { bytes: 4 } => "I".into(),
            FieldType::Uint { .. } => "Q".into(),
            FieldType::Recno => "r".into(),
            FieldType::Str => "S".into(),
            FieldType::FixedStr(n) => format!("{n}s"),
            FieldType::Bytes => "u".into(),
            FieldType::Bits(w) => format!("{w}t"),
        }
    }
}

/// A parsed format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    text: String,
    fields: Vec<FieldType>,
}

impl Format {
    /// Parses a format string.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::InvalidFormat`] for empty formats, unknown type
    /// characters, or bit fields wider than 8.
    pub fn parse(text: &str) -> Result<Self, PackError> {
        let invalid = |message: &str| PackError::InvalidFormat {
            format: text.to_string(),
            message: message.to_string(),
        };

        let mut fields = Vec::new();
        let mut count: Option<usize> = None;
        for ch in text.chars() {
            if let Some(digit) = ch.to_digit(10) {
                let next = count.unwrap_or(0).checked_mul(10).and_then(|c| c.checked_add(digit as usize));
                count = Some(next.ok_or_else(|| invalid("repeat count overflows"))?);
                continue;
            }
            let repeat = count.take();
            let single = match ch {
                'b' => FieldType::Int { bytes: 1 },
                'B' => FieldType::Uint { bytes: 1 },
                'h' => FieldType::Int { bytes: 2 },
                'H' => FieldType::Uint { bytes: 2 },
                'i' | 'l' => FieldType::Int { bytes: 4 },
                'I' | 'L' => FieldType::Uint { bytes: 4 },
                'q' => FieldType::Int { bytes: 8 },
                'Q' => FieldType::Uint { bytes: 8 },
                'r' => FieldType::Recno,
                'S' => FieldType::Str,
                'u' => FieldType::Bytes,
                's' => {
                    fields.push(FieldType::FixedStr(repeat.unwrap_or(1)));
                    continue;
                }
                't' => {
                    let width = repeat.unwrap_or(1);
                    if width == 0 || width > 8 {
                        return Err(invalid("bit field width must be 1..=8"));
                    }
                    fields.push(FieldType::Bits(width as u8));
                    continue;
                }
                'x' => continue,
                _ => return Err(invalid(&format!("unknown type character '{ch}'"))),
            };
            let n = repeat.unwrap_or(1);
            if n == 0 {
                return Err(invalid("repeat count must be positive"));
            }
            fields.extend(std::iter::repeat_n(single, n));
        }
        if count.is_some() {
            return Err(invalid("trailing repeat count"));
        }
        if fields.is_empty() {
            return Err(invalid("empty format"));
        }
        Ok(Self { text: text.to_string(), fields })
    }

    /// Builds a format from individual fields, as used for index keys.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::InvalidFormat`] when `fields` is empty.
    pub fn from_fields(fields: &[FieldType]) -> Result<Self, PackError> {
        let text: String = fields.iter().map(FieldType::code).collect();
        Self::parse(&text)
    }

    /// Returns the original format text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the parsed fields.
    pub fn fields(&self) -> &[FieldType] {
        &self.fields
    }

    /// True for a single record-number field (column-store keys).
    pub fn is_recno(&self) -> bool {
        self.fields == [FieldType::Recno]
    }

    /// True for a single bit field (fixed-length column-store values).
    pub fn is_fixed_bits(&self) -> bool {
        matches!(self.fields.as_slice(), [FieldType::Bits(_)])
    }

    /// Packs a row.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::FieldCount`] or [`PackError::FieldType`] when the
    /// row does not match the format.
    pub fn pack(&self, row: &Row) -> Result<Vec<u8>, PackError> {
        if row.len() != self.fields.len() {
            return Err(PackError::FieldCount {
                format: self.text.clone(),
                expected: self.fields.len(),
                found: row.len(),
            });
        }
        let mut out = Vec::new();
        let last = self.fields.len() - 1;
        for (index, (field, item)) in self.fields.iter().zip(row.items()).enumerate() {
            let bad = |message: String| PackError::FieldType {
                format: self.text.clone(),
                index,
                message,
            };
            match *field {
                FieldType::Int { bytes } => {
                    let value = item.to_i64().ok_or_else(|| bad(format!("expected integer, got {item}")))?;
                    let bits = u32::from(bytes) * 8;
                    let min = if bits == 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
                    let max = if bits == 64 { i64::MAX } else { (1i64 << (bits - 1)) - 1 };
                    if value < min || value > max {
                        return Err(bad(format!("{value} out of range for {bits}-bit integer")));
                    }
                    let biased = (i128::from(value) - i128::from(min)) as u64;
                    put_uint(&mut out, biased, bytes);
                }
                FieldType::Uint { bytes } => {
                    let value = item.to_u64().ok_or_else(|| bad(format!("expected unsigned integer, got {item}")))?;
                    if bytes < 8 && value >= 1u64 << (u32::from(bytes) * 8) {
                        return Err(bad(format!("{value} out of range for {}-byte integer", bytes)));
                    }
                    put_uint(&mut out, value, bytes);
                }
                FieldType::Recno => {
                    let value = item.to_u64().ok_or_else(|| bad(format!("expected record number, got {item}")))?;
                    put_uint(&mut out, value, 8);
                }
                FieldType::Str => {
                    let s = item.as_str().ok_or_else(|| bad(format!("expected string, got {item}")))?;
                    if s.as_bytes().contains(&0) {
                        return Err(bad("string contains NUL".to_string()));
                    }
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                FieldType::FixedStr(len) => {
                    let bytes = item
                        .as_bytes_like()
                        .ok_or_else(|| bad(format!("expected string, got {item}")))?;
                    let take = bytes.len().min(len);
                    out.extend_from_slice(&bytes[..take]);
                    out.resize(out.len() + (len - take), 0);
                }
                FieldType::Bytes => {
                    let bytes = item
                        .as_bytes_like()
                        .ok_or_else(|| bad(format!("expected bytes, got {item}")))?;
                    if index != last {
                        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    }
                    out.extend_from_slice(bytes);
                }
                FieldType::Bits(width) => {
                    let value = item.to_u64().ok_or_else(|| bad(format!("expected bit field, got {item}")))?;
                    if value >= 1u64 << width {
                        return Err(bad(format!("{value} does not fit in {width} bits")));
                    }
                    out.push(value as u8);
                }
            }
        }
        Ok(out)
    }

    /// Unpacks bytes produced by [`Format::pack`].
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Truncated`] if the bytes end early and
    /// [`PackError::FieldType`] for strings that are not UTF-8.
    pub fn unpack(&self, data: &[u8]) -> Result<Row, PackError> {
        let truncated = || PackError::Truncated { format: self.text.clone() };
        let mut items = Vec::with_capacity(self.fields.len());
        let mut pos = 0usize;
        let last = self.fields.len() - 1;
        for (index, field) in self.fields.iter().enumerate() {
            let rest = &data[pos..];
            match *field {
                FieldType::Int { bytes } => {
                    let width = usize::from(bytes);
                    if rest.len() < width {
                        return Err(truncated());
                    }
                    let biased = BigEndian::read_uint(&rest[..width], width);
                    let bits = u32::from(bytes) * 8;
                    let min: i128 = if bits == 64 { i128::from(i64::MIN) } else { -(1i128 << (bits - 1)) };
                    items.push(Item::Int((i128::from(biased) + min) as i64));
                    pos += width;
                }
                FieldType::Uint { bytes } => {
                    let width = usize::from(bytes);
                    if rest.len() < width {
                        return Err(truncated());
                    }
                    items.push(Item::Uint(BigEndian::read_uint(&rest[..width], width)));
                    pos += width;
                }
                FieldType::Recno => {
                    if rest.len() < 8 {
                        return Err(truncated());
                    }
                    items.push(Item::Uint(BigEndian::read_u64(&rest[..8])));
                    pos += 8;
                }
                FieldType::Str => {
                    let end = rest.iter().position(|&b| b == 0).ok_or_else(truncated)?;
                    let s = String::from_utf8(rest[..end].to_vec()).map_err(|_| PackError::FieldType {
                        format: self.text.clone(),
                        index,
                        message: "string is not UTF-8".to_string(),
                    })?;
                    items.push(Item::Str(s));
                    pos += end + 1;
                }
                FieldType::FixedStr(len) => {
                    if rest.len() < len {
                        return Err(truncated());
                    }
                    let raw = &rest[..len];
                    let trimmed = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
                    items.push(Item::Str(String::from_utf8_lossy(&raw[..trimmed]).into_owned()));
                    pos += len;
                }
                FieldType::Bytes => {
                    if index == last {
                        items.push(Item::Bytes(rest.to_vec()));
                        pos = data.len();
                    } else {
                        if rest.len() < 4 {
                            return Err(truncated());
                        }
                        let len = BigEndian::read_u32(&rest[..4]) as usize;
                        if rest.len() < 4 + len {
                            return Err(truncated());
                        }
                        items.push(Item::Bytes(rest[4..4 + len].to_vec()));
                        pos += 4 + len;
                    }
                }
                FieldType::Bits(_) => {
                    let byte = *rest.first().ok_or_else(truncated)?;
                    items.push(Item::Uint(u64::from(byte)));
                    pos += 1;
                }
            }
        }
        Ok(Row(items))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn put_uint(out: &mut Vec<u8>, value: u64, bytes: u8) {
    let width = usize::from(bytes);
    let start = out.len();
    out.resize(start + width, 0);
    BigEndian::write_uint(&mut out[start..], value, width);
}

/// A scalar key or value field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Item {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer, record number or bit field.
    Uint(u64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Item {
    /// Returns the value as a signed integer when it is numeric and fits.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Item::Int(v) => Some(*v),
            Item::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Returns the value as an unsigned integer when it is numeric and non-negative.
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            Item::Uint(v) => Some(*v),
            Item::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Returns the string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Item::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns raw bytes for byte items and strings.
    pub fn as_bytes_like(&self) -> Option<&[u8]> {
        match self {
            Item::Bytes(b) => Some(b),
            Item::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Int(v) => write!(f, "{v}"),
            Item::Uint(v) => write!(f, "{v}"),
            Item::Str(s) => write!(f, "{s}"),
            Item::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! item_from_int {
    ($variant:ident, $wide:ty, $($t:ty),+) => {
        $(impl From<$t> for Item {
            fn from(v: $t) -> Self {
                Item::$variant(<$wide>::from(v))
            }
        })+
    };
}

item_from_int!(Int, i64, i8, i16, i32, i64);
item_from_int!(Uint, u64, u8, u16, u32, u64);

impl From<usize> for Item {
    fn from(v: usize) -> Self {
        Item::Uint(v as u64)
    }
}

impl From<&str> for Item {
    fn from(v: &str) -> Self {
        Item::Str(v.to_string())
    }
}

impl From<String> for Item {
    fn from(v: String) -> Self {
        Item::Str(v)
    }
}

impl From<&String> for Item {
    fn from(v: &String) -> Self {
        Item::Str(v.clone())
    }
}

impl From<&[u8]> for Item {
    fn from(v: &[u8]) -> Self {
        Item::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Item {
    fn from(v: Vec<u8>) -> Self {
        Item::Bytes(v)
    }
}

/// A tuple of items: one key or one value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Row(pub Vec<Item>);

impl Row {
    /// Creates a row from items.
    pub fn new(items: Vec<Item>) -> Self {
        Self(items)
    }

    /// Returns the items.
    pub fn items(&self) -> &[Item] {
        &self.0
    }

    /// Consumes the row, returning its items.
    pub fn into_items(self) -> Vec<Item> {
        self.0
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the row has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns field `index`.
    pub fn get(&self, index: usize) -> Option<&Item> {
        self.0.get(index)
    }

    /// Appends a field.
    pub fn push(&mut self, item: impl Into<Item>) {
        self.0.push(item.into());
    }

    /// First field as a signed integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.0.first().and_then(Item::to_i64)
    }

    /// First field as an unsigned integer.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.first().and_then(Item::to_u64)
    }

    /// First field as a string.
    pub fn as_str(&self) -> Option<&str> {
        self.0.first().and_then(Item::as_str)
    }

    /// First field as bytes (strings included).
    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.0.first().and_then(Item::as_bytes_like)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

macro_rules! row_from_scalar {
    ($($t:ty),+) => {
        $(impl From<$t> for Row {
            fn from(v: $t) -> Self {
                Row(vec![Item::from(v)])
            }
        })+
    };
}

row_from_scalar!(i8, i16, i32, i64, u8, u16, u32, u64, usize, &str, String, &String, &[u8], Vec<u8>);

impl From<Item> for Row {
    fn from(v: Item) -> Self {
        Row(vec![v])
    }
}

impl From<Vec<Item>> for Row {
    fn from(v: Vec<Item>) -> Self {
        Row(v)
    }
}

impl<A: Into<Item>, B: Into<Item>> From<(A, B)> for Row {
    fn from((a, b): (A, B)) -> Self {
        Row(vec![a.into(), b.into()])
    }
}

impl<A: Into<Item>, B: Into<Item>, C: Into<Item>> From<(A, B, C)> for Row {
    fn from((a, b, c): (A, B, C)) -> Self {
        Row(vec![a.into(), b.into(), c.into()])
    }
}
