//! Parser for `key=value` configuration strings.
//!
//! Grammar:
//!
//! ```text
//! entries := entry (',' entry)* [',']
//! entry   := key ['=' value]
//! value   := '(' entries ')' | '[' value (',' value)* ']' | quoted | bare
//! ```
//!
//! A key without a value is a flag and reads as `true`. When a key repeats,
//! the last occurrence wins. [`ConfigReader`] walks the parsed entries,
//! records which keys were consumed, and rejects the rest.

use super::ConfigError;
use crate::timestamp::{self, Timestamp};

/// A parsed configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    /// A bare word, number or quoted string.
    Scalar(String),
    /// A parenthesised group of entries.
    Struct(Vec<Entry>),
    /// A bracketed list of values.
    List(Vec<ConfigValue>),
}

/// One `key[=value]` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The key.
    pub key: String,
    /// The value, absent for flags.
    pub value: Option<ConfigValue>,
}

/// A parsed configuration string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedConfig {
    entries: Vec<Entry>,
}

impl ParsedConfig {
    /// Parses a configuration string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Syntax`] for unbalanced brackets, unterminated
    /// quotes, or empty keys.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let mut parser = Parser { input: input.as_bytes(), pos: 0 };
        let entries = parser.entries(None)?;
        parser.skip_ws();
        if parser.pos != parser.input.len() {
            return Err(parser.error("unexpected trailing characters"));
        }
        Ok(Self { entries })
    }

    /// Returns the parsed entries.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Returns a strict reader over the top-level entries.
    pub fn reader(&self) -> ConfigReader<'_> {
        ConfigReader::new("", &self.entries)
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> ConfigError {
        ConfigError::Syntax { offset: self.pos, message: message.to_string() }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn entries(&mut self, close: Option<u8>) -> Result<Vec<Entry>, ConfigError> {
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => {
                    if close.is_some() {
                        return Err(self.error("unterminated group"));
                    }
                    return Ok(entries);
                }
                Some(c) if Some(c) == close => return Ok(entries),
                Some(b',') => {
                    self.pos += 1;
                    continue;
                }
                _ => {}
            }
            let key = self.word()?;
            if key.is_empty() {
                return Err(self.error("empty key"));
            }
            self.skip_ws();
            let value = if self.peek() == Some(b'=') {
                self.pos += 1;
                Some(self.value()?)
            } else {
                None
            };
            entries.push(Entry { key, value });
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                None => {}
                Some(c) if Some(c) == close => {}
                Some(_) => return Err(self.error("expected ','")),
            }
        }
    }

    fn value(&mut self) -> Result<ConfigValue, ConfigError> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let entries = self.entries(Some(b')'))?;
                self.pos += 1;
                Ok(ConfigValue::Struct(entries))
            }
            Some(b'[') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_ws();
                    match self.peek() {
                        None => return Err(self.error("unterminated list")),
                        Some(b']') => {
                            self.pos += 1;
                            return Ok(ConfigValue::List(items));
                        }
                        Some(b',') => self.pos += 1,
                        Some(_) => items.push(self.value()?),
                    }
                }
            }
            _ => Ok(ConfigValue::Scalar(self.word()?)),
        }
    }

    fn word(&mut self) -> Result<String, ConfigError> {
        self.skip_ws();
        if self.peek() == Some(b'"') {
            self.pos += 1;
            let start = self.pos;
            while let Some(c) = self.peek() {
                if c == b'"' {
                    let s = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
                    self.pos += 1;
                    return Ok(s);
                }
                self.pos += 1;
            }
            return Err(self.error("unterminated quoted string"));
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'=' | b',' | b'(' | b')' | b'[' | b']' | b'"') {
                break;
            }
            self.pos += 1;
        }
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).trim().to_string())
    }
}

/// Strict, consuming view over a list of entries.
///
/// Every accessor marks the key as consumed; [`ConfigReader::finish`] fails
/// on the first key nobody asked for.
pub struct ConfigReader<'a> {
    path: String,
    entries: &'a [Entry],
    used: Vec<bool>,
}

impl<'a> ConfigReader<'a> {
    /// Creates a reader; `path` prefixes keys in error messages.
    pub fn new(path: &str, entries: &'a [Entry]) -> Self {
        Self { path: path.to_string(), entries, used: vec![false; entries.len()] }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.path, key)
    }

    fn lookup(&mut self, key: &str) -> Option<&'a Entry> {
        let entries = self.entries;
        let mut found = None;
        for (i, entry) in entries.iter().enumerate() {
            if entry.key == key {
                self.used[i] = true;
                found = Some(entry);
            }
        }
        found
    }

    fn scalar(&mut self, key: &str) -> Result<Option<Option<&'a str>>, ConfigError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Entry { value: None, .. }) => Ok(Some(None)),
            Some(Entry { value: Some(ConfigValue::Scalar(s)), .. }) => Ok(Some(Some(s.as_str()))),
            Some(Entry { value: Some(_), .. }) => Err(ConfigError::InvalidValue {
                key: self.full_key(key),
                value: "(...)".to_string(),
                message: "expected a single value".to_string(),
            }),
        }
    }

    /// True when `key` is present (does not consume it).
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    /// Reads a boolean; a bare flag is `true`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything but `true/false/1/0`.
    pub fn bool(&mut self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.scalar(key)? {
            None => Ok(default),
            Some(None) => Ok(true),
            Some(Some(s)) => match s {
                "true" | "1" | "on" => Ok(true),
                "false" | "0" | "off" => Ok(false),
                other => Err(ConfigError::InvalidValue {
                    key: self.full_key(key),
                    value: other.to_string(),
                    message: "expected a boolean".to_string(),
                }),
            },
        }
    }

    /// Reads a bounded integer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`], [`ConfigError::AboveMaximum`]
    /// or [`ConfigError::InvalidValue`].
    pub fn int(&mut self, key: &str, default: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
        match self.scalar(key)? {
            None => Ok(default),
            Some(raw) => {
                let raw = raw.unwrap_or("1");
                let value = raw.parse::<i64>().map_err(|_| ConfigError::InvalidValue {
                    key: self.full_key(key),
                    value: raw.to_string(),
                    message: "expected an integer".to_string(),
                })?;
                self.check_range(key, value, min, max)
            }
        }
    }

    /// Reads a bounded byte size; accepts `B`, `K`, `KB`, `M`, `MB`, `G`, `GB`, `T`, `TB`.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigReader::int`].
    pub fn size(&mut self, key: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        match self.scalar(key)? {
            None => Ok(default),
            Some(raw) => {
                let raw = raw.unwrap_or("1");
                let value = parse_size(raw).ok_or_else(|| ConfigError::InvalidValue {
                    key: self.full_key(key),
                    value: raw.to_string(),
                    message: "expected a size".to_string(),
                })?;
                let clamp = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
                self.check_range(key, clamp(value), clamp(min), clamp(max)).map(|v| v as u64)
            }
        }
    }

    fn check_range(&self, key: &str, value: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
        if value < min {
            return Err(ConfigError::BelowMinimum { key: self.full_key(key), value, min });
        }
        if value > max {
            return Err(ConfigError::AboveMaximum { key: self.full_key(key), value, max });
        }
        Ok(value)
    }

    /// Reads a string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the value is a group or list.
    pub fn string(&mut self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.scalar(key)?.map(|v| v.unwrap_or_default().to_string()))
    }

    /// Reads one of a fixed set of words.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the value is not in `choices`.
    pub fn choice(
        &mut self,
        key: &str,
        default: &'static str,
        choices: &[&'static str],
    ) -> Result<&'static str, ConfigError> {
        let raw = match self.scalar(key)? {
            None => return Ok(default),
            Some(v) => v.unwrap_or_default(),
        };
        choices.iter().copied().find(|c| *c == raw).ok_or_else(|| ConfigError::InvalidValue {
            key: self.full_key(key),
            value: raw.to_string(),
            message: format!("expected one of {}", choices.join(", ")),
        })
    }

    /// Reads a hexadecimal timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for non-hex values.
    pub fn timestamp(&mut self, key: &str) -> Result<Option<Timestamp>, ConfigError> {
        match self.scalar(key)? {
            None => Ok(None),
            Some(raw) => {
                let raw = raw.unwrap_or_default();
                timestamp::parse_hex(raw).map(Some).ok_or_else(|| ConfigError::InvalidValue {
                    key: self.full_key(key),
                    value: raw.to_string(),
                    message: "expected a hexadecimal timestamp".to_string(),
                })
            }
        }
    }

    /// Reads a list: `[a,b]`, `(a,b)` or a single bare word.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for nested groups inside the list.
    pub fn list(&mut self, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
        let full = self.full_key(key);
        let nested_err = || ConfigError::InvalidValue {
            key: full.clone(),
            value: "(...)".to_string(),
            message: "expected a list of words".to_string(),
        };
        match self.lookup(key) {
            None => Ok(None),
            Some(Entry { value: None, .. }) => Ok(Some(Vec::new())),
            Some(Entry { value: Some(ConfigValue::Scalar(s)), .. }) => {
                Ok(Some(if s.is_empty() { Vec::new() } else { vec![s.clone()] }))
            }
            Some(Entry { value: Some(ConfigValue::Struct(entries)), .. }) => entries
                .iter()
                .map(|e| if e.value.is_none() { Ok(e.key.clone()) } else { Err(nested_err()) })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(Entry { value: Some(ConfigValue::List(items)), .. }) => items
                .iter()
                .map(|v| match v {
                    ConfigValue::Scalar(s) => Ok(s.clone()),
                    _ => Err(nested_err()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
        }
    }

    /// Opens a nested `(key=value,...)` group.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the key holds a scalar.
    pub fn nested(&mut self, key: &str) -> Result<Option<ConfigReader<'a>>, ConfigError> {
        let path = format!("{}{}.", self.path, key);
        match self.lookup(key) {
            None | Some(Entry { value: None, .. }) => Ok(None),
            Some(Entry { value: Some(ConfigValue::Struct(entries)), .. }) => {
                Ok(Some(ConfigReader::new(&path, entries)))
            }
            Some(Entry { value: Some(ConfigValue::Scalar(s)), .. }) if s.is_empty() => Ok(None),
            Some(Entry { value: Some(_), .. }) => Err(ConfigError::InvalidValue {
                key: self.full_key(key),
                value: "...".to_string(),
                message: "expected a (key=value,...) group".to_string(),
            }),
        }
    }

    /// Applies a nested group to `target`, if present.
    ///
    /// # Errors
    ///
    /// Propagates errors from the section and rejects unknown nested keys.
    pub fn section<S: super::ConfigSection>(&mut self, key: &str, target: &mut S) -> Result<(), ConfigError> {
        if let Some(mut nested) = self.nested(key)? {
            target.apply(&mut nested)?;
            nested.finish()?;
        }
        Ok(())
    }

    /// Fails on the first key that was never consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownKey`].
    pub fn finish(self) -> Result<(), ConfigError> {
        match self.used.iter().position(|used| !used) {
            Some(i) => Err(ConfigError::UnknownKey { key: self.full_key(&self.entries[i].key) }),
            None => Ok(()),
        }
    }
}

/// Parses a size with an optional unit suffix.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let base: u64 = digits.parse().ok()?;
    let shift = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" => 10,
        "M" | "MB" => 20,
        "G" | "GB" => 30,
        "T" | "TB" => 40,
        _ => return None,
    };
    base.checked_mul(1u64 << shift)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_and_lists() {
        let parsed =
            ParsedConfig::parse("create,log=(enabled=true,file_max=100K),verbose=[a,b],target=(\"table:a\",\"log:\")")
                .unwrap();
        let mut r = parsed.reader();
        assert!(r.bool("create", false).unwrap());
        let mut log = r.nested("log").unwrap().unwrap();
        assert!(log.bool("enabled", false).unwrap());
        assert_eq!(log.size("file_max", 0, 0, u64::MAX).unwrap(), 100 * 1024);
        log.finish().unwrap();
        assert_eq!(r.list("verbose").unwrap().unwrap(), vec!["a", "b"]);
        assert_eq!(r.list("target").unwrap().unwrap(), vec!["table:a", "log:"]);
        r.finish().unwrap();
    }

    #[test]
    fn test_unknown_key_rejected_with_path() {
        let parsed = ParsedConfig::parse("log=(enabled=true,bogus=1)").unwrap();
        let mut r = parsed.reader();
        let mut log = r.nested("log").unwrap().unwrap();
        log.bool("enabled", false).unwrap();
        let err = log.finish().unwrap_err();
        assert_eq!(err.to_string(), "unknown configuration key 'log.bogus'");
    }

    #[test]
    fn test_range_messages() {
        let parsed = ParsedConfig::parse("a=0,b=999").unwrap();
        let mut r = parsed.reader();
        let err = r.int("a", 5, 1, 10).unwrap_err();
        assert!(err.to_string().contains("below minimum"), "{err}");
        let err = r.int("b", 5, 1, 10).unwrap_err();
        assert!(err.to_string().contains("above maximum"), "{err}");
    }

    #[test]
    fn test_last_occurrence_wins() {
        let parsed = ParsedConfig::parse("x=1,x=2").unwrap();
        let mut r = parsed.reader();
        assert_eq!(r.int("x", 0, 0, 10).unwrap(), 2);
        r.finish().unwrap();
    }

    #[test]
    fn test_timestamps_are_hex() {
        let parsed = ParsedConfig::parse("commit_timestamp=1e").unwrap();
        let mut r = parsed.reader();
        assert_eq!(r.timestamp("commit_timestamp").unwrap(), Some(30));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(ParsedConfig::parse("a=(b=1"), Err(ConfigError::Syntax { .. })));
        assert!(matches!(ParsedConfig::parse("a=\"open"), Err(ConfigError::Syntax { .. })));
        assert!(matches!(ParsedConfig::parse("=1"), Err(ConfigError::Syntax { .. })));
    }

    #[test]
    fn test_choice() {
        let parsed = ParsedConfig::parse("isolation=read-committed,role=boss").unwrap();
        let mut r = parsed.reader();
        let iso = r.choice("isolation", "snapshot", &["snapshot", "read-committed"]).unwrap();
        assert_eq!(iso, "read-committed");
        assert!(r.choice("role", "leader", &["leader", "follower"]).is_err());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("1MB"), Some(1 << 20));
        assert_eq!(parse_size("2g"), Some(2 << 30));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("5Q"), None);
    }
}
