//! Typed configuration records.
//!
//! Configuration arrives as strings (`"create,cache_size=1GB,log=(enabled=true)"`)
//! and is parsed once, strictly, into one record per subsystem. Unknown keys
//! are rejected and integers are range checked. Every record can also be
//! built from Rust through a fallible builder that runs the same
//! validation.

mod connection;
mod parse;
mod schema;
mod session;

pub use connection::*;
pub use parse::{ConfigReader, ConfigValue, Entry, ParsedConfig, parse_size};
pub use schema::*;
pub use session::*;
use snafu::Snafu;

/// Configuration error.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ConfigError {
    /// A cross-field or semantic constraint failed.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// A key is not recognised in this position.
    #[snafu(display("unknown configuration key '{key}'"))]
    UnknownKey {
        /// Dotted path of the key.
        key: String,
    },

    /// An integer is smaller than allowed.
    #[snafu(display("Value {value} for key '{key}' below minimum {min}"))]
    BelowMinimum {
        /// Dotted path of the key.
        key: String,
        /// The supplied value.
        value: i64,
        /// The smallest accepted value.
        min: i64,
    },

    /// An integer is larger than allowed.
    #[snafu(display("Value {value} for key '{key}' above maximum {max}"))]
    AboveMaximum {
        /// Dotted path of the key.
        key: String,
        /// The supplied value.
        value: i64,
        /// The largest accepted value.
        max: i64,
    },

    /// A value has the wrong shape or is not one of the allowed words.
    #[snafu(display("invalid value '{value}' for key '{key}': {message}"))]
    InvalidValue {
        /// Dotted path of the key.
        key: String,
        /// The supplied value.
        value: String,
        /// What was expected.
        message: String,
    },

    /// The string does not follow the configuration grammar.
    #[snafu(display("configuration syntax error at offset {offset}: {message}"))]
    Syntax {
        /// Byte offset of the error.
        offset: usize,
        /// What went wrong.
        message: String,
    },
}

/// A record that can be filled from configuration entries.
///
/// `apply` reads keys with the record's current values as defaults, so the
/// same code serves initial parsing and incremental reconfiguration.
pub trait ConfigSection: Sized + Default {
    /// Reads this record's keys from `reader`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for malformed or out-of-range values.
    fn apply(&mut self, reader: &mut ConfigReader<'_>) -> Result<(), ConfigError>;

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when a constraint fails.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Parses a configuration string on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for syntax errors, unknown keys, or invalid values.
    fn parse(config: &str) -> Result<Self, ConfigError> {
        let mut value = Self::default();
        value.merge(config)?;
        Ok(value)
    }

    /// Applies a configuration string on top of the current values.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigSection::parse`].
    fn merge(&mut self, config: &str) -> Result<(), ConfigError> {
        let parsed = ParsedConfig::parse(config)?;
        let mut reader = parsed.reader();
        self.apply(&mut reader)?;
        reader.finish()?;
        self.validate()
    }
}

/// Parses an optional configuration string.
///
/// # Errors
///
/// Same as [`ConfigSection::parse`].
pub fn parse_opt<S: ConfigSection>(config: Option<&str>) -> Result<S, ConfigError> {
    S::parse(config.unwrap_or(""))
}
