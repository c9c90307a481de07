//! Shared types for the cellar storage engine.
//!
//! This crate holds the pieces every other crate needs without pulling in
//! the engine itself:
//! - Reserved error codes ([`ErrorCode`]) returned verbatim to callers
//! - Timestamp helpers (hexadecimal configuration encoding)
//! - Order-preserving key/value packing driven by format strings
//! - The postcard codec with checksummed framing
//! - The strict configuration parser and typed configuration records

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod error;
pub mod pack;
pub mod timestamp;

pub use error::ErrorCode;
pub use pack::{Format, Item, PackError, Row};
pub use timestamp::{TS_MAX, TS_NONE, Timestamp};
