//! Error types for the cellar storage engine.
//!
//! Every failure a caller can observe maps onto one of the reserved engine
//! codes ([`ErrorCode`]) or onto an ordinary system error (I/O, invalid
//! argument, busy). [`Error::code`] exposes the reserved code when there is
//! one.

use std::io;

use cellar_types::{ErrorCode, PackError, codec::CodecError, config::ConfigError};
use snafu::Snafu;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The requested item does not exist or is not visible.
    #[snafu(display("WT_NOTFOUND: item not found"))]
    NotFound,

    /// Insert of a key that already exists with overwrite disabled.
    #[snafu(display("WT_DUPLICATE_KEY: attempt to insert an existing key"))]
    DuplicateKey,

    /// Write-write conflict or eviction pressure; the transaction must roll back.
    #[snafu(display("WT_ROLLBACK: {reason}"))]
    Rollback {
        /// Why the operation conflicted.
        reason: String,
    },

    /// A read or write hit an update prepared by another transaction.
    #[snafu(display("WT_PREPARE_CONFLICT: conflict with a prepared update"))]
    PrepareConflict,

    /// The cache is full and cannot make progress.
    #[snafu(display("WT_CACHE_FULL: operation would overflow cache"))]
    CacheFull,

    /// The database needs recovery that the caller disallowed.
    #[snafu(display("WT_RUN_RECOVERY: recovery must be run to continue"))]
    RunRecovery,

    /// Unrecoverable failure; the connection refuses further work.
    #[snafu(display("WT_PANIC: {reason}"))]
    Panic {
        /// What went wrong.
        reason: String,
    },

    /// On-disk data failed validation.
    #[snafu(display("Corrupted data: {reason}"))]
    Corruption {
        /// What failed to validate.
        reason: String,
    },

    /// The resource is in use (open cursors, active transactions, open backup).
    #[snafu(display("Resource busy: {reason}"))]
    Busy {
        /// What is holding the resource.
        reason: String,
    },

    /// The caller passed a bad argument or called in the wrong state.
    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// The connection or cursor is read-only.
    #[snafu(display("Operation not permitted on a read-only handle"))]
    ReadOnly,

    /// The operation is not supported by this object.
    #[snafu(display("Operation not supported: {what}"))]
    Unsupported {
        /// The unsupported operation.
        what: String,
    },

    /// I/O error from the filesystem.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Configuration string was rejected.
    #[snafu(display("{source}"))]
    Config {
        /// The parser error.
        source: ConfigError,
    },

    /// Serialization or framing failed.
    #[snafu(display("Codec error: {source}"))]
    Codec {
        /// The codec error.
        source: CodecError,
    },
}

impl Error {
    /// Returns the reserved engine code for this error, if it has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::NotFound => Some(ErrorCode::NotFound),
            Error::DuplicateKey => Some(ErrorCode::DuplicateKey),
            Error::Rollback { .. } => Some(ErrorCode::Rollback),
            Error::PrepareConflict => Some(ErrorCode::PrepareConflict),
            Error::CacheFull => Some(ErrorCode::CacheFull),
            Error::RunRecovery => Some(ErrorCode::RunRecovery),
            Error::Panic { .. } => Some(ErrorCode::Panic),
            _ => None,
        }
    }

    /// Returns true for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// Returns true for errors that require the transaction to roll back.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Error::Rollback { .. } | Error::CacheFull)
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument { message: message.into() }
    }

    pub(crate) fn busy(reason: impl Into<String>) -> Self {
        Error::Busy { reason: reason.into() }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corruption { reason: reason.into() }
    }

    pub(crate) fn rollback(reason: impl Into<String>) -> Self {
        Error::Rollback { reason: reason.into() }
    }

    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        Error::Unsupported { what: what.into() }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::Config { source }
    }
}

impl From<CodecError> for Error {
    fn from(source: CodecError) -> Self {
        Error::Codec { source }
    }
}

impl From<PackError> for Error {
    fn from(err: PackError) -> Self {
        Error::InvalidArgument { message: err.to_string() }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_codes() {
        assert_eq!(Error::NotFound.code(), Some(ErrorCode::NotFound));
        assert_eq!(Error::rollback("conflict").code(), Some(ErrorCode::Rollback));
        assert_eq!(Error::PrepareConflict.code().map(ErrorCode::value), Some(-31808));
        assert_eq!(Error::busy("cursor open").code(), None);
        assert_eq!(Error::invalid("bad").code(), None);
    }

    #[test]
    fn test_display_carries_code_name() {
        assert!(Error::NotFound.to_string().starts_with("WT_NOTFOUND"));
        assert!(Error::DuplicateKey.to_string().starts_with("WT_DUPLICATE_KEY"));
        assert!(Error::RunRecovery.to_string().starts_with("WT_RUN_RECOVERY"));
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!err.is_rollback());
    }
}
