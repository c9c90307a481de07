//! Reserved error codes.
//!
//! These are the conditions a caller is expected to handle by name. The
//! engine's error enum maps onto them; everything else is an invalid
//! argument, an I/O failure or corruption.

use std::fmt;

/// Reserved error codes returned verbatim by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Write-write conflict, cache pressure, or a read timestamp older than oldest.
    Rollback = -31800,
    /// An insert would overwrite an existing key.
    DuplicateKey = -31801,
    /// Key or record not found.
    NotFound = -31803,
    /// Invariant violation; the connection must be closed.
    Panic = -31804,
    /// The database needs recovery and was opened with `log=(recover=error)`.
    RunRecovery = -31806,
    /// An in-memory database is full.
    CacheFull = -31807,
    /// A read touched a prepared update.
    PrepareConflict = -31808,
}

impl ErrorCode {
    /// All reserved codes, in numeric order.
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::Rollback,
        ErrorCode::DuplicateKey,
        ErrorCode::NotFound,
        ErrorCode::Panic,
        ErrorCode::RunRecovery,
        ErrorCode::CacheFull,
        ErrorCode::PrepareConflict,
    ];

    /// Returns the stable name of the code.
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Rollback => "WT_ROLLBACK",
            ErrorCode::DuplicateKey => "WT_DUPLICATE_KEY",
            ErrorCode::NotFound => "WT_NOTFOUND",
            ErrorCode::Panic => "WT_PANIC",
            ErrorCode::RunRecovery => "WT_RUN_RECOVERY",
            ErrorCode::CacheFull => "WT_CACHE_FULL",
            ErrorCode::PrepareConflict => "WT_PREPARE_CONFLICT",
        }
    }

    /// Returns the numeric value of the code.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Looks a code up by its numeric value.
    pub fn from_value(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.value() == value)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_reserved_spellings() {
        assert_eq!(ErrorCode::Rollback.to_string(), "WT_ROLLBACK");
        assert_eq!(ErrorCode::NotFound.to_string(), "WT_NOTFOUND");
        assert_eq!(ErrorCode::DuplicateKey.to_string(), "WT_DUPLICATE_KEY");
        assert_eq!(ErrorCode::PrepareConflict.to_string(), "WT_PREPARE_CONFLICT");
        assert_eq!(ErrorCode::CacheFull.to_string(), "WT_CACHE_FULL");
        assert_eq!(ErrorCode::RunRecovery.to_string(), "WT_RUN_RECOVERY");
        assert_eq!(ErrorCode::Panic.to_string(), "WT_PANIC");
    }

    #[test]
    fn test_value_lookup() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_value(code.value()), Some(code));
        }
        assert_eq!(ErrorCode::from_value(0), None);
    }
}
