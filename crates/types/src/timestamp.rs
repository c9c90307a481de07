//! Timestamp helpers.
//!
//! Timestamps are opaque 64-bit logical clocks chosen by the application.
//! Zero means "not set" and `u64::MAX` means "no stop". In configuration
//! strings they are written in hexadecimal.

/// A logical timestamp.
pub type Timestamp = u64;

/// The unset timestamp.
pub const TS_NONE: Timestamp = 0;

/// The maximum timestamp; used as "no stop time".
pub const TS_MAX: Timestamp = u64::MAX;

/// Parses a hexadecimal timestamp as used in configuration strings.
///
/// Returns `None` for empty input, non-hex digits or values wider than 64 bits.
pub fn parse_hex(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Formats a timestamp as lowercase hexadecimal.
pub fn format_hex(ts: Timestamp) -> String {
    format!("{ts:x}")
}

/// Formats a timestamp for diagnostics, spelling out the sentinels.
pub fn display(ts: Timestamp) -> String {
    match ts {
        TS_NONE => "none".to_string(),
        TS_MAX => "max".to_string(),
        other => other.to_string(),
    }
}
