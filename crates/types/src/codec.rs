//! Centralized serialization and framing.
//!
//! Structured records (metadata images, log payloads, page-log entries) are
//! encoded with postcard. Records that land on disk are wrapped in a frame
//! carrying their length and an XXH3 checksum so torn or corrupted writes
//! are detected on read.

use serde::{Serialize, de::DeserializeOwned};
use snafu::Snafu;

/// Size of the frame header: 4-byte length + 4-byte checksum.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Error type for codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Encoding failed.
    #[snafu(display("Encoding failed: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Decoding failed.
    #[snafu(display("Decoding failed: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// A frame was shorter than its header claims.
    #[snafu(display("Truncated frame: need {needed} bytes, have {available}"))]
    Truncated {
        /// Bytes required by the frame header.
        needed: usize,
        /// Bytes available in the buffer.
        available: usize,
    },

    /// A frame's checksum did not match its payload.
    #[snafu(display("Frame checksum mismatch: expected {expected:#010x}, found {found:#010x}"))]
    ChecksumMismatch {
        /// Checksum recorded in the frame header.
        expected: u32,
        /// Checksum computed over the payload.
        found: u32,
    },
}

/// Encodes a value to bytes using postcard serialization.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { source })
}

/// Decodes bytes to a value using postcard deserialization.
///
/// # Errors
///
/// Returns `CodecError::Decode` if deserialization fails.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|source| CodecError::Decode { source })
}

/// Computes the 32-bit checksum used by frames and block headers.
pub fn checksum32(data: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64(data) as u32
}

/// Wraps a payload in a `[len][checksum][payload]` frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&checksum32(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encodes a value and frames it.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode_framed<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(frame(&encode(value)?))
}

/// Reads one frame from the front of `buf`.
///
/// Returns the payload and the total number of bytes the frame occupies.
/// A zero-length header (all zeros) is reported as `Ok(None)`: that is how
/// pre-allocated or zero-filled space reads back.
///
/// # Errors
///
/// Returns `CodecError::Truncated` if the buffer ends inside the frame and
/// `CodecError::ChecksumMismatch` if the payload does not match its checksum.
pub fn unframe(buf: &[u8]) -> Result<Option<(&[u8], usize)>, CodecError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::Truncated { needed: FRAME_HEADER_SIZE, available: buf.len() });
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let expected = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if len == 0 && expected == 0 {
        return Ok(None);
    }
    let end = FRAME_HEADER_SIZE + len;
    if buf.len() < end {
        return Err(CodecError::Truncated { needed: end, available: buf.len() });
    }
    let payload = &buf[FRAME_HEADER_SIZE..end];
    let found = checksum32(payload);
    if found != expected {
        return Err(CodecError::ChecksumMismatch { expected, found });
    }
    Ok(Some((payload, end)))
}

/// Reads and decodes one frame from the front of `buf`.
///
/// # Errors
///
/// Propagates framing errors and `CodecError::Decode`.
pub fn decode_framed<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, CodecError> {
    match unframe(buf)? {
        Some((payload, used)) => Ok(Some((decode(payload)?, used))),
        None => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        table_id: u32,
        key: Vec<u8>,
        ts: u64,
    }

    #[test]
    fn test_struct_survives_encoding() {
        let original = Record { table_id: 7, key: b"k1".to_vec(), ts: 20 };
        let bytes = encode(&original).expect("encode");
        let decoded: Record = decode(&bytes).expect("decode");
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<Record, _> = decode(&[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(CodecError::Decode { .. })));
    }

    #[test]
    fn test_frame_detects_bit_flip() {
        let mut framed = frame(b"payload bytes");
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        assert!(matches!(unframe(&framed), Err(CodecError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_frame_detects_truncation() {
        let framed = frame(b"payload bytes");
        let err = unframe(&framed[..framed.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_zeroed_space_reads_as_end() {
        let zeros = [0u8; 32];
        assert!(unframe(&zeros).unwrap().is_none());
    }

    #[test]
    fn test_consecutive_frames() {
        let mut buf = encode_framed(&Record { table_id: 1, key: vec![1], ts: 1 }).unwrap();
        buf.extend(encode_framed(&Record { table_id: 2, key: vec![2], ts: 2 }).unwrap());

        let (first, used): (Record, usize) = decode_framed(&buf).unwrap().unwrap();
        let (second, _): (Record, usize) = decode_framed(&buf[used..]).unwrap().unwrap();
        assert_eq!(first.table_id, 1);
        assert_eq!(second.table_id, 2);
    }
}
