//! Chunk bitmap for live-restore migration tracking.
//!
//! Each bit records whether a fixed-size chunk of a destination file has
//! been copied from the restore source. The bitmap has a fixed length set
//! from the source file size, and is persisted in the metadata image so
//! a restart resumes migration where it stopped.

use serde::{Deserialize, Serialize};

/// Number of bits per word in the backing store.
const BITS_PER_WORD: u64 = 64;

/// Bitmap over the chunks of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    /// Backing store: each u64 tracks 64 chunks.
    words: Vec<u64>,
    /// Number of chunks covered.
    chunks: u64,
}

impl ChunkBitmap {
    /// Creates a bitmap for `chunks` chunks, none migrated.
    pub fn new(chunks: u64) -> Self {
        let words = chunks.div_ceil(BITS_PER_WORD) as usize;
        Self { words: vec![0; words], chunks }
    }

    /// Creates a bitmap sized for a file of `file_len` bytes.
    pub fn for_file(file_len: u64, chunk_size: u64) -> Self {
        Self::new(file_len.div_ceil(chunk_size.max(1)))
    }

    /// Number of chunks covered.
    pub fn len(&self) -> u64 {
        self.chunks
    }

    /// True when the bitmap covers no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    /// Marks a chunk migrated. Chunks beyond the end are ignored.
    pub fn set(&mut self, chunk: u64) {
        if chunk >= self.chunks {
            return;
        }
        self.words[(chunk / BITS_PER_WORD) as usize] |= 1u64 << (chunk % BITS_PER_WORD);
    }

    /// True when the chunk has been migrated, or lies beyond the source.
    pub fn is_set(&self, chunk: u64) -> bool {
        if chunk >= self.chunks {
            return true;
        }
        self.words[(chunk / BITS_PER_WORD) as usize] & (1u64 << (chunk % BITS_PER_WORD)) != 0
    }

    /// Number of migrated chunks.
    pub fn count(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// True when every chunk has been migrated.
    pub fn is_complete(&self) -> bool {
        self.count() == self.chunks
    }

    /// Returns the first chunk at or after `from` that still needs copying.
    pub fn next_unset(&self, from: u64) -> Option<u64> {
        (from..self.chunks).find(|&chunk| !self.is_set(chunk))
    }
}
