//! Packed per-block completion flags for an upload session.
//!
//! Bit `i` lives in byte `i / 8` at position `i % 8` (least significant bit
//! first). The byte form is what gets persisted in `upload_sessions.blocks`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBitmap {
    len: usize,
    bytes: Vec<u8>,
}

/// Stored bytes do not match the block count recorded with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapLengthMismatch {
    pub expected_bytes: usize,
    pub actual_bytes: usize,
}

impl fmt::Display for BitmapLengthMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bitmap holds {} bytes, expected {}",
            self.actual_bytes, self.expected_bytes
        )
    }
}

impl std::error::Error for BitmapLengthMismatch {}

impl BlockBitmap {
    /// All-clear bitmap tracking `len` blocks.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: vec![0; len.div_ceil(8)],
        }
    }

    /// Rebuild a bitmap of `len` blocks from its persisted bytes.
    pub fn from_bytes(len: usize, bytes: Vec<u8>) -> Result<Self, BitmapLengthMismatch> {
        let expected_bytes = len.div_ceil(8);
        if bytes.len() != expected_bytes {
            return Err(BitmapLengthMismatch {
                expected_bytes,
                actual_bytes: bytes.len(),
            });
        }
        Ok(Self { len, bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Out-of-range indices read as unset.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bytes[index / 8] & (1 << (index % 8)) != 0
    }

    /// Set bit `index`; returns false when it was already set or out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len || self.get(index) {
            return false;
        }
        self.bytes[index / 8] |= 1 << (index % 8);
        true
    }

    pub fn count_set(&self) -> usize {
        (0..self.len).filter(|&i| self.get(i)).count()
    }

    /// Index of the lowest unset bit, if any.
    pub fn first_missing(&self) -> Option<usize> {
        (0..self.len).find(|&i| !self.get(i))
    }

    pub fn is_complete(&self) -> bool {
        self.first_missing().is_none()
    }
}
