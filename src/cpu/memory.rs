//! VM32 memory subsystem.
//!
//! A flat, word-addressable store of 32-bit words. Addresses are word
//! indices, not byte offsets. This layer only knows about bounds; segment
//! and privilege checks happen in the CPU before an access reaches it.

use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Size of a memory word in bytes.
pub const WORD_BYTES: usize = 4;

/// VM32 linear memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    words: Vec<u32>,
}

impl Memory {
    /// Create a zeroed memory of `len` words.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len],
        }
    }

    /// Build a memory from a little-endian byte image.
    ///
    /// The memory holds at least `min_words` words; a trailing partial
    /// word in the image is zero-padded.
    pub fn from_image(image: &[u8], min_words: usize) -> Self {
        let image_words = image.len().div_ceil(WORD_BYTES);
        let mut mem = Self::new(image_words.max(min_words));
        mem.load_image(image);
        mem
    }

    /// Overwrite memory from the start with a little-endian byte image.
    /// Bytes past the end of memory are dropped.
    pub fn load_image(&mut self, image: &[u8]) {
        for (cell, chunk) in self.words.iter_mut().zip(image.chunks(WORD_BYTES)) {
            let mut bytes = [0u8; WORD_BYTES];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *cell = u32::from_le_bytes(bytes);
        }
    }

    /// Number of addressable words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Check if memory has no words at all.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Read one word.
    #[inline]
    pub fn read_word(&self, addr: u32) -> Result<u32, MemoryError> {
        let index = self.index(addr)?;
        Ok(self.words[index])
    }

    /// Write one word.
    #[inline]
    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        let index = self.index(addr)?;
        self.words[index] = value;
        Ok(())
    }

    /// Read `count` consecutive words starting at `addr`.
    ///
    /// Fails without returning anything if any word of the range is out
    /// of bounds.
    pub fn read_range(&self, addr: u32, count: usize) -> Result<Vec<u32>, MemoryError> {
        let start = addr as usize;
        let end = start
            .checked_add(count)
            .filter(|&end| end <= self.words.len())
            .ok_or(MemoryError::OutOfBounds {
                addr,
                len: self.words.len(),
            })?;
        Ok(self.words[start..end].to_vec())
    }

    fn index(&self, addr: u32) -> Result<usize, MemoryError> {
        let index = addr as usize;
        if index >= self.words.len() {
            return Err(MemoryError::OutOfBounds {
                addr,
                len: self.words.len(),
            });
        }
        Ok(index)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let non_zero = self.words.iter().filter(|w| **w != 0).count();

        f.debug_struct("Memory")
            .field("non_zero_words", &non_zero)
            .field("total_words", &self.words.len())
            .finish()
    }
}

/// Errors that can occur during memory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Address (or the end of a range) lies outside memory.
    #[error("address 0x{addr:08x} out of bounds (memory holds 0x{len:x} words)")]
    OutOfBounds { addr: u32, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_image_is_little_endian() {
        let mem = Memory::from_image(&[0xef, 0xbe, 0xad, 0xde, 0x01], 0);

        assert_eq!(mem.len(), 2);
        assert_eq!(mem.read_word(0).unwrap(), 0xdeadbeef);
        assert_eq!(mem.read_word(1).unwrap(), 0x01);
    }

    #[test]
    fn test_min_words_pads_memory() {
        let mem = Memory::from_image(&[1, 0, 0, 0], 0x200);
        assert_eq!(mem.len(), 0x200);
        assert_eq!(mem.read_word(0x1ff).unwrap(), 0);
    }

    #[test]
    fn test_read_range() {
        let mut mem = Memory::new(8);
        for i in 0..8 {
            mem.write_word(i, i * 10).unwrap();
        }

        assert_eq!(mem.read_range(5, 3).unwrap(), vec![50, 60, 70]);
        assert!(mem.read_range(6, 3).is_err());
        assert!(mem.read_range(u32::MAX, 3).is_err());
        assert_eq!(mem.read_range(8, 0).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_out_of_bounds_error() {
        let mut mem = Memory::new(4);
        assert_eq!(
            mem.write_word(4, 1),
            Err(MemoryError::OutOfBounds { addr: 4, len: 4 })
        );
    }

    proptest! {
        #[test]
        fn prop_write_then_read(len in 1usize..512, addr in any::<u32>(), value in any::<u32>()) {
            let mut mem = Memory::new(len);
            let addr = addr % len as u32;
            mem.write_word(addr, value).unwrap();
            prop_assert_eq!(mem.read_word(addr).unwrap(), value);
        }

        #[test]
        fn prop_past_end_is_out_of_bounds(len in 0usize..512, past in 0u32..1024) {
            let mut mem = Memory::new(len);
            let addr = len as u32 + past;
            prop_assert!(mem.read_word(addr).is_err());
            prop_assert!(mem.write_word(addr, 1).is_err());
        }
    }
}
