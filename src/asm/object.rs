//! VM32 object file format.
//!
//! An object file is a small little-endian header followed by the raw
//! memory image:
//!
//! | Field          | Size |
//! |----------------|------|
//! | magic `"VM32"` | 4    |
//! | version (1)    | 4    |
//! | entry IP       | 4    |
//! | memory words   | 4    |
//! | image          | rest |
//!
//! Files that do not start with the magic are raw memory images and load
//! with entry 0 and no minimum memory size.

use crate::cpu::memory::WORD_BYTES;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Object file magic.
pub const MAGIC: [u8; 4] = *b"VM32";

/// Current object format version.
pub const VERSION: u32 = 1;

/// Header size in bytes.
pub const HEADER_BYTES: usize = 16;

/// Largest memory size a program may request, in words (64 MiB).
pub const MAX_MEMORY_WORDS: u32 = 1 << 24;

/// A loaded program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFile {
    /// Initial instruction pointer.
    pub entry: u32,
    /// Minimum memory size in words.
    pub memory_words: u32,
    /// Initial memory contents, little-endian words.
    pub image: Vec<u8>,
}

impl ObjectFile {
    /// Wrap a raw memory image.
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            entry: 0,
            memory_words: 0,
            image,
        }
    }

    /// Number of words in the image, counting a trailing partial word.
    pub fn image_words(&self) -> usize {
        self.image.len().div_ceil(WORD_BYTES)
    }

    /// Serialize in the canonical format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_BYTES + self.image.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&self.entry.to_le_bytes());
        bytes.extend_from_slice(&self.memory_words.to_le_bytes());
        bytes.extend_from_slice(&self.image);
        bytes
    }
}

/// Reject memory sizes above [`MAX_MEMORY_WORDS`].
pub fn check_memory_words(words: u32) -> Result<u32, LoadError> {
    if words > MAX_MEMORY_WORDS {
        return Err(LoadError::MemoryTooLarge(words));
    }
    Ok(words)
}

/// Parse an object file or a raw memory image.
pub fn parse_object(bytes: &[u8]) -> Result<ObjectFile, LoadError> {
    if !bytes.starts_with(&MAGIC) {
        return Ok(ObjectFile::from_image(bytes.to_vec()));
    }
    if bytes.len() < HEADER_BYTES {
        return Err(LoadError::TruncatedHeader(bytes.len()));
    }

    let field = |i: usize| {
        let start = 4 * i;
        u32::from_le_bytes([bytes[start], bytes[start + 1], bytes[start + 2], bytes[start + 3]])
    };

    let version = field(1);
    if version != VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }

    Ok(ObjectFile {
        entry: field(2),
        memory_words: check_memory_words(field(3))?,
        image: bytes[HEADER_BYTES..].to_vec(),
    })
}

/// Load an object file or raw memory image from disk.
pub fn load_object<P: AsRef<Path>>(path: P) -> Result<ObjectFile, LoadError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let object = parse_object(&bytes)?;
    debug!(
        "loaded {} ({} image words, entry 0x{:08x})",
        path.display(),
        object.image_words(),
        object.entry
    );
    Ok(object)
}

/// Save an object file to disk in the canonical format.
pub fn save_object<P: AsRef<Path>>(path: P, object: &ObjectFile) -> Result<(), LoadError> {
    std::fs::write(path, object.to_bytes())?;
    Ok(())
}

/// Little-endian byte image of a word slice.
pub fn image_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Errors that can occur while loading a program.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object header truncated ({0} bytes)")]
    TruncatedHeader(usize),

    #[error("unsupported object version {0}")]
    UnsupportedVersion(u32),

    #[error("memory size of 0x{0:x} words exceeds the 0x{max:x} word limit", max = MAX_MEMORY_WORDS)]
    MemoryTooLarge(u32),
}
