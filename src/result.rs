//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// The ZIP archive contained invalid data per the spec.
    #[error("Invalid Zip archive: {0}")]
    InvalidArchive(&'static str),

    /// Decoding a UTF-8 name or extracted text failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The ZIP archive uses an unsupported feature
    /// (multi-disk layout, encryption, ...)
    #[error("Unsupported Zip archive: {0}")]
    UnsupportedArchive(String),

    /// An entry is stored with a compression method other than
    /// Store (0) or Deflate (8). The u16 is the method code.
    #[error("Unsupported compression method {0}")]
    UnsupportedCompression(u16),

    /// An entry's DEFLATE stream can't be decoded
    #[error("Corrupt DEFLATE stream: {0}")]
    CorruptStream(&'static str),

    /// The CRC-32 of the decompressed data doesn't match the stored one
    #[error("CRC-32 mismatch: computed {computed:#010x}, stored {stored:#010x}")]
    ChecksumMismatch { computed: u32, stored: u32 },

    /// The decompressed data isn't the size the archive declared
    #[error("Size mismatch: produced {produced} bytes, expected {expected}")]
    SizeMismatch { produced: usize, expected: usize },

    /// `extract` was called on a directory entry
    #[error("{0} is a directory")]
    IsADirectory(String),

    /// `list_directory` was called on a file entry
    #[error("{0} is not a directory")]
    NotADirectory(String),

    /// No entry exists at the provided path
    #[error("No entry in the archive at {0}")]
    NoSuchEntry(String),
}
