//! ziptree is a read-only ZIP archive reader that works entirely from a
//! byte buffer in memory. It rebuilds the archive's directory tree from the
//! central directory (including directories the archive only implies) and
//! decompresses entries with its own DEFLATE (RFC 1951) decoder, validating
//! CRC-32 checksums and sizes as it goes.
//!
//! ```no_run
//! # use std::fs;
//! use ziptree::{ExtractOptions, ZipArchive};
//!
//! let bytes = fs::read("foo.zip")?;
//! let archive = ZipArchive::new(&bytes)?;
//!
//! // Entries form a tree rooted at "/":
//! for &child in archive.list_directory("/")? {
//!     println!("{}", archive.entry(child).name);
//! }
//!
//! // ...and can be pulled out individually, CRC-checked by default:
//! let readme = archive
//!     .find_entry("docs/readme.txt")
//!     .expect("not in the archive");
//! let text = archive.extract_string(readme, &ExtractOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Zip is an interesting archive format: unlike compressed tarballs often
//! seen in Linux land (`*.tar.gz`, `*.tar.zst`, ...), each file in a Zip
//! archive is compressed independently, with a central directory telling us
//! where to find each file. Given the whole image in memory, any entry,
//! or any subtree via [`ZipArchive::extract_directory`], is therefore a
//! random access away.
//!
//! An archive is immutable once loaded, so extracting from one archive on
//! several threads at a time needs no synchronization at all.

pub mod read;
pub mod result;
pub mod tree;

pub use read::{ArchiveStats, CompressionMethod, ExtractOptions, ZipArchive};
pub use result::{ZipError, ZipResult};
pub use tree::{Entry, EntryId};

mod inflate;
mod spec;
