//! Tools for reading a ZIP archive.
//!
//! To start reading an archive, create a [`ZipArchive`] from a byte buffer
//! holding the complete archive image. Parsing builds the entry tree once;
//! every later lookup, listing, and extraction works off that immutable
//! state, so an archive can be read from as many threads as you like.
//!
//! [`ZipArchive`]: struct.ZipArchive.html

use std::collections::BTreeMap;

use log::*;

use crate::inflate::Inflater;
use crate::result::*;
use crate::spec;
use crate::tree::{Entry, EntryId, EntryTree};

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    Store,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// How [`ZipArchive::extract`] behaves.
///
/// The defaults decompress and validate everything.
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    /// Decompress the payload (`true`, the default) or hand it back exactly
    /// as stored (`false`). Raw payloads skip validation, since the stored
    /// CRC describes the decompressed bytes.
    pub decompress: bool,
    /// Don't compute or compare the output's CRC-32.
    pub skip_crc_validation: bool,
    /// Don't compare the output's length against the declared size.
    pub skip_size_validation: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            decompress: true,
            skip_crc_validation: false,
            skip_size_validation: false,
        }
    }
}

/// Entry totals for an archive; see [`ZipArchive::stats`].
///
/// [`ZipArchive::stats`]: struct.ZipArchive.html#method.stats
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub file_count: usize,
    pub dir_count: usize,
    /// Sum of the files' uncompressed sizes in bytes.
    pub total_size: usize,
}

/// A ZIP archive, parsed and organized for reading
pub struct ZipArchive<'a> {
    /// The complete archive image.
    mapping: &'a [u8],
    /// The entry arena and hierarchy built from the central directory.
    tree: EntryTree<'a>,
}

impl<'a> ZipArchive<'a> {
    /// Reads a ZIP archive from a byte slice: locates the End of central
    /// directory record, walks the central directory, and organizes the
    /// entries into a tree rooted at `"/"`.
    ///
    /// ```no_run
    /// # use std::fs;
    /// # use ziptree::ZipArchive;
    /// let bytes = fs::read("foo.zip")?;
    /// let archive = ZipArchive::new(&bytes)?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn new(mapping: &'a [u8]) -> ZipResult<Self> {
        let eocdr_posit = spec::find_eocdr(mapping)?;
        let eocdr = spec::EndOfCentralDirectory::parse(&mapping[eocdr_posit..])?;
        trace!("{:?}", eocdr);

        if eocdr.disk_number != eocdr.disk_with_central_directory {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
                eocdr.disk_number, eocdr.disk_with_central_directory
            )));
        }
        if eocdr.entries != eocdr.entries_on_this_disk {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: entries ({}) != entries this disk ({})",
                eocdr.entries, eocdr.entries_on_this_disk
            )));
        }

        let central_directory_offset = eocdr.central_directory_offset as usize;
        if central_directory_offset > eocdr_posit {
            return Err(ZipError::InvalidArchive(
                "Central directory starts past its end record",
            ));
        }
        trace!(
            "{} entries at offset {}",
            eocdr.entries,
            central_directory_offset
        );

        let mut central_directory = &mapping[central_directory_offset..];
        let mut flat = Vec::with_capacity(eocdr.entries as usize);
        for _ in 0..eocdr.entries {
            let record = spec::CentralDirectoryEntry::parse_and_consume(&mut central_directory)?;
            trace!("{:?}", record);

            let entry = Entry::from_record(&record)?;
            debug!("{:?}", entry);
            flat.push(entry);
        }

        let tree = EntryTree::build(flat);
        Ok(ZipArchive { mapping, tree })
    }

    /// The synthetic root directory, named `"/"`.
    pub fn root(&self) -> EntryId {
        self.tree.root
    }

    /// The entry behind an id.
    pub fn entry(&self, id: EntryId) -> &Entry<'a> {
        &self.tree.entries[id.0]
    }

    /// Every entry except the synthetic root, with its id: the archive's
    /// records directories-first in name order, then any directories that
    /// had to be synthesized.
    pub fn entries(&self) -> impl Iterator<Item = (EntryId, &Entry<'a>)> + '_ {
        self.tree
            .entries
            .iter()
            .enumerate()
            .skip(1)
            .map(|(i, entry)| (EntryId(i), entry))
    }

    /// Looks up an entry by path. `/` names the root; one leading and one
    /// trailing slash are otherwise ignored, so `/a/b`, `a/b`, and `a/b/`
    /// all name the same entry.
    pub fn find_entry(&self, path: &str) -> Option<EntryId> {
        self.tree.find(path)
    }

    /// The children of the directory at `path`, in tree order.
    pub fn list_directory(&self, path: &str) -> ZipResult<&[EntryId]> {
        let id = self
            .find_entry(path)
            .ok_or_else(|| ZipError::NoSuchEntry(path.to_string()))?;
        let entry = self.entry(id);
        if !entry.is_dir() {
            return Err(ZipError::NotADirectory(entry.name.to_string()));
        }
        Ok(&entry.children)
    }

    /// Visits every entry pre-order, parents before children, siblings in
    /// tree order; the root comes first at depth 0.
    pub fn walk<F: FnMut(&Entry<'a>, usize)>(&self, mut visit: F) {
        self.tree.walk(&mut visit);
    }

    /// Absolute path of an entry, rebuilt from its parent links.
    pub fn full_path(&self, id: EntryId) -> String {
        self.tree.full_path(id)
    }

    /// Counts files and directories and totals the files' uncompressed
    /// sizes. The synthetic root is not counted; synthesized directories
    /// are.
    pub fn stats(&self) -> ArchiveStats {
        let mut stats = ArchiveStats::default();
        for (_, entry) in self.entries() {
            if entry.is_dir() {
                stats.dir_count += 1;
            } else {
                stats.file_count += 1;
                stats.total_size += entry.size;
            }
        }
        stats
    }

    /// Extracts a single file entry into a fresh buffer.
    ///
    /// The payload is located through the entry's local file header,
    /// decompressed per its compression method, and checked against the
    /// stored CRC-32 and uncompressed size unless `options` says otherwise.
    /// Nothing in the archive is mutated; extracting the same entry twice
    /// yields equal buffers.
    pub fn extract(&self, id: EntryId, options: &ExtractOptions) -> ZipResult<Vec<u8>> {
        let entry = self.entry(id);
        if entry.is_dir() {
            return Err(ZipError::IsADirectory(entry.name.to_string()));
        }
        if entry.encrypted {
            return Err(ZipError::UnsupportedArchive(format!(
                "Can't read encrypted file {}",
                entry.name
            )));
        }

        let header_slice = self.mapping.get(entry.offset..).ok_or(
            ZipError::InvalidArchive("Local file header past end of archive"),
        )?;
        let header = spec::LocalFileHeader::parse(header_slice)?;
        trace!("{:?}", header);
        debug!("Reading {}", entry.name);

        let data = header_slice
            .get(header.header_size..)
            .ok_or(ZipError::InvalidArchive("File data past end of archive"))?;

        // Streamed entries (flag bit 3) carry zeros in the header; the real
        // CRC and sizes trail the payload in a data descriptor.
        let (crc32, compressed_size, uncompressed_size) = if header.has_data_descriptor() {
            let descriptor = spec::find_data_descriptor(data, entry.crc32)?;
            trace!("{:?}", descriptor);
            (
                descriptor.crc32,
                descriptor.compressed_size as usize,
                descriptor.uncompressed_size as usize,
            )
        } else {
            (
                header.crc32,
                header.compressed_size as usize,
                header.uncompressed_size as usize,
            )
        };

        let payload = data
            .get(..compressed_size)
            .ok_or(ZipError::InvalidArchive("File data past end of archive"))?;

        if !options.decompress {
            return Ok(payload.to_vec());
        }

        let output = match CompressionMethod::from_u16(header.compression_method) {
            CompressionMethod::Store => payload.to_vec(),
            CompressionMethod::Deflate => {
                Inflater::new().inflate(payload, Some(uncompressed_size))?
            }
            CompressionMethod::Unsupported(method) => {
                return Err(ZipError::UnsupportedCompression(method))
            }
        };

        if !options.skip_crc_validation {
            let computed = crc32fast::hash(&output);
            if computed != crc32 {
                return Err(ZipError::ChecksumMismatch {
                    computed,
                    stored: crc32,
                });
            }
        }
        if !options.skip_size_validation && output.len() != uncompressed_size {
            return Err(ZipError::SizeMismatch {
                produced: output.len(),
                expected: uncompressed_size,
            });
        }

        Ok(output)
    }

    /// Like [`extract`], but decodes the bytes as UTF-8.
    ///
    /// [`extract`]: #method.extract
    pub fn extract_string(&self, id: EntryId, options: &ExtractOptions) -> ZipResult<String> {
        let bytes = self.extract(id, options)?;
        String::from_utf8(bytes).map_err(|e| ZipError::Encoding(e.utf8_error()))
    }

    /// Extracts every file under `path`, keyed by full stored name.
    ///
    /// `path` must name an entry; files whose stored names start with it
    /// (after stripping one leading `/`) are extracted. An empty or `/`
    /// path extracts the whole archive.
    pub fn extract_directory(
        &self,
        path: &str,
        options: &ExtractOptions,
    ) -> ZipResult<BTreeMap<String, Vec<u8>>> {
        if self.find_entry(path).is_none() {
            return Err(ZipError::NoSuchEntry(path.to_string()));
        }
        let prefix = path.strip_prefix('/').unwrap_or(path);
        let mut extracted = BTreeMap::new();
        for (id, entry) in self.entries() {
            if entry.is_dir() || !entry.name.starts_with(prefix) {
                continue;
            }
            extracted.insert(entry.name.to_string(), self.extract(id, options)?);
        }
        Ok(extracted)
    }

    /// Like [`extract_directory`], but decodes each file as UTF-8.
    ///
    /// [`extract_directory`]: #method.extract_directory
    pub fn extract_directory_strings(
        &self,
        path: &str,
        options: &ExtractOptions,
    ) -> ZipResult<BTreeMap<String, String>> {
        if self.find_entry(path).is_none() {
            return Err(ZipError::NoSuchEntry(path.to_string()));
        }
        let prefix = path.strip_prefix('/').unwrap_or(path);
        let mut extracted = BTreeMap::new();
        for (id, entry) in self.entries() {
            if entry.is_dir() || !entry.name.starts_with(prefix) {
                continue;
            }
            extracted.insert(entry.name.to_string(), self.extract_string(id, options)?);
        }
        Ok(extracted)
    }
}
