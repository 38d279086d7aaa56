//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] and [`tree`] modules.
//!
//! Comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`read`]: ../read/index.html
//! [`tree`]: ../tree/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;
use std::convert::TryInto;

use chrono::{NaiveDate, NaiveDateTime};
use codepage_437::*;
use memchr::memmem;

use crate::read::CompressionMethod;
use crate::result::*;
use crate::tree::Entry;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Data descriptor magic number (optional; see 4.3.9.3)
const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];

/// Fixed portion of the End of central directory record.
const EOCDR_SIZE: usize = 22;
/// The trailing comment is at most 65,535 bytes, so the EOCDR signature sits
/// no further back than this from the end of the archive.
const EOCDR_SEARCH_WINDOW: usize = EOCDR_SIZE + u16::MAX as usize;

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::Store,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive; provides the offset of the central
/// directory, along with disk bookkeeping that stopped being relevant when
/// archives stopped spanning floppies.
#[derive(Debug)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> ZipResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // signature                       4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // disk with the start of the CD   2 bytes
        // CD entries on this disk         2 bytes
        // CD entries total                2 bytes
        // size of the central directory   4 bytes
        // offset of start of the CD       4 bytes
        // zipfile comment length          2 bytes

        // Assert the magic instead of checking for it
        // because the search should have found it.
        assert_eq!(eocdr[..4], EOCDR_MAGIC);
        eocdr = &eocdr[4..];
        let disk_number = read_u16(&mut eocdr);
        let disk_with_central_directory = read_u16(&mut eocdr);
        let entries_on_this_disk = read_u16(&mut eocdr);
        let entries = read_u16(&mut eocdr);
        let central_directory_size = read_u32(&mut eocdr);
        let central_directory_offset = read_u32(&mut eocdr);
        let comment_length = read_u16(&mut eocdr) as usize;
        if eocdr.len() < comment_length {
            return Err(ZipError::InvalidArchive(
                "End Of Central Directory Record comment overruns archive",
            ));
        }
        let file_comment = &eocdr[..comment_length];

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }
}

/// Searches backward through `mapping` for the End of central directory
/// record.
///
/// The record should be right at the end of the archive, but its variable
/// size means we can't jump to a known offset. The search is bounded to the
/// largest possible record (fixed part plus a maximal comment), and a
/// candidate signature only counts if its comment-length field agrees with
/// the bytes actually left behind the record, because archive bodies can
/// contain the signature bytes by chance.
pub fn find_eocdr(mapping: &[u8]) -> ZipResult<usize> {
    if mapping.len() < EOCDR_SIZE {
        return Err(ZipError::InvalidArchive(
            "Too small for an End Of Central Directory Record",
        ));
    }
    let window_start = mapping.len().saturating_sub(EOCDR_SEARCH_WINDOW);
    let window = &mapping[window_start..];

    for posit in memmem::rfind_iter(window, &EOCDR_MAGIC) {
        let posit = window_start + posit;
        if posit + EOCDR_SIZE > mapping.len() {
            continue;
        }
        let comment_length =
            u16::from_le_bytes(mapping[posit + 20..posit + 22].try_into().unwrap()) as usize;
        if posit + EOCDR_SIZE + comment_length == mapping.len() {
            return Ok(posit);
        }
    }
    Err(ZipError::InvalidArchive(
        "Couldn't find End Of Central Directory Record",
    ))
}

/// Data from a central directory entry
///
/// Each record describes one file or folder stored in the archive.
/// Fields we never consume (versions, attributes) are skipped over
/// rather than kept.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub flags: u16,
    pub compression_method: u16,
    /// MS-DOS packed modification stamp: time in the low 16 bits, date in
    /// the high 16, exactly as stored.
    pub last_modified: u32,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    pub fn parse_and_consume(entry: &mut &'a [u8]) -> ZipResult<Self> {
        // 4.3.12  Central directory structure, file header:
        //
        //   signature                       4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time + date       4 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name, extra field, file comment (variable size)
        if entry.len() < 46 {
            return Err(ZipError::InvalidArchive("Truncated central directory"));
        }
        if entry[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(ZipError::InvalidArchive("Invalid central directory entry"));
        }
        *entry = &entry[4..];
        let _source_version = read_u16(entry);
        let _minimum_extract_version = read_u16(entry);
        let flags = read_u16(entry);
        let compression_method = read_u16(entry);
        let last_modified = read_u32(entry);
        let crc32 = read_u32(entry);
        let compressed_size = read_u32(entry);
        let uncompressed_size = read_u32(entry);
        let path_length = read_u16(entry) as usize;
        let extra_field_length = read_u16(entry) as usize;
        let file_comment_length = read_u16(entry) as usize;
        let disk_number = read_u16(entry);
        let _internal_file_attributes = read_u16(entry);
        let _external_file_attributes = read_u32(entry);
        let header_offset = read_u32(entry);
        if entry.len() < path_length + extra_field_length + file_comment_length {
            return Err(ZipError::InvalidArchive(
                "Central directory entry overruns archive",
            ));
        }
        let (path, remaining) = entry.split_at(path_length);
        let (extra_field, remaining) = remaining.split_at(extra_field_length);
        let (file_comment, remaining) = remaining.split_at(file_comment_length);
        *entry = remaining;

        Ok(Self {
            flags,
            compression_method,
            last_modified,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumed to be CP437.
fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & (1 << 11) != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & 1 != 0
}

/// Decodes a stored file name per flag bit 11: UTF-8 when set,
/// CP437 otherwise.
fn decode_name(raw: &[u8], flags: u16) -> ZipResult<Cow<'_, str>> {
    if is_utf8(flags) {
        Ok(Cow::Borrowed(
            std::str::from_utf8(raw).map_err(ZipError::Encoding)?,
        ))
    } else {
        Ok(Cow::borrow_from_cp437(raw, &CP437_CONTROL))
    }
}

impl<'a> Entry<'a> {
    /// Distills a central directory record down to the fields the rest of
    /// the library works with.
    pub(crate) fn from_record(record: &CentralDirectoryEntry<'a>) -> ZipResult<Self> {
        let name = decode_name(record.path, record.flags)?;

        if record.disk_number != 0 {
            return Err(ZipError::UnsupportedArchive(format!(
                "No support for multi-disk archives: {} claims to be on disk {}",
                name, record.disk_number,
            )));
        }

        Ok(Entry {
            name,
            size: record.uncompressed_size as usize,
            offset: record.header_offset as usize,
            timestamp: record.last_modified,
            crc32: record.crc32,
            encrypted: is_encrypted(record.flags),
            parent: None,
            children: Vec::new(),
        })
    }
}

/// Decodes an MS-DOS packed timestamp (time in the low 16 bits, date in the
/// high 16) into a calendar form.
///
/// Returns `None` for fields outside the calendar; archives written by tools
/// that zero the timestamp have a month and day of zero.
pub(crate) fn parse_msdos(timestamp: u32) -> Option<NaiveDateTime> {
    let time = (timestamp & 0xFFFF) as u16;
    let date = (timestamp >> 16) as u16;

    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}

/// Data from a local file header
///
/// Each file's payload is immediately preceded by one of these. The name
/// and extra field aren't kept: the central directory already told us the
/// name, and the lengths only matter for finding where the payload starts.
#[derive(Debug)]
pub struct LocalFileHeader {
    pub flags: u16,
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// Total header size; the payload starts this many bytes after the
    /// header's own offset.
    pub header_size: usize,
}

impl LocalFileHeader {
    pub fn parse(header: &[u8]) -> ZipResult<Self> {
        // 4.3.7  Local file header:
        //
        // signature                       4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time + date       4 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name, extra field (variable size)
        if header.len() < 30 {
            return Err(ZipError::InvalidArchive("Truncated local file header"));
        }
        if header[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(ZipError::InvalidArchive("Invalid local file header"));
        }
        let mut rest = &header[4..];
        let _minimum_extract_version = read_u16(&mut rest);
        let flags = read_u16(&mut rest);
        let compression_method = read_u16(&mut rest);
        let _last_modified = read_u32(&mut rest);
        let crc32 = read_u32(&mut rest);
        let compressed_size = read_u32(&mut rest);
        let uncompressed_size = read_u32(&mut rest);
        let path_length = read_u16(&mut rest) as usize;
        let extra_field_length = read_u16(&mut rest) as usize;

        Ok(Self {
            flags,
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
            header_size: 30 + path_length + extra_field_length,
        })
    }

    pub fn has_data_descriptor(&self) -> bool {
        // Bit 3: the CRC and sizes were unknown when the header was written;
        // the real values trail the compressed data in a data descriptor.
        self.flags & (1 << 3) != 0
    }
}

/// The CRC and sizes trailing a file written with flag bit 3 set.
#[derive(Debug)]
pub struct DataDescriptor {
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

/// Finds the data descriptor behind a streamed entry.
///
/// `data` starts at the entry's payload; the payload length is exactly what
/// we don't know yet. Scan forward for either the optional descriptor
/// signature or the CRC the central directory stored for this entry. When
/// the signature was omitted, the matched word already is the CRC field.
pub fn find_data_descriptor(data: &[u8], cde_crc32: u32) -> ZipResult<DataDescriptor> {
    let descriptor_signature = u32::from_le_bytes(DATA_DESCRIPTOR_MAGIC);
    let mut posit = 0;
    while posit + 4 <= data.len() {
        // 4.3.9  Data descriptor:
        //
        // signature (optional)            4 bytes  (0x08074b50)
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        let word = u32::from_le_bytes(data[posit..posit + 4].try_into().unwrap());
        if word == descriptor_signature || word == cde_crc32 {
            let fields_at = if word == descriptor_signature {
                posit + 4
            } else {
                posit
            };
            if fields_at + 12 > data.len() {
                return Err(ZipError::InvalidArchive("Truncated data descriptor"));
            }
            let mut fields = &data[fields_at..];
            let crc32 = read_u32(&mut fields);
            let compressed_size = read_u32(&mut fields);
            let uncompressed_size = read_u32(&mut fields);
            return Ok(DataDescriptor {
                crc32,
                compressed_size,
                uncompressed_size,
            });
        }
        posit += 1;
    }
    Err(ZipError::InvalidArchive("Missing data descriptor"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eocdr_found_at_exact_end() {
        let mut archive = vec![0u8; 10];
        archive.extend_from_slice(&EOCDR_MAGIC);
        archive.extend_from_slice(&[0; 16]);
        archive.extend_from_slice(&[0, 0]); // comment length 0
        assert_eq!(find_eocdr(&archive).unwrap(), 10);
    }

    #[test]
    fn eocdr_found_behind_comment() {
        let comment = b"see you later, floppy disks";
        let mut archive = Vec::new();
        archive.extend_from_slice(&EOCDR_MAGIC);
        archive.extend_from_slice(&[0; 16]);
        archive.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        archive.extend_from_slice(comment);
        assert_eq!(find_eocdr(&archive).unwrap(), 0);
    }

    #[test]
    fn eocdr_signature_inside_comment_is_skipped() {
        // The comment itself contains signature bytes; the fake's
        // comment-length field won't match the bytes left after it.
        let mut comment = Vec::new();
        comment.extend_from_slice(&EOCDR_MAGIC);
        comment.extend_from_slice(&[0xFF; 18]);
        let mut archive = Vec::new();
        archive.extend_from_slice(&EOCDR_MAGIC);
        archive.extend_from_slice(&[0; 16]);
        archive.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        archive.extend_from_slice(&comment);
        assert_eq!(find_eocdr(&archive).unwrap(), 0);
    }

    #[test]
    fn eocdr_missing() {
        assert!(find_eocdr(&[0u8; 100]).is_err());
        assert!(find_eocdr(&[]).is_err());
    }

    #[test]
    fn msdos_timestamps() {
        // 2024-03-15 10:30:24
        let stamp = (0x586F << 16) | 0x53CC;
        assert_eq!(
            parse_msdos(stamp),
            NaiveDate::from_ymd_opt(2024, 3, 15)
                .unwrap()
                .and_hms_opt(10, 30, 24),
        );
        // A zeroed stamp has no month or day.
        assert_eq!(parse_msdos(0), None);
    }

    #[test]
    fn data_descriptor_with_signature() {
        let mut data = vec![0xAA; 7]; // payload bytes that match neither probe
        data.extend_from_slice(&DATA_DESCRIPTOR_MAGIC);
        data.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        let descriptor = find_data_descriptor(&data, 0xDEADBEEF).unwrap();
        assert_eq!(descriptor.crc32, 0xDEADBEEF);
        assert_eq!(descriptor.compressed_size, 7);
        assert_eq!(descriptor.uncompressed_size, 100);
    }

    #[test]
    fn data_descriptor_without_signature() {
        let mut data = vec![0xAA; 7];
        data.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&100u32.to_le_bytes());
        let descriptor = find_data_descriptor(&data, 0xDEADBEEF).unwrap();
        assert_eq!(descriptor.crc32, 0xDEADBEEF);
        assert_eq!(descriptor.compressed_size, 7);
    }

    #[test]
    fn data_descriptor_missing() {
        assert!(find_data_descriptor(&[0xAA; 32], 0xDEADBEEF).is_err());
    }
}
