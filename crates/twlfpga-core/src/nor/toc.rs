//! Flash image table of contents
//!
//! A NOR image carries a directory at 0x400. All fields are big-endian:
//!
//! ```text
//! 0x400  u32 magic, u32 entry count, u32 pad, u32 total length
//! 0x410  entries of 0x30 bytes: u64 offset, u64 size, char name[32]
//! ```
//!
//! Entry offsets are relative to the directory. Each region starts with a
//! 16-byte header whose last word is the length of the data actually stored
//! in it, the same header the image writer prepends.

use core::fmt;

use thiserror::Error;

/// Offset of the directory in the image
pub const TOC_OFFSET: usize = 0x400;
/// Space reserved for the directory
pub const TOC_LEN: usize = 0x400;
/// Directory header size
pub const TOC_HEADER_LEN: usize = 0x10;
/// Size of one entry
pub const TOC_ENTRY_LEN: usize = 0x30;
/// Size of the NUL-padded name field
pub const TOC_NAME_LEN: usize = 32;
/// Region header size
pub const IMAGE_HEADER_LEN: usize = 0x10;

/// Most entries the directory can hold
pub const MAX_TOC_ENTRIES: usize = (TOC_LEN - TOC_HEADER_LEN) / TOC_ENTRY_LEN;

/// Malformed directory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TocError {
    /// The image ends before a structure it refers to
    #[error("image is {len} bytes, {what} needs {needed}")]
    Truncated {
        /// What was being read
        what: &'static str,
        /// Bytes needed
        needed: u64,
        /// Bytes available
        len: usize,
    },

    /// The entry count does not fit the directory
    #[error("directory claims {0} entries, room for {max}", max = MAX_TOC_ENTRIES)]
    TooManyEntries(u32),
}

/// One region listed in the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    /// Absolute image offset of the region
    pub offset: u64,
    /// Region size
    pub size: u64,
    /// Data length stored in the region header
    pub stored_len: u32,
    /// Region name
    pub name: String,
}

impl TocEntry {
    /// One past the last byte of the region
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

impl fmt::Display for TocEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}..{:08x} [{:8x}/{:8x}] {}",
            self.offset,
            self.end(),
            self.stored_len,
            self.size,
            self.name
        )
    }
}

/// Parsed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toc {
    /// First header word
    pub magic: u32,
    /// Total length recorded in the header
    pub total_len: u32,
    /// Regions in directory order
    pub entries: Vec<TocEntry>,
}

/// Parse the directory of a full flash image
pub fn parse_toc(image: &[u8]) -> Result<Toc, TocError> {
    let header = slice(image, TOC_OFFSET as u64, TOC_HEADER_LEN, "directory header")?;
    let magic = be_u32(&header[0..4]);
    let count = be_u32(&header[4..8]);
    let total_len = be_u32(&header[12..16]);

    if count as usize > MAX_TOC_ENTRIES {
        return Err(TocError::TooManyEntries(count));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let at = TOC_OFFSET + TOC_HEADER_LEN + i * TOC_ENTRY_LEN;
        let raw = slice(image, at as u64, TOC_ENTRY_LEN, "directory entry")?;

        let offset = be_u64(&raw[0..8]).saturating_add(TOC_OFFSET as u64);
        let size = be_u64(&raw[8..16]);
        let name_field = &raw[16..16 + TOC_NAME_LEN];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TOC_NAME_LEN);
        let name = String::from_utf8_lossy(&name_field[..name_len]).into_owned();

        let region = slice(image, offset, IMAGE_HEADER_LEN, "region header")?;
        entries.push(TocEntry {
            offset,
            size,
            stored_len: stored_len(region).unwrap_or_default(),
            name,
        });
    }

    Ok(Toc {
        magic,
        total_len,
        entries,
    })
}

/// Region header announcing `len` bytes of data
pub fn image_header(len: u32) -> [u8; IMAGE_HEADER_LEN] {
    let mut header = [0u8; IMAGE_HEADER_LEN];
    header[12..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Data length from a region header
pub fn stored_len(header: &[u8]) -> Option<u32> {
    header.get(12..16).map(be_u32)
}

fn slice<'a>(
    image: &'a [u8],
    offset: u64,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], TocError> {
    let truncated = || TocError::Truncated {
        what,
        needed: offset.saturating_add(len as u64),
        len: image.len(),
    };
    let start = usize::try_from(offset).map_err(|_| truncated())?;
    image
        .get(start..start.checked_add(len).ok_or_else(truncated)?)
        .ok_or_else(truncated)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}
