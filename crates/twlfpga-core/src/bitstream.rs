//! FPGA bitstream parsing and loading
//!
//! The FPGA is configured in Slave SelectMAP x8 mode. Channel B of the bridge
//! runs in asynchronous bit-bang mode and drives the configuration control
//! lines; channel A bit-bangs the 8-bit data bus, with the bridge's write
//! strobe acting as CCLK.
//!
//! Both Xilinx `.bit` files and raw `.bin` streams are accepted. A `.bit`
//! file is recognised by its fixed 13-byte preamble, followed by tagged
//! fields:
//!
//! ```text
//! 'a' u16 len, design name      'b' u16 len, part name
//! 'c' u16 len, date             'd' u16 len, time
//! 'e' u32 len, configuration data
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use thiserror::Error;

use crate::error::TransportError;
use crate::transport::{BitMode, Channel, Transport};

/// Preamble of a Xilinx `.bit` file, up to the first field tag
pub const BIT_FILE_PREAMBLE: [u8; 13] = [
    0x00, 0x09, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x0F, 0xF0, 0x00, 0x00, 0x01,
];

/// Bytes per bulk write of configuration data
pub const DATA_CHUNK: usize = 4096;

/// Extra CCLK bytes clocked per poll while waiting for DONE
const DONE_CLOCK_BYTES: usize = 8;

const POLL_INTERVAL: Duration = Duration::from_millis(1);
const INIT_TIMEOUT: Duration = Duration::from_millis(500);
const DONE_TIMEOUT: Duration = Duration::from_secs(1);

bitflags! {
    /// Channel B lines wired to the FPGA configuration interface
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControlPins: u8 {
        /// DONE (input): configuration finished
        const DONE   = 1 << 2;
        /// CSI_B (output): SelectMAP chip select, active low
        const CSI_B  = 1 << 3;
        /// INIT_B (input): low while clearing or on CRC error
        const INIT_B = 1 << 5;
        /// RDWR_B (output): low selects write direction
        const RDWR_B = 1 << 6;
        /// PROG_B (output): low pulse restarts configuration
        const PROG_B = 1 << 7;
    }
}

/// Lines channel B drives
pub const CONTROL_OUTPUTS: ControlPins = ControlPins::PROG_B
    .union(ControlPins::CSI_B)
    .union(ControlPins::RDWR_B);

/// Problems with the bitstream file contents
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitstreamError {
    /// The file is empty
    #[error("bitstream is empty")]
    Empty,

    /// A field runs past the end of the file
    #[error("truncated .bit file at offset {offset}")]
    Truncated {
        /// Offset of the field that is cut short
        offset: usize,
    },

    /// A field tag this parser does not know
    #[error("unknown .bit field 0x{tag:02X} at offset {offset}")]
    UnknownTag {
        /// The tag byte
        tag: u8,
        /// Where it was found
        offset: usize,
    },

    /// The header ended without a data field
    #[error(".bit file has no configuration data field")]
    MissingData,
}

/// Errors while loading a bitstream
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be read
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The file contents are malformed
    #[error("malformed bitstream: {0}")]
    Malformed(#[from] BitstreamError),

    /// A USB request failed
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// INIT_B did not go low after PROG_B was asserted
    #[error("FPGA did not enter configuration (INIT_B stuck high)")]
    InitTimeout,

    /// INIT_B did not come back after PROG_B was released
    #[error("FPGA did not finish clearing configuration memory (INIT_B stuck low)")]
    ClearTimeout,

    /// INIT_B dropped during data transfer
    #[error("FPGA reported a CRC error")]
    CrcError,

    /// DONE never went high
    #[error("FPGA did not assert DONE")]
    DoneTimeout,
}

/// A parsed bitstream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitstream {
    /// Design name (`.bit` field 'a')
    pub design: Option<String>,
    /// Target part (`.bit` field 'b')
    pub part: Option<String>,
    /// Build date (`.bit` field 'c')
    pub date: Option<String>,
    /// Build time (`.bit` field 'd')
    pub time: Option<String>,
    /// Raw configuration data
    pub data: Vec<u8>,
}

impl Bitstream {
    /// Read and parse a bitstream file
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(bytes)?)
    }

    /// Parse a `.bit` file, or take anything else as raw configuration data
    pub fn parse(bytes: Vec<u8>) -> Result<Self, BitstreamError> {
        if bytes.is_empty() {
            return Err(BitstreamError::Empty);
        }
        if !bytes.starts_with(&BIT_FILE_PREAMBLE) {
            return Ok(Self {
                data: bytes,
                ..Self::default()
            });
        }

        let mut reader = FieldReader {
            bytes: &bytes,
            pos: BIT_FILE_PREAMBLE.len(),
        };
        let mut bitstream = Self::default();

        loop {
            let offset = reader.pos;
            let Some(tag) = reader.byte() else {
                return Err(BitstreamError::MissingData);
            };
            match tag {
                b'a' => bitstream.design = Some(reader.string()?),
                b'b' => bitstream.part = Some(reader.string()?),
                b'c' => bitstream.date = Some(reader.string()?),
                b'd' => bitstream.time = Some(reader.string()?),
                b'e' => {
                    let len = reader.take(4)?;
                    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
                    bitstream.data = reader.take(len)?.to_vec();
                    return Ok(bitstream);
                }
                _ => return Err(BitstreamError::UnknownTag { tag, offset }),
            }
        }
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn byte(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BitstreamError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(BitstreamError::Truncated { offset: self.pos })?;
        let field = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(field)
    }

    fn string(&mut self) -> Result<String, BitstreamError> {
        let len = self.take(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        let raw = self.take(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

fn read_control<T: Transport + ?Sized>(transport: &mut T) -> Result<ControlPins, TransportError> {
    Ok(ControlPins::from_bits_truncate(
        transport.read_pins(Channel::B)?,
    ))
}

/// Poll the control lines until `cond` holds; `None` on timeout
fn wait_control<T, F>(
    transport: &mut T,
    timeout: Duration,
    cond: F,
) -> Result<Option<ControlPins>, TransportError>
where
    T: Transport + ?Sized,
    F: Fn(ControlPins) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let pins = read_control(transport)?;
        if cond(pins) {
            return Ok(Some(pins));
        }
        if Instant::now() >= deadline {
            log::debug!("Control lines stuck at {:?}", pins);
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Push `bitstream` into the FPGA
///
/// `progress` is called with (bytes written, total bytes) after every chunk.
pub fn configure<T, P>(
    transport: &mut T,
    bitstream: &Bitstream,
    mut progress: P,
) -> Result<(), LoadError>
where
    T: Transport + ?Sized,
    P: FnMut(usize, usize),
{
    let data = &bitstream.data;

    // PROG_B, CSI_B and RDWR_B low: reset, select, write direction
    transport.set_bitmode(Channel::B, BitMode::Bitbang, CONTROL_OUTPUTS.bits())?;
    transport.write(Channel::B, &[ControlPins::empty().bits()])?;
    wait_control(transport, INIT_TIMEOUT, |p| !p.contains(ControlPins::INIT_B))?
        .ok_or(LoadError::InitTimeout)?;

    transport.write(Channel::B, &[ControlPins::PROG_B.bits()])?;
    wait_control(transport, INIT_TIMEOUT, |p| p.contains(ControlPins::INIT_B))?
        .ok_or(LoadError::ClearTimeout)?;
    log::debug!("FPGA cleared, sending {} bytes", data.len());

    transport.set_bitmode(Channel::A, BitMode::Bitbang, 0xFF)?;
    let mut buf = Vec::with_capacity(DATA_CHUNK);
    let mut written = 0;
    for chunk in data.chunks(DATA_CHUNK) {
        // SelectMAP x8 takes D0 as the MSB of each byte
        buf.clear();
        buf.extend(chunk.iter().map(|b| b.reverse_bits()));
        transport.write(Channel::A, &buf)?;
        written += chunk.len();
        progress(written, data.len());
    }

    let pins = read_control(transport)?;
    if !pins.intersects(ControlPins::INIT_B | ControlPins::DONE) {
        return Err(LoadError::CrcError);
    }

    let deadline = Instant::now() + DONE_TIMEOUT;
    while !read_control(transport)?.contains(ControlPins::DONE) {
        if Instant::now() >= deadline {
            return Err(LoadError::DoneTimeout);
        }
        transport.write(Channel::A, &[0xFF; DONE_CLOCK_BYTES])?;
        thread::sleep(POLL_INTERVAL);
    }

    transport.write(Channel::B, &[(ControlPins::PROG_B | ControlPins::CSI_B).bits()])?;
    Ok(())
}
