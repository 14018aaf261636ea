//! NOR flash access through the FPGA bridge
//!
//! With the NOR bitstream loaded and the bridge in synchronous FIFO mode,
//! channel A carries [`command`] bytes to the FPGA and its answers back.
//! [`NorFlasher`] batches commands into bulk writes and keeps a queue of IN
//! transfers outstanding, the same way the stream loop does, so responses
//! are never dropped while a long command batch is still being written.
//!
//! The flash is a 16-bit part with 0x10000-word sectors and a 32-word write
//! buffer, programmed with the AMD command set. Addresses in this module are
//! word addresses unless a name says otherwise.

pub mod command;
pub mod toc;

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::TransportError;
use crate::stream::{self, packet_payloads, StreamConfig};
use crate::transport::{Channel, Transport};

pub use command::{Command, NorStatus};

/// Addressable words
pub const NOR_WORDS: u32 = command::MAX_WORD_ADDRESS + 1;
/// Flash size in bytes
pub const NOR_BYTES: u32 = NOR_WORDS * 2;
/// Words per erase sector
pub const SECTOR_WORDS: u32 = 0x1_0000;
/// Bytes per erase sector
pub const SECTOR_BYTES: u32 = SECTOR_WORDS * 2;
/// Words per write-buffer line
pub const LINE_WORDS: u32 = 32;
/// Bytes per write-buffer line
pub const LINE_BYTES: usize = LINE_WORDS as usize * 2;

/// Command bytes collected before a bulk write is issued
pub const WRITE_BATCH: usize = 16 * 1024;

/// Max-size packets per IN transfer
const PACKETS_PER_TRANSFER: usize = 64;

/// How long stale data is drained after the IN queue is primed
const SETTLE_TIME: Duration = Duration::from_millis(200);

/// Completion wait between deadline checks
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest silence tolerated while answers are outstanding
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Erase-sector settle time before the READY wait, in clocks
const ERASE_SETTLE_CLOCKS: u32 = 10;

// AMD command set
const UNLOCK_ADDR1: u32 = 0x555;
const UNLOCK_ADDR2: u32 = 0x2AA;
const UNLOCK_DATA1: u16 = 0xAA;
const UNLOCK_DATA2: u16 = 0x55;
const ERASE_SETUP: u16 = 0x80;
const SECTOR_ERASE: u16 = 0x30;
const WRITE_TO_BUFFER: u16 = 0x25;
const BUFFER_CONFIRM: u16 = 0x29;

/// NOR access errors
#[derive(Debug, Error)]
pub enum NorError {
    /// The USB link failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The bridge answered a ping with the wrong byte
    #[error("Ping failed (expected {expected:02x}, got {found:02x})")]
    PingFailed {
        /// Expected reply byte
        expected: u8,
        /// Received byte
        found: u8,
    },

    /// Answers stopped arriving
    #[error("timed out waiting for {expected} response bytes (got {received})")]
    Timeout {
        /// Bytes that were outstanding
        expected: usize,
        /// Bytes that arrived
        received: usize,
    },

    /// Read-back after programming differs
    #[error("Verification failed in sector at 0x{addr:06x}")]
    VerifyFailed {
        /// Byte address of the sector
        addr: u32,
    },

    /// Address not aligned as the operation requires
    #[error("Address 0x{addr:06x} must be aligned to 0x{align:x}")]
    Unaligned {
        /// Offending address
        addr: u32,
        /// Required alignment
        align: u32,
    },

    /// Access beyond the end of the flash
    #[error("Range 0x{start:06x}..0x{end:06x} is outside the flash")]
    OutOfRange {
        /// First address
        start: u32,
        /// One past the last address
        end: u32,
    },

    /// A write-buffer line must hold 1 to 32 words
    #[error("Line of {0} words does not fit the write buffer")]
    BadLine(usize),

    /// A full-sector write got the wrong amount of data
    #[error("Sector data is {0} bytes, expected 0x{len:x}", len = SECTOR_BYTES)]
    SectorSize(usize),
}

/// Result type for NOR operations
pub type Result<T> = core::result::Result<T, NorError>;

/// What happens to a sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorStep {
    /// Erasing
    Erase,
    /// Programming lines
    Program,
    /// Reading back
    Verify,
    /// Whole sector replaced
    Write,
    /// Part of the sector replaced, the rest preserved
    Patch,
}

impl fmt::Display for SectorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SectorStep::Erase => "erase",
            SectorStep::Program => "program",
            SectorStep::Verify => "verify",
            SectorStep::Write => "write",
            SectorStep::Patch => "patch",
        };
        f.write_str(name)
    }
}

/// Progress callbacks for long NOR operations
pub trait NorProgress {
    /// Sector `index` of `count`, at byte address `addr`, enters `step`
    fn sector(&mut self, addr: u32, index: usize, count: usize, step: SectorStep);

    /// `done` of `total` bytes read
    fn read_progress(&mut self, _done: usize, _total: usize) {}
}

/// A no-op progress reporter
pub struct NoProgress;

impl NorProgress for NoProgress {
    fn sector(&mut self, _addr: u32, _index: usize, _count: usize, _step: SectorStep) {}
}

/// Sector counts of a range write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// Sectors touched by the range
    pub sectors: usize,
    /// Sectors that had to be erased and reprogrammed
    pub rewritten: usize,
}

/// Word address of a sector-aligned byte address
pub fn sector_word_address(byte_addr: u32) -> Result<u32> {
    if byte_addr % SECTOR_BYTES != 0 {
        return Err(NorError::Unaligned {
            addr: byte_addr,
            align: SECTOR_BYTES,
        });
    }
    if byte_addr >= NOR_BYTES {
        return Err(NorError::OutOfRange {
            start: byte_addr,
            end: byte_addr.saturating_add(SECTOR_BYTES),
        });
    }
    Ok(byte_addr / 2)
}

fn check_range(start: u32, len: u64, limit: u32) -> Result<()> {
    if u64::from(start) + len > u64::from(limit) {
        return Err(NorError::OutOfRange {
            start,
            end: (u64::from(start) + len).min(u64::from(u32::MAX)) as u32,
        });
    }
    Ok(())
}

fn words_be(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0xFF)]))
        .collect()
}

/// Command link to the NOR bridge
///
/// Commands are buffered until [`WRITE_BATCH`] bytes are pending or an
/// answer is needed. Dropping the flasher cancels the IN queue.
pub struct NorFlasher<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    channel: Channel,
    packet_size: usize,
    transfer_len: usize,
    out: Vec<u8>,
    input: VecDeque<u8>,
}

impl<'a, T: Transport + ?Sized> NorFlasher<'a, T> {
    /// Start the IN queue and discard whatever the bridge had buffered
    pub fn attach(transport: &'a mut T) -> Result<Self> {
        let config = StreamConfig::default().packets_per_transfer(PACKETS_PER_TRANSFER);
        let packet_size = transport.max_packet_size();
        let transfer_len = config.packets_per_transfer * packet_size;

        transport.purge_rx(config.channel)?;
        stream::prime(transport, config.channel, transfer_len, config.queue_depth)?;

        let mut flasher = Self {
            transport,
            channel: config.channel,
            packet_size,
            transfer_len,
            out: Vec::with_capacity(WRITE_BATCH),
            input: VecDeque::new(),
        };
        flasher.settle()?;
        log::debug!(
            "NOR link up: {} x {} byte transfers",
            config.queue_depth,
            transfer_len
        );
        Ok(flasher)
    }

    fn settle(&mut self) -> Result<()> {
        let deadline = Instant::now() + SETTLE_TIME;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.transport.wait_read(self.channel, remaining) {
                None => break,
                Some(result) => {
                    let stale = result?;
                    log::trace!("Discarded {} stale bytes", stale.len());
                    self.transport.submit_read(self.channel, self.transfer_len)?;
                }
            }
        }
        self.input.clear();
        Ok(())
    }

    fn queue(&mut self, cmd: Command) -> Result<()> {
        cmd.encode(&mut self.out);
        if self.out.len() > WRITE_BATCH {
            let rest = self.out.split_off(WRITE_BATCH);
            let batch = std::mem::replace(&mut self.out, rest);
            self.transport.write(self.channel, &batch)?;
        }
        Ok(())
    }

    /// Send all buffered commands
    pub fn flush(&mut self) -> Result<()> {
        if !self.out.is_empty() {
            self.transport.write(self.channel, &self.out)?;
            self.out.clear();
        }
        Ok(())
    }

    /// Flush and collect `len` answer bytes
    fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        self.flush()?;
        let mut deadline = Instant::now() + RESPONSE_TIMEOUT;
        while self.input.len() < len {
            match self.transport.wait_read(self.channel, POLL_INTERVAL) {
                None => {
                    if Instant::now() >= deadline {
                        return Err(NorError::Timeout {
                            expected: len,
                            received: self.input.len(),
                        });
                    }
                }
                Some(result) => {
                    let data = result?;
                    for payload in packet_payloads(&data, self.packet_size) {
                        self.input.extend(payload);
                    }
                    self.transport.submit_read(self.channel, self.transfer_len)?;
                    deadline = Instant::now() + RESPONSE_TIMEOUT;
                }
            }
        }
        Ok(self.input.drain(..len).collect())
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = self.read(1)?;
        Ok(byte[0])
    }

    /// Check that the bridge answers
    pub fn ping(&mut self) -> Result<()> {
        self.queue(Command::Ping)?;
        let reply = self.read(command::PING_REPLY.len())?;
        for (&expected, &found) in command::PING_REPLY.iter().zip(&reply) {
            if expected != found {
                return Err(NorError::PingFailed { expected, found });
            }
        }
        Ok(())
    }

    /// Read the bus status
    pub fn state(&mut self) -> Result<NorStatus> {
        self.queue(Command::State)?;
        Ok(NorStatus::from_bits_retain(self.read_byte()?))
    }

    /// Whether flash supply is present
    pub fn vcc(&mut self) -> Result<bool> {
        Ok(self.state()?.contains(NorStatus::VCC))
    }

    /// Whether the FPGA drives the bus
    pub fn driving(&mut self) -> Result<bool> {
        Ok(self.state()?.contains(NorStatus::DRIVE))
    }

    /// Whether the south bridge is tristated
    pub fn tristated(&mut self) -> Result<bool> {
        Ok(!self.state()?.contains(NorStatus::TRIST_N))
    }

    /// Whether the flash is held in reset
    pub fn in_reset(&mut self) -> Result<bool> {
        Ok(!self.state()?.contains(NorStatus::RESET_N))
    }

    /// Enable or disable the FPGA's bus drivers
    pub fn set_drive(&mut self, on: bool) -> Result<()> {
        self.queue(Command::Drive(on))
    }

    /// Tristate or release the south bridge
    pub fn set_tristate(&mut self, on: bool) -> Result<()> {
        self.queue(Command::Tristate(on))
    }

    /// Assert or release flash reset
    pub fn set_reset(&mut self, on: bool) -> Result<()> {
        self.queue(Command::Reset(on))
    }

    /// Set the word address for the following accesses
    pub fn address(&mut self, addr: u32) -> Result<()> {
        check_range(addr, 1, NOR_WORDS)?;
        self.queue(Command::Address(addr))
    }

    /// Stall until the flash reports READY
    pub fn wait_ready(&mut self) -> Result<()> {
        self.queue(Command::Wait { increment: false })
    }

    /// Write one word at the current address
    pub fn write_word(&mut self, word: u16, increment: bool) -> Result<()> {
        self.queue(Command::Write { word, increment })
    }

    /// Write one word at `addr`
    pub fn write_at(&mut self, addr: u32, word: u16) -> Result<()> {
        self.address(addr)?;
        self.write_word(word, false)
    }

    /// Delay the command stream by `clocks` FPGA clocks
    pub fn delay(&mut self, clocks: u32) -> Result<()> {
        for cmd in command::delay_commands(clocks) {
            self.queue(cmd)?;
        }
        Ok(())
    }

    /// Delay the command stream by `us` microseconds
    pub fn udelay(&mut self, us: u32) -> Result<()> {
        self.delay(us.saturating_mul(command::CLOCKS_PER_US))
    }

    /// Read `count` words starting at `addr`, as big-endian bytes
    pub fn read_words(&mut self, addr: u32, count: u32) -> Result<Vec<u8>> {
        check_range(addr, u64::from(count), NOR_WORDS)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        self.address(addr)?;
        for _ in 0..count {
            self.queue(Command::Read { increment: true })?;
        }
        self.read(count as usize * 2)
    }

    /// Read `len` bytes starting at word `addr`, one sector at a time
    pub fn read_range<P>(&mut self, addr: u32, len: u32, progress: &mut P) -> Result<Vec<u8>>
    where
        P: NorProgress + ?Sized,
    {
        let words = len.div_ceil(2);
        check_range(addr, u64::from(words), NOR_WORDS)?;

        let mut data = Vec::with_capacity(words as usize * 2);
        let mut word = addr;
        while word < addr + words {
            let count = SECTOR_WORDS.min(addr + words - word);
            data.extend(self.read_words(word, count)?);
            word += count;
            progress.read_progress(data.len().min(len as usize), len as usize);
        }
        data.truncate(len as usize);
        Ok(data)
    }

    fn unlock(&mut self) -> Result<()> {
        self.write_at(UNLOCK_ADDR1, UNLOCK_DATA1)?;
        self.write_at(UNLOCK_ADDR2, UNLOCK_DATA2)
    }

    /// Erase the sector at word `addr` and wait for completion
    pub fn erase_sector(&mut self, addr: u32) -> Result<()> {
        if addr % SECTOR_WORDS != 0 {
            return Err(NorError::Unaligned {
                addr,
                align: SECTOR_WORDS,
            });
        }
        check_range(addr, u64::from(SECTOR_WORDS), NOR_WORDS)?;

        self.unlock()?;
        self.write_at(UNLOCK_ADDR1, ERASE_SETUP)?;
        self.unlock()?;
        self.write_at(addr, SECTOR_ERASE)?;
        self.delay(ERASE_SETTLE_CLOCKS)?;
        self.wait_ready()?;
        // The ping answer arrives only once the erase is done
        self.ping()
    }

    /// Program up to one write-buffer line starting at word `addr`
    pub fn program_line(&mut self, addr: u32, words: &[u16]) -> Result<()> {
        if addr % LINE_WORDS != 0 {
            return Err(NorError::Unaligned {
                addr,
                align: LINE_WORDS,
            });
        }
        if words.is_empty() || words.len() > LINE_WORDS as usize {
            return Err(NorError::BadLine(words.len()));
        }
        check_range(addr, words.len() as u64, NOR_WORDS)?;

        self.unlock()?;
        self.write_at(addr, WRITE_TO_BUFFER)?;
        self.write_at(addr, words.len() as u16 - 1)?;
        self.address(addr)?;
        for &word in words {
            self.write_word(word, true)?;
        }
        self.write_at(addr, BUFFER_CONFIRM)?;
        self.wait_ready()
    }

    /// Program every line of `data` that is not all 0xFF
    fn program_lines(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        for (i, line) in data.chunks(LINE_BYTES).enumerate() {
            if line.iter().all(|&b| b == 0xFF) {
                continue;
            }
            self.program_line(addr + i as u32 * LINE_WORDS, &words_be(line))?;
        }
        Ok(())
    }

    /// Replace `current` with `desired` in the sector at word `addr`
    ///
    /// Returns whether anything had to be written.
    fn rewrite_sector(&mut self, addr: u32, current: &[u8], desired: &[u8]) -> Result<bool> {
        if current == desired {
            return Ok(false);
        }
        self.erase_sector(addr)?;
        self.program_lines(addr, desired)?;
        if self.read_words(addr, SECTOR_WORDS)? != desired {
            return Err(NorError::VerifyFailed { addr: addr * 2 });
        }
        Ok(true)
    }

    /// Write a full sector at word `addr`, skipping it if unchanged
    pub fn write_sector(&mut self, addr: u32, data: &[u8]) -> Result<bool> {
        if data.len() != SECTOR_BYTES as usize {
            return Err(NorError::SectorSize(data.len()));
        }
        let current = self.read_words(addr, SECTOR_WORDS)?;
        self.rewrite_sector(addr, &current, data)
    }

    /// Replace part of a sector, preserving the rest
    ///
    /// `byte_addr` may point anywhere inside the sector, `data` must not
    /// cross its end.
    pub fn patch_sector(&mut self, byte_addr: u32, data: &[u8]) -> Result<bool> {
        let sector = byte_addr & !(SECTOR_BYTES - 1);
        let offset = (byte_addr - sector) as usize;
        check_range(offset as u32, data.len() as u64, SECTOR_BYTES)?;

        let current = self.read_words(sector / 2, SECTOR_WORDS)?;
        let mut desired = current.clone();
        desired[offset..offset + data.len()].copy_from_slice(data);
        self.rewrite_sector(sector / 2, &current, &desired)
    }

    /// Write `data` at `byte_addr`, rewriting only sectors that change
    pub fn write_range<P>(&mut self, byte_addr: u32, data: &[u8], progress: &mut P) -> Result<WriteStats>
    where
        P: NorProgress + ?Sized,
    {
        let mut stats = WriteStats::default();
        if data.is_empty() {
            return Ok(stats);
        }
        check_range(byte_addr, data.len() as u64, NOR_BYTES)?;

        let mask = !(SECTOR_BYTES - 1);
        let first = byte_addr & mask;
        let last = (byte_addr + data.len() as u32 - 1) & mask;
        stats.sectors = ((last - first) / SECTOR_BYTES + 1) as usize;

        let mut cursor = byte_addr;
        let mut rest = data;
        let mut index = 0;
        while !rest.is_empty() {
            let sector = cursor & mask;
            let offset = (cursor - sector) as usize;
            let take = rest.len().min(SECTOR_BYTES as usize - offset);
            let (chunk, tail) = rest.split_at(take);

            let (step, changed) = if take == SECTOR_BYTES as usize {
                (SectorStep::Write, self.write_sector(sector / 2, chunk)?)
            } else {
                (SectorStep::Patch, self.patch_sector(cursor, chunk)?)
            };
            if changed {
                stats.rewritten += 1;
            }
            progress.sector(sector, index, stats.sectors, step);

            index += 1;
            cursor += take as u32;
            rest = tail;
        }
        Ok(stats)
    }

    /// Erase and program whole sectors from `byte_addr`, then verify
    ///
    /// `byte_addr` must be sector aligned. Odd-length data is padded with
    /// 0xFF to a full word. Returns the number of sectors programmed.
    pub fn program<P>(&mut self, byte_addr: u32, data: &[u8], progress: &mut P) -> Result<usize>
    where
        P: NorProgress + ?Sized,
    {
        let base = sector_word_address(byte_addr)?;
        check_range(byte_addr, data.len() as u64, NOR_BYTES)?;

        let mut image = data.to_vec();
        if image.len() % 2 != 0 {
            image.push(0xFF);
        }
        let count = image.len().div_ceil(SECTOR_BYTES as usize);

        for (index, chunk) in image.chunks(SECTOR_BYTES as usize).enumerate() {
            let addr = base + index as u32 * SECTOR_WORDS;
            progress.sector(addr * 2, index, count, SectorStep::Erase);
            self.erase_sector(addr)?;
            progress.sector(addr * 2, index, count, SectorStep::Program);
            self.program_lines(addr, chunk)?;
            progress.sector(addr * 2, index, count, SectorStep::Verify);
            if self.read_words(addr, chunk.len() as u32 / 2)? != chunk {
                return Err(NorError::VerifyFailed { addr: addr * 2 });
            }
        }
        Ok(count)
    }

    /// Wait until flash supply is present, calling `poll` between checks
    pub fn wait_for_vcc<F: FnMut()>(&mut self, mut poll: F) -> Result<()> {
        while !self.vcc()? {
            poll();
        }
        Ok(())
    }

    /// Take over the flash bus from the south bridge and reset the flash
    pub fn take_bus(&mut self) -> Result<()> {
        self.set_drive(true)?;
        self.set_reset(true)?;
        self.udelay(40)?;
        self.set_reset(false)?;
        self.udelay(40)?;
        self.ping()
    }

    /// Stop driving the bus and give it back to the south bridge
    pub fn release_bus(&mut self) -> Result<()> {
        self.set_drive(false)?;
        self.set_tristate(false)?;
        self.flush()
    }
}

impl<T: Transport + ?Sized> Drop for NorFlasher<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::debug!("Dropping {} unsent command bytes: {}", self.out.len(), e);
        }
        stream::drain(self.transport, self.channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_word_address() {
        assert_eq!(sector_word_address(0).unwrap(), 0);
        assert_eq!(sector_word_address(0x40000).unwrap(), 0x20000);
        assert!(matches!(
            sector_word_address(0x10000),
            Err(NorError::Unaligned {
                addr: 0x10000,
                align: 0x20000
            })
        ));
        assert!(matches!(
            sector_word_address(NOR_BYTES),
            Err(NorError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_words_be() {
        assert_eq!(words_be(&[0x12, 0x34, 0xAB, 0xCD]), vec![0x1234, 0xABCD]);
        assert_eq!(words_be(&[0x12]), vec![0x12FF]);
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(0, u64::from(NOR_WORDS), NOR_WORDS).is_ok());
        assert!(check_range(1, u64::from(NOR_WORDS), NOR_WORDS).is_err());
        assert!(check_range(0x1FFFF, 1, SECTOR_BYTES).is_ok());
    }

    #[test]
    fn test_geometry() {
        assert_eq!(NOR_BYTES, 16 * 1024 * 1024);
        assert_eq!(SECTOR_BYTES, 0x20000);
        assert_eq!(LINE_BYTES, 0x40);
    }
}
