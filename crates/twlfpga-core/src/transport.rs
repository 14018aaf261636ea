//! USB transport abstraction
//!
//! The session, provisioning and bitstream code only talk to the bridge
//! through [`Transport`]. The real implementation lives in `twlfpga-ftdi`,
//! an in-memory board for tests in `twlfpga-dummy`.
//!
//! The IN side is modelled on a queue of outstanding bulk transfers:
//! [`Transport::submit_read`] adds one request to the queue and
//! [`Transport::wait_read`] returns completions strictly in submission order.

use core::fmt;
use std::time::Duration;

use crate::error::TransportError;

/// Result type for transport operations
pub type TransportResult<T> = core::result::Result<T, TransportError>;

/// FT2232H channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Channel {
    /// Channel A: FIFO data path to the FPGA
    #[default]
    A,
    /// Channel B: FPGA configuration control pins
    B,
}

impl Channel {
    /// wIndex used by SIO vendor requests addressed to this channel
    pub fn sio_index(self) -> u16 {
        match self {
            Channel::A => 1,
            Channel::B => 2,
        }
    }

    /// Get the channel letter
    pub fn letter(self) -> char {
        match self {
            Channel::A => 'A',
            Channel::B => 'B',
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Bridge bit modes (high byte of SIO_SET_BITMODE)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitMode {
    /// Asynchronous bit-bang
    Bitbang = 0x01,
    /// Synchronous 245 FIFO, all data lines clocked by the bridge
    SyncFifo = 0x40,
}

impl BitMode {
    /// Raw mode value
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Link to one physical board
///
/// All methods are blocking. Implementations must deliver IN completions in
/// the order the requests were submitted.
pub trait Transport {
    /// Maximum packet size of the bulk IN endpoints
    fn max_packet_size(&self) -> usize;

    /// Switch a channel to `mode` with `mask` selecting the output lines
    fn set_bitmode(&mut self, channel: Channel, mode: BitMode, mask: u8) -> TransportResult<()>;

    /// Drop whatever the bridge has buffered on the IN side of a channel
    fn purge_rx(&mut self, channel: Channel) -> TransportResult<()>;

    /// Sample the data lines of a channel
    fn read_pins(&mut self, channel: Channel) -> TransportResult<u8>;

    /// Blocking bulk write
    fn write(&mut self, channel: Channel, data: &[u8]) -> TransportResult<()>;

    /// Read one 16-bit word of the configuration EEPROM
    fn read_eeprom(&mut self, addr: u8) -> TransportResult<u16>;

    /// Write one 16-bit word of the configuration EEPROM
    fn write_eeprom(&mut self, addr: u8, word: u16) -> TransportResult<()>;

    /// Queue one bulk IN request of `len` bytes
    fn submit_read(&mut self, channel: Channel, len: usize) -> TransportResult<()>;

    /// Wait for the oldest outstanding IN request
    ///
    /// Returns `None` if nothing completed within `timeout`. A short
    /// completion is not an error.
    fn wait_read(&mut self, channel: Channel, timeout: Duration)
        -> Option<TransportResult<Vec<u8>>>;

    /// Cancel every outstanding IN request on a channel
    ///
    /// Cancelled requests still complete through [`Transport::wait_read`].
    fn cancel_reads(&mut self, channel: Channel);

    /// Number of IN requests not yet returned by [`Transport::wait_read`]
    fn pending_reads(&self, channel: Channel) -> usize;

    /// Release the device
    ///
    /// After this every other method fails with
    /// [`TransportError::Disconnected`].
    fn release(&mut self);
}
