//! twlfpga-core - Hardware-independent core of the twlfpga tools
//!
//! The twlfpga board is an FPGA daughterboard behind an FT2232H USB bridge.
//! `loadbit` configures the FPGA and leaves the bridge in synchronous FIFO
//! mode. `sniffer` then streams captured NOR address-bus samples and prints
//! them as contiguous ranges, while `noralizer` uses the NOR bitstream to
//! read and program the flash directly.
//!
//! This crate contains everything that does not need a real USB stack:
//!
//! - [`transport`] - The [`Transport`] trait implemented by the USB backend
//! - [`session`] - The device session state machine and its operations
//! - [`stream`] - The continuous read loop and FTDI packet framing
//! - [`decoder`] - Byte-to-address assembly and run-length range output
//! - [`eeprom`] - The golden EEPROM image and the provisioning check
//! - [`bitstream`] - Bitstream file parsing and the SelectMAP load sequence
//! - [`nor`] - NOR flash commands, sector programming and the image directory
//!
//! # Example
//!
//! ```ignore
//! use twlfpga_core::{Decoder, Session, StreamConfig};
//!
//! let mut session = Session::new();
//! session.open(|| MyTransport::connect())?;
//! session.set_streaming_mode()?;
//!
//! let mut decoder = Decoder::new(std::io::stdout().lock());
//! session.read_stream(
//!     &mut |chunk: &[u8], _: &_| match decoder.feed(chunk) {
//!         Ok(()) => std::ops::ControlFlow::Continue(()),
//!         Err(_) => std::ops::ControlFlow::Break(()),
//!     },
//!     &StreamConfig::default(),
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bitstream;
pub mod decoder;
pub mod eeprom;
pub mod error;
pub mod nor;
pub mod session;
pub mod stream;
pub mod transport;

pub use decoder::{Decoder, RunEvent, RunTracker, WordAssembler};
pub use error::{Error, Phase, Result, TransportError};
pub use nor::{NorError, NorFlasher, NorProgress, SectorStep};
pub use session::{Operation, Session, SessionState};
pub use stream::{Progress, StreamConfig, StreamConsumer, StreamSummary};
pub use transport::{BitMode, Channel, Transport};
