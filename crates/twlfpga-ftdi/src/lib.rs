//! twlfpga-ftdi - FT2232H USB transport for the twlfpga board
//!
//! Implements [`twlfpga_core::Transport`] on top of `nusb`, talking to the
//! FT2232H bridge with raw SIO vendor requests and bulk transfers. No vendor
//! library is needed.
//!
//! # Channels
//!
//! - **Channel A** (interface 0): data path. Bit-bang during FPGA
//!   configuration, synchronous 245 FIFO while sniffing.
//! - **Channel B** (interface 1): FPGA configuration control lines.
//!
//! # Example
//!
//! ```no_run
//! use twlfpga_core::{Session, StreamConfig};
//!
//! let mut session = Session::new();
//! session.open(twlfpga_ftdi::connect)?;
//! session.set_streaming_mode()?;
//! let mut count = 0u64;
//! session.read_stream(
//!     &mut |chunk: &[u8], _: &twlfpga_core::Progress| {
//!         count += chunk.len() as u64;
//!         std::ops::ControlFlow::Continue(())
//!     },
//!     &StreamConfig::default(),
//! )?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod device;
mod error;
pub mod protocol;

pub use device::{connect, FtdiBoard};
pub use error::{FtdiError, Result};
