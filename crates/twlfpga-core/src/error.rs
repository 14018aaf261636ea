//! Error types for twlfpga-core
//!
//! Every error is fatal to the tool invocation that hit it. The [`Phase`] of
//! an error is the label printed in front of the one-line diagnostic.

use core::fmt;

use thiserror::Error;

use crate::bitstream::LoadError;
use crate::eeprom::ProvisionError;
use crate::nor::NorError;
use crate::session::{Operation, SessionState};

/// Failure reported by a [`Transport`](crate::transport::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No device with a known identity is attached
    #[error("no matching USB device")]
    NotFound,

    /// The device exists but could not be opened or claimed
    #[error("device unavailable: {0}")]
    Busy(String),

    /// A transfer did not complete in time
    #[error("USB transfer timed out")]
    Timeout,

    /// The device went away
    #[error("device disconnected")]
    Disconnected,

    /// The device stalled a request
    #[error("request stalled by device")]
    Stall,

    /// Any other transfer failure
    #[error("USB transfer failed: {0}")]
    Transfer(String),
}

/// Hardware phase an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// USB link: open, mode switch, streaming
    Usb,
    /// EEPROM check and programming
    Eeprom,
    /// FPGA bitstream loading
    Fpga,
    /// NOR flash access through the FPGA
    Nor,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Usb => write!(f, "USB"),
            Phase::Eeprom => write!(f, "EEPROM"),
            Phase::Fpga => write!(f, "FPGA"),
            Phase::Nor => write!(f, "NOR"),
        }
    }
}

/// Session-level errors
#[derive(Debug, Error)]
pub enum Error {
    /// No board attached
    #[error("Error opening device: no twlfpga board found")]
    DeviceNotFound,

    /// Board attached but could not be claimed
    #[error("Error opening device: {0}")]
    DeviceBusy(String),

    /// EEPROM check or write failed
    #[error("Error checking/programming EEPROM: {0}")]
    Provisioning(#[from] ProvisionError),

    /// Bitstream file or its transfer to the FPGA failed
    #[error("Error loading bitstream: {0}")]
    ConfigLoad(#[from] LoadError),

    /// The bridge did not accept the synchronous FIFO mode
    #[error("Error setting SYNC FIFO mode: {0}")]
    ModeSwitch(#[source] TransportError),

    /// NOR flash command failed
    #[error("{0}")]
    Nor(#[from] NorError),

    /// Fatal transport failure while streaming
    #[error("Stream failed: {0}")]
    Io(#[source] TransportError),

    /// Operation issued in a state that does not allow it
    #[error("{op} not allowed while session is {state}")]
    InvalidState {
        /// State the session was in
        state: SessionState,
        /// Operation that was refused
        op: Operation,
    },
}

impl Error {
    /// The phase label used for diagnostics
    pub fn phase(&self) -> Phase {
        match self {
            Error::Provisioning(_) => Phase::Eeprom,
            Error::ConfigLoad(_) => Phase::Fpga,
            Error::Nor(_) => Phase::Nor,
            Error::DeviceNotFound
            | Error::DeviceBusy(_)
            | Error::ModeSwitch(_)
            | Error::Io(_)
            | Error::InvalidState { .. } => Phase::Usb,
        }
    }
}

/// Result type alias using the session Error type
pub type Result<T> = core::result::Result<T, Error>;
