//! Error types for the FT2232H transport

use std::fmt;

use nusb::transfer::TransferError;
use twlfpga_core::TransportError;

/// Result type for FT2232H operations
pub type Result<T> = std::result::Result<T, FtdiError>;

/// Errors that can occur when talking to the bridge
#[derive(Debug)]
pub enum FtdiError {
    /// No twlfpga board or blank FT2232H found
    DeviceNotFound,

    /// Failed to open device
    OpenFailed(String),

    /// Failed to claim USB interface
    ClaimFailed(String),

    /// A control or bulk transfer failed
    Transfer {
        /// What was being done
        context: String,
        /// Underlying error
        source: TransferError,
    },

    /// A transfer returned less data than requested
    ShortRead(&'static str),

    /// USB enumeration error
    UsbError(String),

    /// The device has been released
    Released,
}

impl FtdiError {
    pub(crate) fn transfer(context: impl Into<String>, source: TransferError) -> Self {
        FtdiError::Transfer {
            context: context.into(),
            source,
        }
    }
}

impl fmt::Display for FtdiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtdiError::DeviceNotFound => {
                write!(f, "No twlfpga board found (VID:e461 PID:0014 or 0403:6010)")
            }
            FtdiError::OpenFailed(s) => write!(f, "Failed to open device: {}", s),
            FtdiError::ClaimFailed(s) => write!(f, "Failed to claim interface: {}", s),
            FtdiError::Transfer { context, source } => write!(f, "{}: {}", context, source),
            FtdiError::ShortRead(what) => write!(f, "Short read: {}", what),
            FtdiError::UsbError(s) => write!(f, "USB error: {}", s),
            FtdiError::Released => write!(f, "Device already released"),
        }
    }
}

impl std::error::Error for FtdiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FtdiError::Transfer { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<nusb::Error> for FtdiError {
    fn from(e: nusb::Error) -> Self {
        FtdiError::UsbError(e.to_string())
    }
}

impl From<FtdiError> for TransportError {
    fn from(e: FtdiError) -> Self {
        match e {
            FtdiError::DeviceNotFound => TransportError::NotFound,
            FtdiError::OpenFailed(s) | FtdiError::ClaimFailed(s) => TransportError::Busy(s),
            FtdiError::Released => TransportError::Disconnected,
            FtdiError::Transfer { source, .. } => match source {
                TransferError::Stall => TransportError::Stall,
                TransferError::Disconnected => TransportError::Disconnected,
                TransferError::Cancelled => TransportError::Timeout,
                other => TransportError::Transfer(other.to_string()),
            },
            other => TransportError::Transfer(other.to_string()),
        }
    }
}
