//! Device session state machine
//!
//! A [`Session`] owns the link to one board for its whole lifetime. Every
//! operation is checked against [`SessionState::after`] before the transport
//! is touched, and the transport is released exactly once, either by
//! [`Session::close`] or when the session is dropped.
//!
//! ```text
//! Closed --open--> Open --set_streaming_mode--> StreamingMode --read_stream--> (Streaming)
//!                   |  \                               \--with_nor--> (Streaming)
//!                   |   provision_if_needed / load_configuration (back to Open)
//!                   |
//!  any failure ---> Faulted --close--> Closed
//! ```

use core::fmt;
use std::path::Path;

use crate::bitstream::{configure, Bitstream};
use crate::eeprom::{self, EepromConfig, EepromImage, ProvisionOutcome};
use crate::error::{Error, Result, TransportError};
use crate::nor::{self, NorFlasher};
use crate::stream::{self, StreamConfig, StreamConsumer, StreamSummary};
use crate::transport::{BitMode, Channel, Transport, TransportResult};

/// Lifecycle state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No device held
    Closed,
    /// Looking for and claiming the device
    Opening,
    /// Device claimed, bridge in its power-on mode
    Open,
    /// Checking or rewriting the EEPROM
    Provisioning,
    /// Pushing a bitstream into the FPGA
    Loading,
    /// Bridge switched to synchronous FIFO mode
    StreamingMode,
    /// Inside the continuous read loop
    Streaming,
    /// An operation failed; only close is allowed
    Faulted,
}

impl SessionState {
    /// Look up `op` in the transition table
    ///
    /// Returns the state held while the operation runs and the state entered
    /// when it succeeds, or `None` if `op` is not allowed in `self`.
    pub fn after(self, op: Operation) -> Option<(SessionState, SessionState)> {
        use Operation as Op;
        use SessionState as S;

        match (self, op) {
            (_, Op::Close) => Some((S::Closed, S::Closed)),
            (S::Closed, Op::Open) => Some((S::Opening, S::Open)),
            (S::Open, Op::Provision) => Some((S::Provisioning, S::Open)),
            (S::Open, Op::LoadConfiguration) => Some((S::Loading, S::Open)),
            (S::Open, Op::SetStreamingMode) => Some((S::Open, S::StreamingMode)),
            (S::StreamingMode, Op::ReadStream) => Some((S::Streaming, S::StreamingMode)),
            (S::StreamingMode, Op::NorAccess) => Some((S::Streaming, S::StreamingMode)),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Provisioning => "provisioning",
            SessionState::Loading => "loading",
            SessionState::StreamingMode => "in streaming mode",
            SessionState::Streaming => "streaming",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Session operations, as named in the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`Session::open`]
    Open,
    /// [`Session::provision_if_needed`]
    Provision,
    /// [`Session::load_configuration`]
    LoadConfiguration,
    /// [`Session::set_streaming_mode`]
    SetStreamingMode,
    /// [`Session::read_stream`]
    ReadStream,
    /// [`Session::with_nor`]
    NorAccess,
    /// [`Session::close`]
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Open => "open",
            Operation::Provision => "provision",
            Operation::LoadConfiguration => "load configuration",
            Operation::SetStreamingMode => "set streaming mode",
            Operation::ReadStream => "read stream",
            Operation::NorAccess => "NOR access",
            Operation::Close => "close",
        };
        f.write_str(name)
    }
}

/// One hardware link and its lifecycle
pub struct Session<T: Transport> {
    state: SessionState,
    transport: Option<T>,
}

impl<T: Transport> Default for Session<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Session<T> {
    /// Create a closed session
    pub fn new() -> Self {
        Self {
            state: SessionState::Closed,
            transport: None,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The transport while a device is held
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Mutable access to the transport while a device is held
    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    fn begin(&mut self, op: Operation) -> Result<SessionState> {
        let (during, done) = self.state.after(op).ok_or(Error::InvalidState {
            state: self.state,
            op,
        })?;
        self.state = during;
        Ok(done)
    }

    /// Run `f` on the transport as operation `op`
    fn run<R, F>(&mut self, op: Operation, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> Result<R>,
    {
        let done = self.begin(op)?;
        let result = match self.transport.as_mut() {
            Some(transport) => f(transport),
            None => Err(Error::Io(TransportError::Disconnected)),
        };
        self.state = match &result {
            Ok(_) => done,
            Err(e) => {
                log::debug!("{} failed, session faulted: {}", op, e);
                SessionState::Faulted
            }
        };
        result
    }

    /// Acquire the device returned by `connect`
    ///
    /// [`TransportError::NotFound`] becomes [`Error::DeviceNotFound`]; any
    /// other failure becomes [`Error::DeviceBusy`]. The session stays closed
    /// on failure.
    pub fn open<F>(&mut self, connect: F) -> Result<()>
    where
        F: FnOnce() -> TransportResult<T>,
    {
        let done = self.begin(Operation::Open)?;
        match connect() {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = done;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(match e {
                    TransportError::NotFound => Error::DeviceNotFound,
                    other => Error::DeviceBusy(other.to_string()),
                })
            }
        }
    }

    /// Make sure the EEPROM holds the twlfpga configuration
    pub fn provision_if_needed(&mut self) -> Result<ProvisionOutcome> {
        let golden = EepromConfig::twlfpga().build()?;
        self.provision(&golden)
    }

    /// Make sure the EEPROM holds `golden`
    pub fn provision(&mut self, golden: &EepromImage) -> Result<ProvisionOutcome> {
        self.run(Operation::Provision, |transport| {
            Ok(eeprom::check_and_program(transport, golden)?)
        })
    }

    /// Configure the FPGA from a `.bit` or `.bin` file
    ///
    /// `progress` receives (bytes written, total bytes).
    pub fn load_configuration<P>(&mut self, path: &Path, progress: P) -> Result<()>
    where
        P: FnMut(usize, usize),
    {
        self.run(Operation::LoadConfiguration, |transport| {
            let bitstream = Bitstream::from_file(path)?;
            load(transport, &bitstream, progress)
        })
    }

    /// Configure the FPGA from an already parsed bitstream
    pub fn load_bitstream<P>(&mut self, bitstream: &Bitstream, progress: P) -> Result<()>
    where
        P: FnMut(usize, usize),
    {
        self.run(Operation::LoadConfiguration, |transport| {
            load(transport, bitstream, progress)
        })
    }

    /// Switch channel A to synchronous FIFO mode with all lines active
    ///
    /// There is no way back within the same session.
    pub fn set_streaming_mode(&mut self) -> Result<()> {
        self.run(Operation::SetStreamingMode, |transport| {
            transport
                .set_bitmode(Channel::A, BitMode::SyncFifo, 0xFF)
                .map_err(Error::ModeSwitch)?;
            log::debug!("Channel A in synchronous FIFO mode");
            Ok(())
        })
    }

    /// Stream data into `consumer` until it breaks or the transport fails
    pub fn read_stream<C>(&mut self, consumer: &mut C, config: &StreamConfig) -> Result<StreamSummary>
    where
        C: StreamConsumer + ?Sized,
    {
        self.run(Operation::ReadStream, |transport| {
            stream::run(transport, consumer, config).map_err(Error::Io)
        })
    }

    /// Run `f` against the NOR bridge
    ///
    /// Requires streaming mode with the NOR bitstream loaded. The IN queue
    /// is started before `f` runs and drained afterwards.
    pub fn with_nor<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut NorFlasher<'_, T>) -> nor::Result<R>,
    {
        self.run(Operation::NorAccess, |transport| {
            let mut flasher = NorFlasher::attach(transport)?;
            Ok(f(&mut flasher)?)
        })
    }

    /// Release the device
    ///
    /// Allowed in every state and idempotent.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.release();
            log::debug!("Device released");
        }
        self.state = SessionState::Closed;
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn load<T, P>(transport: &mut T, bitstream: &Bitstream, progress: P) -> Result<()>
where
    T: Transport + ?Sized,
    P: FnMut(usize, usize),
{
    if let Some(design) = &bitstream.design {
        log::info!(
            "Bitstream {} for {} ({} {})",
            design,
            bitstream.part.as_deref().unwrap_or("unknown part"),
            bitstream.date.as_deref().unwrap_or("-"),
            bitstream.time.as_deref().unwrap_or("-"),
        );
    }
    configure(transport, bitstream, progress)?;
    log::info!("FPGA configured ({} bytes)", bitstream.data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SessionState; 8] = [
        SessionState::Closed,
        SessionState::Opening,
        SessionState::Open,
        SessionState::Provisioning,
        SessionState::Loading,
        SessionState::StreamingMode,
        SessionState::Streaming,
        SessionState::Faulted,
    ];

    #[test]
    fn test_close_allowed_everywhere() {
        for state in ALL_STATES {
            assert_eq!(
                state.after(Operation::Close),
                Some((SessionState::Closed, SessionState::Closed)),
                "close refused in {state}"
            );
        }
    }

    #[test]
    fn test_open_only_from_closed() {
        for state in ALL_STATES {
            let allowed = state.after(Operation::Open).is_some();
            assert_eq!(allowed, state == SessionState::Closed, "{state}");
        }
    }

    #[test]
    fn test_faulted_allows_only_close() {
        for op in [
            Operation::Open,
            Operation::Provision,
            Operation::LoadConfiguration,
            Operation::SetStreamingMode,
            Operation::ReadStream,
            Operation::NorAccess,
        ] {
            assert!(SessionState::Faulted.after(op).is_none(), "{op}");
        }
    }

    #[test]
    fn test_loader_path() {
        let mut state = SessionState::Closed;
        for op in [
            Operation::Open,
            Operation::Provision,
            Operation::LoadConfiguration,
            Operation::SetStreamingMode,
        ] {
            state = state.after(op).unwrap().1;
        }
        assert_eq!(state, SessionState::StreamingMode);
    }

    #[test]
    fn test_read_stream_requires_streaming_mode() {
        assert!(SessionState::Open.after(Operation::ReadStream).is_none());
        assert_eq!(
            SessionState::StreamingMode.after(Operation::ReadStream),
            Some((SessionState::Streaming, SessionState::StreamingMode))
        );
    }

    #[test]
    fn test_nor_access_requires_streaming_mode() {
        assert!(SessionState::Open.after(Operation::NorAccess).is_none());
        assert!(SessionState::Closed.after(Operation::NorAccess).is_none());
        assert_eq!(
            SessionState::StreamingMode.after(Operation::NorAccess),
            Some((SessionState::Streaming, SessionState::StreamingMode))
        );
    }

    #[test]
    fn test_mode_switch_is_one_way() {
        for op in [
            Operation::Provision,
            Operation::LoadConfiguration,
            Operation::SetStreamingMode,
        ] {
            assert!(SessionState::StreamingMode.after(op).is_none(), "{op}");
        }
    }

    #[test]
    fn test_invalid_state_message() {
        let err = Error::InvalidState {
            state: SessionState::Open,
            op: Operation::ReadStream,
        };
        assert_eq!(err.to_string(), "read stream not allowed while session is open");
    }
}
