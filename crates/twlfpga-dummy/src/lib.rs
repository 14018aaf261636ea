//! twlfpga-dummy - In-memory twlfpga board emulator for testing
//!
//! [`DummyBoard`] implements [`Transport`] without any USB hardware. It
//! emulates the bridge EEPROM, the FPGA configuration pins, the NOR bridge
//! bitstream with its flash, and a scripted stream of IN completions. What
//! the session did to it is recorded in a shared [`BoardLog`].

mod nor;

pub use nor::NorChip;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use twlfpga_core::bitstream::ControlPins;
use twlfpga_core::eeprom::EEPROM_WORDS;
use twlfpga_core::stream::FTDI_STATUS_LEN;
use twlfpga_core::transport::TransportResult;
use twlfpga_core::{BitMode, Channel, Transport, TransportError};

/// Modem status bytes the dummy puts in front of every packet
pub const DUMMY_STATUS: [u8; FTDI_STATUS_LEN] = [0x31, 0x60];

/// Scripted outcome of the next IN request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadScript {
    /// Complete with these bytes (status bytes included)
    Data(Vec<u8>),
    /// Complete with an error
    Error(TransportError),
    /// Let one wait time out
    Idle,
}

/// How the emulated FPGA reacts to configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FpgaBehavior {
    /// Configures normally
    #[default]
    Normal,
    /// Never pulls INIT_B low
    NoInit,
    /// Pulls INIT_B low once data arrives
    CrcError,
    /// Accepts data but never raises DONE
    NoDone,
}

/// Everything the board saw, shared with the test
#[derive(Debug, Clone, Default)]
pub struct BoardLog {
    /// Calls to `release`
    pub releases: usize,
    /// IN requests submitted
    pub submits: usize,
    /// Outstanding IN requests when the first wait happened
    pub pending_at_first_wait: Option<usize>,
    /// Whether the RX purge happened before the first IN request
    pub purged_before_submit: Option<bool>,
    /// RX purges
    pub purges: usize,
    /// Every bitmode change
    pub bitmodes: Vec<(Channel, BitMode, u8)>,
    /// EEPROM words written
    pub eeprom_writes: usize,
    /// Bytes the FPGA received on its data bus, as seen on the pins
    pub fpga_data: Vec<u8>,
    /// Last value driven on channel B
    pub control: Option<u8>,
}

/// Handle to a board's log that outlives the board
pub type LogHandle = Rc<RefCell<BoardLog>>;

/// Emulated twlfpga board
pub struct DummyBoard {
    max_packet_size: usize,
    eeprom: [u16; EEPROM_WORDS],
    stuck_word: Option<u8>,
    fpga: FpgaBehavior,
    fail_mode: Option<(BitMode, TransportError)>,
    fifo_mode: bool,
    nor: NorChip,
    script: VecDeque<ReadScript>,
    pending: VecDeque<usize>,
    cancelled: usize,
    init: bool,
    done: bool,
    released: bool,
    log: LogHandle,
}

impl Default for DummyBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBoard {
    /// Create a board with a blank EEPROM and 512 byte packets
    pub fn new() -> Self {
        Self {
            max_packet_size: 512,
            eeprom: [0xFFFF; EEPROM_WORDS],
            stuck_word: None,
            fpga: FpgaBehavior::Normal,
            fail_mode: None,
            fifo_mode: false,
            nor: NorChip::new(),
            script: VecDeque::new(),
            pending: VecDeque::new(),
            cancelled: 0,
            init: true,
            done: false,
            released: false,
            log: Rc::default(),
        }
    }

    /// Use a different max packet size
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Preload the EEPROM
    pub fn with_eeprom(mut self, words: [u16; EEPROM_WORDS]) -> Self {
        self.eeprom = words;
        self
    }

    /// Make writes to one EEPROM word have no effect
    pub fn with_stuck_eeprom_word(mut self, addr: u8) -> Self {
        self.stuck_word = Some(addr);
        self
    }

    /// Select how the FPGA behaves during configuration
    pub fn with_fpga(mut self, behavior: FpgaBehavior) -> Self {
        self.fpga = behavior;
        self
    }

    /// Reject every switch to `mode`
    pub fn with_failing_mode(mut self, mode: BitMode, error: TransportError) -> Self {
        self.fail_mode = Some((mode, error));
        self
    }

    /// Put `chip` behind the NOR bridge
    pub fn with_nor(mut self, chip: NorChip) -> Self {
        self.nor = chip;
        self
    }

    /// The emulated NOR flash
    pub fn nor(&self) -> &NorChip {
        &self.nor
    }

    /// Queue scripted IN completions
    pub fn with_reads<I: IntoIterator<Item = ReadScript>>(mut self, reads: I) -> Self {
        self.script.extend(reads);
        self
    }

    /// Get a handle to the board's log
    pub fn board_log(&self) -> LogHandle {
        Rc::clone(&self.log)
    }

    /// Current EEPROM contents
    pub fn eeprom(&self) -> &[u16; EEPROM_WORDS] {
        &self.eeprom
    }

    fn check(&self) -> TransportResult<()> {
        if self.released {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn pins(&self) -> u8 {
        let mut pins = ControlPins::from_bits_truncate(self.log.borrow().control.unwrap_or(0xFF));
        pins.remove(ControlPins::INIT_B | ControlPins::DONE);
        pins.set(ControlPins::INIT_B, self.init);
        pins.set(ControlPins::DONE, self.done);
        pins.bits()
    }

    fn drive_control(&mut self, value: u8) {
        let pins = ControlPins::from_bits_truncate(value);
        let was_low = self
            .log
            .borrow()
            .control
            .is_some_and(|c| !ControlPins::from_bits_truncate(c).contains(ControlPins::PROG_B));

        if !pins.contains(ControlPins::PROG_B) {
            // Held in reset
            self.init = self.fpga == FpgaBehavior::NoInit;
            self.done = false;
            self.log.borrow_mut().fpga_data.clear();
        } else if was_low {
            self.init = true;
        }
        self.log.borrow_mut().control = Some(value);
    }

    fn clock_data(&mut self, data: &[u8]) {
        let selected = self
            .log
            .borrow()
            .control
            .is_some_and(|c| !ControlPins::from_bits_truncate(c).contains(ControlPins::CSI_B));
        if !selected || !self.init {
            return;
        }
        if self.done {
            // Startup clocks after DONE
            return;
        }
        self.log
            .borrow_mut()
            .fpga_data
            .extend(data.iter().map(|b| b.reverse_bits()));
        match self.fpga {
            FpgaBehavior::CrcError => self.init = false,
            FpgaBehavior::NoDone => {}
            FpgaBehavior::Normal | FpgaBehavior::NoInit => self.done = true,
        }
    }
}

/// Wrap `payload` into FTDI packets of `packet_size` bytes
pub fn frame(payload: &[u8], packet_size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in payload.chunks(packet_size - FTDI_STATUS_LEN) {
        out.extend_from_slice(&DUMMY_STATUS);
        out.extend_from_slice(chunk);
    }
    out
}

impl Transport for DummyBoard {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn set_bitmode(&mut self, channel: Channel, mode: BitMode, mask: u8) -> TransportResult<()> {
        self.check()?;
        if let Some((failing, error)) = &self.fail_mode {
            if *failing == mode {
                return Err(error.clone());
            }
        }
        if channel == Channel::A {
            self.fifo_mode = mode == BitMode::SyncFifo;
        }
        self.log.borrow_mut().bitmodes.push((channel, mode, mask));
        Ok(())
    }

    fn purge_rx(&mut self, channel: Channel) -> TransportResult<()> {
        self.check()?;
        if channel == Channel::A {
            let dropped = self.nor.take_output(usize::MAX);
            log::trace!("Purged {} bytes", dropped.len());
        }
        self.log.borrow_mut().purges += 1;
        Ok(())
    }

    fn read_pins(&mut self, channel: Channel) -> TransportResult<u8> {
        self.check()?;
        match channel {
            Channel::A => Ok(0),
            Channel::B => Ok(self.pins()),
        }
    }

    fn write(&mut self, channel: Channel, data: &[u8]) -> TransportResult<()> {
        self.check()?;
        match channel {
            Channel::A if self.fifo_mode => self.nor.receive(data),
            Channel::A => self.clock_data(data),
            Channel::B => {
                if let Some(&value) = data.last() {
                    self.drive_control(value);
                }
            }
        }
        Ok(())
    }

    fn read_eeprom(&mut self, addr: u8) -> TransportResult<u16> {
        self.check()?;
        self.eeprom
            .get(addr as usize)
            .copied()
            .ok_or(TransportError::Stall)
    }

    fn write_eeprom(&mut self, addr: u8, word: u16) -> TransportResult<()> {
        self.check()?;
        let slot = self
            .eeprom
            .get_mut(addr as usize)
            .ok_or(TransportError::Stall)?;
        if self.stuck_word != Some(addr) {
            *slot = word;
        }
        self.log.borrow_mut().eeprom_writes += 1;
        Ok(())
    }

    fn submit_read(&mut self, _channel: Channel, len: usize) -> TransportResult<()> {
        self.check()?;
        self.pending.push_back(len);
        let mut log = self.log.borrow_mut();
        log.submits += 1;
        if log.purged_before_submit.is_none() {
            log.purged_before_submit = Some(log.purges > 0);
        }
        Ok(())
    }

    fn wait_read(
        &mut self,
        _channel: Channel,
        _timeout: Duration,
    ) -> Option<TransportResult<Vec<u8>>> {
        if self.released {
            return Some(Err(TransportError::Disconnected));
        }
        if self.pending.is_empty() {
            return None;
        }
        {
            let mut log = self.log.borrow_mut();
            if log.pending_at_first_wait.is_none() {
                log.pending_at_first_wait = Some(self.pending.len());
            }
        }

        if self.cancelled > 0 {
            self.cancelled -= 1;
            self.pending.pop_front();
            return Some(Err(TransportError::Transfer("cancelled".into())));
        }

        let next = match self.script.pop_front() {
            Some(next) => next,
            None if self.nor.has_output() => {
                let len = self.pending.front().copied().unwrap_or(0);
                let packet = self.max_packet_size;
                let capacity = len / packet * (packet - FTDI_STATUS_LEN);
                ReadScript::Data(frame(&self.nor.take_output(capacity), packet))
            }
            None => return None,
        };

        match next {
            ReadScript::Idle => None,
            ReadScript::Data(mut data) => {
                let len = self.pending.pop_front().unwrap_or(0);
                data.truncate(len);
                log::trace!("Dummy IN completion of {} bytes", data.len());
                Some(Ok(data))
            }
            ReadScript::Error(e) => {
                self.pending.pop_front();
                Some(Err(e))
            }
        }
    }

    fn cancel_reads(&mut self, _channel: Channel) {
        self.cancelled = self.pending.len();
    }

    fn pending_reads(&self, _channel: Channel) -> usize {
        self.pending.len()
    }

    fn release(&mut self) {
        self.released = true;
        self.pending.clear();
        self.cancelled = 0;
        self.log.borrow_mut().releases += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;

    use twlfpga_core::bitstream::{Bitstream, LoadError};
    use twlfpga_core::eeprom::{EepromConfig, ProvisionError, ProvisionOutcome};
    use twlfpga_core::nor::command as nor_cmd;
    use twlfpga_core::nor::{NoProgress, WriteStats, LINE_BYTES, NOR_WORDS, SECTOR_BYTES};
    use twlfpga_core::{
        Decoder, Error, NorError, NorProgress, Operation, Phase, Progress, SectorStep, Session,
        SessionState, StreamConfig, StreamConsumer,
    };

    const PACKET: usize = 8;

    fn open(board: DummyBoard) -> Session<DummyBoard> {
        let mut session = Session::new();
        session.open(move || Ok(board)).unwrap();
        session
    }

    fn golden() -> [u16; EEPROM_WORDS] {
        *EepromConfig::twlfpga().build().unwrap().words()
    }

    fn small_stream() -> StreamConfig {
        StreamConfig::default().packets_per_transfer(2).queue_depth(4)
    }

    /// Collects chunks and stops on the first idle callback
    #[derive(Default)]
    struct Collect {
        chunks: Vec<Vec<u8>>,
    }

    impl StreamConsumer for Collect {
        fn on_chunk(&mut self, chunk: &[u8], _: &Progress) -> ControlFlow<()> {
            self.chunks.push(chunk.to_vec());
            ControlFlow::Continue(())
        }

        fn on_idle(&mut self, _: &Progress) -> ControlFlow<()> {
            ControlFlow::Break(())
        }
    }

    #[test]
    fn test_close_before_open() {
        let mut session: Session<DummyBoard> = Session::new();
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let board = DummyBoard::new();
        let board_log = board.board_log();
        let mut session = open(board);
        session.close();

        let closed = |err: Error| {
            matches!(
                err,
                Error::InvalidState {
                    state: SessionState::Closed,
                    ..
                }
            )
        };
        assert!(closed(session.set_streaming_mode().unwrap_err()));
        assert!(closed(session.provision_if_needed().unwrap_err()));
        assert!(closed(
            session
                .read_stream(&mut Collect::default(), &small_stream())
                .unwrap_err()
        ));
        assert!(closed(
            session
                .load_bitstream(&Bitstream::parse(vec![0xFF; 4]).unwrap(), |_, _| {})
                .unwrap_err()
        ));
        assert_eq!(session.state(), SessionState::Closed);

        session.close();
        drop(session);
        let log = board_log.borrow();
        assert_eq!(log.releases, 1);
        assert_eq!(log.submits, 0);
        assert!(log.bitmodes.is_empty());
    }

    #[test]
    fn test_open_failures() {
        let mut session: Session<DummyBoard> = Session::new();
        let err = session.open(|| Err(TransportError::NotFound)).unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
        assert_eq!(session.state(), SessionState::Closed);

        let err = session
            .open(|| Err(TransportError::Busy("claimed by another process".into())))
            .unwrap_err();
        assert!(matches!(err, Error::DeviceBusy(_)));
        assert_eq!(err.phase(), Phase::Usb);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_open_twice_refused() {
        let mut session = open(DummyBoard::new());
        let err = session.open(|| Ok(DummyBoard::new())).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: SessionState::Open,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_drop_releases_once() {
        let board = DummyBoard::new();
        let board_log = board.board_log();
        {
            let _session = open(board);
        }
        assert_eq!(board_log.borrow().releases, 1);
    }

    #[test]
    fn test_read_stream_requires_mode_switch() {
        let board = DummyBoard::new();
        let board_log = board.board_log();
        let mut session = open(board);

        let err = session
            .read_stream(&mut Collect::default(), &small_stream())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(board_log.borrow().submits, 0);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_queue_primed_before_first_callback() {
        let board = DummyBoard::new()
            .with_packet_size(PACKET)
            .with_reads([ReadScript::Data(frame(&[1, 2, 3], PACKET))]);
        let board_log = board.board_log();
        let mut session = open(board);
        session.set_streaming_mode().unwrap();

        let mut submits_at_first_chunk = None;
        let log = board_log.clone();
        let mut consumer = |_: &[u8], _: &Progress| {
            submits_at_first_chunk.get_or_insert(log.borrow().submits);
            ControlFlow::Break(())
        };
        session.read_stream(&mut consumer, &small_stream()).unwrap();

        assert_eq!(submits_at_first_chunk, Some(4));
        assert_eq!(board_log.borrow().pending_at_first_wait, Some(4));
        assert_eq!(board_log.borrow().purged_before_submit, Some(true));
    }

    #[test]
    fn test_stream_resubmits_and_drains() {
        let reads = (0..10).map(|i| ReadScript::Data(frame(&[i; 6], PACKET)));
        let board = DummyBoard::new().with_packet_size(PACKET).with_reads(reads);
        let board_log = board.board_log();
        let mut session = open(board);
        session.set_streaming_mode().unwrap();

        let mut collect = Collect::default();
        let summary = session.read_stream(&mut collect, &small_stream()).unwrap();

        assert_eq!(collect.chunks.len(), 10);
        assert_eq!(collect.chunks[9], vec![9; 6]);
        assert_eq!(summary.total_bytes, 60);
        assert_eq!(board_log.borrow().submits, 14);
        assert_eq!(session.transport().unwrap().pending_reads(Channel::A), 0);
        assert_eq!(session.state(), SessionState::StreamingMode);
    }

    #[test]
    fn test_stream_strips_status_bytes() {
        let payload: Vec<u8> = (0..20).collect();
        let board = DummyBoard::new()
            .with_packet_size(PACKET)
            .with_reads([ReadScript::Data(frame(&payload, PACKET))]);
        let mut session = open(board);
        session.set_streaming_mode().unwrap();

        let mut collect = Collect::default();
        session
            .read_stream(&mut collect, &StreamConfig::default().packets_per_transfer(4))
            .unwrap();

        assert_eq!(collect.chunks.concat(), payload);
        assert_eq!(collect.chunks[0].len(), PACKET - FTDI_STATUS_LEN);
    }

    #[test]
    fn test_stream_decodes_ranges() {
        let bytes = [0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x05];
        let board = DummyBoard::new()
            .with_packet_size(PACKET)
            .with_reads([ReadScript::Data(frame(&bytes, PACKET))]);
        let mut session = open(board);
        session.set_streaming_mode().unwrap();

        let mut decoder = Decoder::new(Vec::new());
        let mut consumer = |chunk: &[u8], _: &Progress| match decoder.feed(chunk) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        };
        session.read_stream(&mut consumer, &small_stream()).unwrap();

        assert_eq!(decoder.get_ref().as_slice(), b"000000..000003\n00000a");
        decoder.finish().unwrap();
        assert_eq!(decoder.into_inner(), b"000000..000003\n00000a+\n");
    }

    #[test]
    fn test_stream_error_releases_once() {
        let board = DummyBoard::new().with_packet_size(PACKET).with_reads([
            ReadScript::Data(frame(&[7; 6], PACKET)),
            ReadScript::Error(TransportError::Disconnected),
        ]);
        let board_log = board.board_log();
        let mut session = open(board);
        session.set_streaming_mode().unwrap();

        let err = session
            .read_stream(&mut Collect::default(), &small_stream())
            .unwrap_err();
        assert!(matches!(err, Error::Io(TransportError::Disconnected)));
        assert_eq!(session.state(), SessionState::Faulted);

        session.close();
        drop(session);
        assert_eq!(board_log.borrow().releases, 1);
    }

    #[test]
    fn test_faulted_session_refuses_work() {
        let board = DummyBoard::new()
            .with_failing_mode(BitMode::SyncFifo, TransportError::Stall);
        let mut session = open(board);

        let err = session.set_streaming_mode().unwrap_err();
        assert!(matches!(err, Error::ModeSwitch(TransportError::Stall)));
        assert_eq!(err.phase(), Phase::Usb);
        assert_eq!(session.state(), SessionState::Faulted);

        assert!(matches!(
            session.provision_if_needed(),
            Err(Error::InvalidState {
                state: SessionState::Faulted,
                ..
            })
        ));
    }

    #[test]
    fn test_provision_up_to_date() {
        let board = DummyBoard::new().with_eeprom(golden());
        let board_log = board.board_log();
        let mut session = open(board);

        assert_eq!(
            session.provision_if_needed().unwrap(),
            ProvisionOutcome::UpToDate
        );
        assert_eq!(board_log.borrow().eeprom_writes, 0);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_provision_blank_eeprom() {
        let mut session = open(DummyBoard::new());

        let outcome = session.provision_if_needed().unwrap();
        assert!(matches!(outcome, ProvisionOutcome::Reprogrammed(n) if n > 0));
        assert_eq!(session.transport().unwrap().eeprom(), &golden());
    }

    #[test]
    fn test_provision_only_rewrites_stale_words() {
        let mut words = golden();
        words[0x02] = 0x6010;
        words[0x7F] ^= 0x1234;
        let board = DummyBoard::new().with_eeprom(words);
        let board_log = board.board_log();
        let mut session = open(board);

        assert_eq!(
            session.provision_if_needed().unwrap(),
            ProvisionOutcome::Reprogrammed(2)
        );
        assert_eq!(board_log.borrow().eeprom_writes, 2);
    }

    #[test]
    fn test_provision_verify_failure() {
        let board = DummyBoard::new().with_stuck_eeprom_word(0x01);
        let mut session = open(board);

        let err = session.provision_if_needed().unwrap_err();
        assert!(matches!(
            err,
            Error::Provisioning(ProvisionError::VerifyMismatch { addr: 0x01, .. })
        ));
        assert_eq!(err.phase(), Phase::Eeprom);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_load_bitstream() {
        let bitstream = Bitstream::parse(vec![0xAA, 0x99, 0x55, 0x66, 0x01, 0x80]).unwrap();
        let board = DummyBoard::new();
        let board_log = board.board_log();
        let mut session = open(board);

        let mut reported = Vec::new();
        session
            .load_bitstream(&bitstream, |done, total| reported.push((done, total)))
            .unwrap();

        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(reported, vec![(6, 6)]);
        let log = board_log.borrow();
        assert_eq!(log.fpga_data, bitstream.data);
        let control = ControlPins::from_bits_truncate(log.control.unwrap());
        assert!(control.contains(ControlPins::PROG_B | ControlPins::CSI_B));
        assert_eq!(log.bitmodes[0], (Channel::B, BitMode::Bitbang, 0xC8));
        assert_eq!(log.bitmodes[1], (Channel::A, BitMode::Bitbang, 0xFF));
    }

    #[test]
    fn test_load_reports_each_chunk() {
        let bitstream = Bitstream::parse(vec![0x5A; 10_000]).unwrap();
        let mut session = open(DummyBoard::new());

        let mut reported = Vec::new();
        session
            .load_bitstream(&bitstream, |done, _| reported.push(done))
            .unwrap();
        assert_eq!(reported, vec![4096, 8192, 10_000]);
    }

    #[test]
    fn test_load_crc_error() {
        let bitstream = Bitstream::parse(vec![0xFF; 16]).unwrap();
        let mut session = open(DummyBoard::new().with_fpga(FpgaBehavior::CrcError));

        let err = session.load_bitstream(&bitstream, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(LoadError::CrcError)));
        assert_eq!(err.phase(), Phase::Fpga);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_load_init_timeout() {
        let bitstream = Bitstream::parse(vec![0xFF; 16]).unwrap();
        let mut session = open(DummyBoard::new().with_fpga(FpgaBehavior::NoInit));

        let err = session.load_bitstream(&bitstream, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(LoadError::InitTimeout)));
    }

    #[test]
    fn test_load_done_timeout() {
        let bitstream = Bitstream::parse(vec![0xFF; 16]).unwrap();
        let mut session = open(DummyBoard::new().with_fpga(FpgaBehavior::NoDone));

        let err = session.load_bitstream(&bitstream, |_, _| {}).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(LoadError::DoneTimeout)));
    }

    #[test]
    fn test_load_missing_file() {
        let mut session = open(DummyBoard::new());
        let err = session
            .load_configuration(std::path::Path::new("/nonexistent/twlfpga.bit"), |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(LoadError::Read { .. })));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    /// Records every sector callback
    #[derive(Default)]
    struct Steps(Vec<(u32, usize, usize, SectorStep)>);

    impl NorProgress for Steps {
        fn sector(&mut self, addr: u32, index: usize, count: usize, step: SectorStep) {
            self.0.push((addr, index, count, step));
        }
    }

    fn nor_session(chip: NorChip) -> Session<DummyBoard> {
        let mut session = open(DummyBoard::new().with_nor(chip));
        session.set_streaming_mode().unwrap();
        session
    }

    fn nor_chip(session: &Session<DummyBoard>) -> &NorChip {
        session.transport().unwrap().nor()
    }

    #[test]
    fn test_nor_requires_streaming_mode() {
        let mut session = open(DummyBoard::new());
        let err = session.with_nor(|nor| nor.ping()).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: SessionState::Open,
                op: Operation::NorAccess
            }
        ));
    }

    #[test]
    fn test_nor_bus_control() {
        let mut session = nor_session(NorChip::new().with_vcc_after(2));

        let mut polls = 0;
        let (driving, tristated) = session
            .with_nor(|nor| {
                nor.ping()?;
                nor.set_drive(false)?;
                nor.set_reset(false)?;
                nor.set_tristate(true)?;
                nor.wait_for_vcc(|| polls += 1)?;
                nor.take_bus()?;
                Ok((nor.driving()?, nor.tristated()?))
            })
            .unwrap();

        assert!(driving && tristated);
        assert_eq!(polls, 2);
        assert_eq!(session.state(), SessionState::StreamingMode);
        let board = session.transport().unwrap();
        assert_eq!(board.pending_reads(Channel::A), 0);
        assert!(board.nor().commands.contains(&nor_cmd::Command::Reset(true)));
    }

    #[test]
    fn test_nor_release_bus() {
        let mut session = nor_session(NorChip::new());
        session
            .with_nor(|nor| {
                nor.set_drive(true)?;
                nor.set_tristate(true)?;
                nor.release_bus()
            })
            .unwrap();
        let status = nor_chip(&session).status();
        assert!(!status.contains(nor_cmd::NorStatus::DRIVE));
        assert!(status.contains(nor_cmd::NorStatus::TRIST_N));
    }

    #[test]
    fn test_nor_read_words() {
        let data: Vec<u8> = (0..64).collect();
        let mut session = nor_session(NorChip::new().with_contents(0x200, &data));

        let read = session.with_nor(|nor| nor.read_words(0x100, 32)).unwrap();
        assert_eq!(read, data);

        let read = session
            .with_nor(|nor| nor.read_range(0x100, 5, &mut NoProgress))
            .unwrap();
        assert_eq!(read, &data[..5]);
    }

    #[test]
    fn test_nor_read_out_of_range() {
        let mut session = nor_session(NorChip::new());
        let err = session
            .with_nor(|nor| nor.read_words(NOR_WORDS - 1, 2))
            .unwrap_err();
        assert!(matches!(err, Error::Nor(NorError::OutOfRange { .. })));
        assert_eq!(err.phase(), Phase::Nor);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_nor_ping_failure() {
        let mut session = nor_session(NorChip::new().with_ping_reply([0x42, 0x00]));
        let err = session.with_nor(|nor| nor.ping()).unwrap_err();
        assert!(matches!(
            err,
            Error::Nor(NorError::PingFailed {
                expected: 0xBD,
                found: 0x00
            })
        ));
    }

    #[test]
    fn test_nor_erase_sector() {
        let chip = NorChip::new()
            .with_contents(0x20000, &[0x00; 8])
            .with_contents(0x40000, &[0x00; 2]);
        let mut session = nor_session(chip);

        session.with_nor(|nor| nor.erase_sector(0x10000)).unwrap();
        let chip = nor_chip(&session);
        assert_eq!(chip.erased, vec![0x10000]);
        assert_eq!(chip.bytes(0x20000, 8), vec![0xFF; 8]);
        assert_eq!(chip.bytes(0x40000, 2), vec![0x00; 2]);

        let err = session.with_nor(|nor| nor.erase_sector(0x8000)).unwrap_err();
        assert!(matches!(err, Error::Nor(NorError::Unaligned { .. })));
    }

    #[test]
    fn test_nor_program_line() {
        let mut session = nor_session(NorChip::new());
        session
            .with_nor(|nor| nor.program_line(0x40, &[0x1234, 0x5678]))
            .unwrap();
        let chip = nor_chip(&session);
        assert_eq!(chip.bytes(0x80, 4), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(chip.lines_programmed, 1);

        let err = session
            .with_nor(|nor| nor.program_line(0x41, &[0]))
            .unwrap_err();
        assert!(matches!(err, Error::Nor(NorError::Unaligned { .. })));
    }

    #[test]
    fn test_nor_patch_preserves_sector() {
        let old: Vec<u8> = (0..=255).collect();
        let mut session = nor_session(NorChip::new().with_contents(0x20000, &old));

        let mut steps = Steps::default();
        let stats = session
            .with_nor(|nor| nor.write_range(0x20011, &[0xAA, 0xBB, 0xCC], &mut steps))
            .unwrap();

        assert_eq!(
            stats,
            WriteStats {
                sectors: 1,
                rewritten: 1
            }
        );
        assert_eq!(steps.0, vec![(0x20000, 0, 1, SectorStep::Patch)]);
        let mut expected = old.clone();
        expected[0x11..0x14].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        let chip = nor_chip(&session);
        assert_eq!(chip.bytes(0x20000, 256), expected);
        assert_eq!(chip.erased, vec![0x10000]);
    }

    #[test]
    fn test_nor_unchanged_range_not_rewritten() {
        let data = [0x10, 0x20, 0x30, 0x40];
        let mut session = nor_session(NorChip::new().with_contents(0x100, &data));

        let stats = session
            .with_nor(|nor| nor.write_range(0x100, &data, &mut NoProgress))
            .unwrap();
        assert_eq!(stats.rewritten, 0);
        assert!(nor_chip(&session).erased.is_empty());
    }

    #[test]
    fn test_nor_range_across_sectors() {
        let data = vec![0x5A; 0x20];
        let mut session = nor_session(NorChip::new());

        let mut steps = Steps::default();
        let stats = session
            .with_nor(|nor| nor.write_range(0x1FFF0, &data, &mut steps))
            .unwrap();

        assert_eq!(stats.sectors, 2);
        assert_eq!(
            steps.0,
            vec![
                (0x00000, 0, 2, SectorStep::Patch),
                (0x20000, 1, 2, SectorStep::Patch),
            ]
        );
        assert_eq!(nor_chip(&session).bytes(0x1FFF0, 0x20), data);
    }

    #[test]
    fn test_nor_full_sector_write() {
        let mut data: Vec<u8> = (0..SECTOR_BYTES).map(|i| (i % 251) as u8).collect();
        data[3 * LINE_BYTES..4 * LINE_BYTES].fill(0xFF);
        let mut session = nor_session(NorChip::new());

        let mut steps = Steps::default();
        session
            .with_nor(|nor| nor.write_range(0x40000, &data, &mut steps))
            .unwrap();

        assert_eq!(steps.0, vec![(0x40000, 0, 1, SectorStep::Write)]);
        let chip = nor_chip(&session);
        assert_eq!(chip.bytes(0x40000, data.len()), data);
        // The line of 0xFF bytes is skipped
        assert_eq!(chip.lines_programmed, SECTOR_BYTES as usize / LINE_BYTES - 1);
    }

    #[test]
    fn test_nor_program_pads_odd_length() {
        let mut session = nor_session(NorChip::new());

        let mut steps = Steps::default();
        let sectors = session
            .with_nor(|nor| nor.program(0x20000, &[0x01, 0x02, 0x03], &mut steps))
            .unwrap();

        assert_eq!(sectors, 1);
        assert_eq!(
            steps.0.iter().map(|s| s.3).collect::<Vec<_>>(),
            vec![SectorStep::Erase, SectorStep::Program, SectorStep::Verify]
        );
        assert_eq!(
            nor_chip(&session).bytes(0x20000, 4),
            vec![0x01, 0x02, 0x03, 0xFF]
        );
    }

    #[test]
    fn test_nor_verify_failure() {
        let mut session = nor_session(NorChip::new().with_stuck_word(0x10001));
        let err = session
            .with_nor(|nor| nor.program(0x20000, &[0x00; 8], &mut NoProgress))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Nor(NorError::VerifyFailed { addr: 0x20000 })
        ));
        assert_eq!(err.phase(), Phase::Nor);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[test]
    fn test_loader_sequence() {
        let board = DummyBoard::new();
        let board_log = board.board_log();
        let mut session = open(board);
        let bitstream = Bitstream::parse(vec![0xAA, 0x99, 0x55, 0x66]).unwrap();

        session.provision_if_needed().unwrap();
        session.load_bitstream(&bitstream, |_, _| {}).unwrap();
        session.set_streaming_mode().unwrap();
        assert_eq!(session.state(), SessionState::StreamingMode);
        session.close();

        let log = board_log.borrow();
        assert_eq!(
            log.bitmodes.last(),
            Some(&(Channel::A, BitMode::SyncFifo, 0xFF))
        );
        assert_eq!(log.releases, 1);
    }
}
