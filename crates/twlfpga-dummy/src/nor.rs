//! Emulated NOR bridge bitstream and flash
//!
//! Parses the command bytes written to channel A and answers them the way
//! the FPGA does. The flash behind it understands the AMD unlock, sector
//! erase and write-buffer sequences; anything else on the bus is ignored.

use std::collections::{HashMap, VecDeque};

use twlfpga_core::nor::command::{Command, Decoded, NorStatus, PING_REPLY};
use twlfpga_core::nor::{NOR_WORDS, SECTOR_WORDS};

/// Where the flash is in a command sequence
#[derive(Debug, Clone, PartialEq, Eq)]
enum Cycle {
    Idle,
    Unlocked1,
    Unlocked2,
    EraseSetup,
    EraseUnlocked1,
    EraseUnlocked2,
    BufferCount(u32),
    BufferData {
        base: u32,
        remaining: usize,
        words: Vec<(u32, u16)>,
    },
    BufferConfirm {
        base: u32,
        words: Vec<(u32, u16)>,
    },
}

/// Emulated flash behind the bridge
#[derive(Debug, Clone)]
pub struct NorChip {
    words: HashMap<u32, u16>,
    address: u32,
    pending: Vec<u8>,
    output: VecDeque<u8>,
    cycle: Cycle,
    drive: bool,
    tristate: bool,
    reset: bool,
    vcc_after: usize,
    stuck_word: Option<u32>,
    ping_reply: [u8; 2],
    /// Word addresses of erased sectors, in order
    pub erased: Vec<u32>,
    /// Write-buffer lines programmed
    pub lines_programmed: usize,
    /// Every command seen, in order
    pub commands: Vec<Command>,
}

impl Default for NorChip {
    fn default() -> Self {
        Self::new()
    }
}

impl NorChip {
    /// Blank flash with supply present
    pub fn new() -> Self {
        Self {
            words: HashMap::new(),
            address: 0,
            pending: Vec::new(),
            output: VecDeque::new(),
            cycle: Cycle::Idle,
            drive: false,
            tristate: false,
            reset: false,
            vcc_after: 0,
            stuck_word: None,
            ping_reply: PING_REPLY,
            erased: Vec::new(),
            lines_programmed: 0,
            commands: Vec::new(),
        }
    }

    /// Preload big-endian `data` at byte address `byte_addr`
    pub fn with_contents(mut self, byte_addr: u32, data: &[u8]) -> Self {
        for (i, pair) in data.chunks(2).enumerate() {
            let word = u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0xFF)]);
            self.store(byte_addr / 2 + i as u32, word);
        }
        self
    }

    /// Report VCC only after `polls` status reads
    pub fn with_vcc_after(mut self, polls: usize) -> Self {
        self.vcc_after = polls;
        self
    }

    /// Make programming one word have no effect
    pub fn with_stuck_word(mut self, addr: u32) -> Self {
        self.stuck_word = Some(addr);
        self
    }

    /// Answer pings with `reply`
    pub fn with_ping_reply(mut self, reply: [u8; 2]) -> Self {
        self.ping_reply = reply;
        self
    }

    /// Word at `addr`
    pub fn word(&self, addr: u32) -> u16 {
        self.words.get(&addr).copied().unwrap_or(0xFFFF)
    }

    /// `len` bytes from byte address `byte_addr`, big-endian
    pub fn bytes(&self, byte_addr: u32, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len + 1);
        for i in 0..len.div_ceil(2) {
            out.extend_from_slice(&self.word(byte_addr / 2 + i as u32).to_be_bytes());
        }
        out.truncate(len);
        out
    }

    /// Current bus status
    pub fn status(&self) -> NorStatus {
        let mut status = NorStatus::READY | NorStatus::CE_N | NorStatus::WE_N | NorStatus::OE_N;
        status.set(NorStatus::DRIVE, self.drive);
        status.set(NorStatus::VCC, self.vcc_after == 0);
        status.set(NorStatus::TRIST_N, !self.tristate);
        status.set(NorStatus::RESET_N, !self.reset);
        status
    }

    /// Whether answer bytes are waiting
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Take up to `max` answer bytes
    pub fn take_output(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.output.len());
        self.output.drain(..n).collect()
    }

    fn store(&mut self, addr: u32, word: u16) {
        if word == 0xFFFF {
            self.words.remove(&addr);
        } else {
            self.words.insert(addr, word);
        }
    }

    /// Feed command bytes written to the FIFO
    pub fn receive(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        let mut pos = 0;
        while pos < self.pending.len() {
            match Command::decode(&self.pending[pos..]) {
                Decoded::Command(cmd, len) => {
                    self.execute(cmd);
                    pos += len;
                }
                Decoded::Incomplete => break,
                Decoded::Unknown(op) => {
                    log::warn!("Dummy NOR bridge ignoring opcode 0x{:02X}", op);
                    pos += 1;
                }
            }
        }
        self.pending.drain(..pos);
    }

    fn execute(&mut self, cmd: Command) {
        self.commands.push(cmd);
        match cmd {
            Command::Delay(_) | Command::Wait { .. } => {}
            Command::State => {
                let status = self.status();
                self.vcc_after = self.vcc_after.saturating_sub(1);
                self.output.push_back(status.bits());
            }
            Command::Ping => self.output.extend(self.ping_reply),
            Command::Drive(on) => self.drive = on,
            Command::Tristate(on) => self.tristate = on,
            Command::Reset(on) => {
                self.reset = on;
                if on {
                    self.cycle = Cycle::Idle;
                }
            }
            Command::Address(addr) => self.address = addr,
            Command::Read { increment } => {
                let word = self.word(self.address);
                self.output.extend(word.to_be_bytes());
                self.advance(increment);
            }
            Command::Write { word, increment } => {
                self.bus_write(self.address, word);
                self.advance(increment);
            }
        }
    }

    fn advance(&mut self, increment: bool) {
        if increment {
            self.address = (self.address + 1) % NOR_WORDS;
        }
    }

    fn bus_write(&mut self, addr: u32, data: u16) {
        let cycle = std::mem::replace(&mut self.cycle, Cycle::Idle);
        self.cycle = match (cycle, addr, data) {
            (Cycle::Idle, 0x555, 0xAA) => Cycle::Unlocked1,
            (Cycle::Unlocked1, 0x2AA, 0x55) => Cycle::Unlocked2,
            (Cycle::Unlocked2, 0x555, 0x80) => Cycle::EraseSetup,
            (Cycle::Unlocked2, base, 0x25) => Cycle::BufferCount(base),
            (Cycle::EraseSetup, 0x555, 0xAA) => Cycle::EraseUnlocked1,
            (Cycle::EraseUnlocked1, 0x2AA, 0x55) => Cycle::EraseUnlocked2,
            (Cycle::EraseUnlocked2, sector, 0x30) => {
                let start = sector & !(SECTOR_WORDS - 1);
                self.words.retain(|&a, _| a < start || a >= start + SECTOR_WORDS);
                self.erased.push(start);
                Cycle::Idle
            }
            (Cycle::BufferCount(base), _, count) => Cycle::BufferData {
                base,
                remaining: count as usize + 1,
                words: Vec::new(),
            },
            (
                Cycle::BufferData {
                    base,
                    remaining,
                    mut words,
                },
                addr,
                word,
            ) => {
                words.push((addr, word));
                if remaining > 1 {
                    Cycle::BufferData {
                        base,
                        remaining: remaining - 1,
                        words,
                    }
                } else {
                    Cycle::BufferConfirm { base, words }
                }
            }
            (Cycle::BufferConfirm { base, words }, addr, 0x29) if addr == base => {
                for (addr, word) in words {
                    if self.stuck_word != Some(addr) {
                        // Programming only clears bits
                        self.store(addr, self.word(addr) & word);
                    }
                }
                self.lines_programmed += 1;
                Cycle::Idle
            }
            (cycle, addr, data) => {
                if cycle != Cycle::Idle {
                    log::debug!(
                        "Dummy NOR aborting {:?} on write 0x{:04X} at 0x{:06X}",
                        cycle,
                        data,
                        addr
                    );
                }
                Cycle::Idle
            }
        };
    }
}
