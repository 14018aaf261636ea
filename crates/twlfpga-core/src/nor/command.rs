//! NOR bridge command set
//!
//! With the NOR bitstream loaded, every byte written to channel A is part of
//! a command for the FPGA, which drives the flash bus and answers over the
//! same FIFO.
//!
//! ```text
//! 0x00             delay 1 clock           0x40|n       delay n+2 clocks
//! 0x01             -> status byte          0x02, 0x03   -> 0x42, 0xBD
//! 0x04|v           drive bus               0x06|v       tristate south bridge
//! 0x08|v           assert reset            0x0E|i       wait for READY
//! 0x12|i           -> one word (BE)        0x18|i hi lo write one word
//! 0x80|a2 a1 a0    set 23-bit word address
//! ```
//!
//! `i` auto-increments the address after the access. Delays count 60 MHz
//! FPGA clocks.

use bitflags::bitflags;

/// Single clock delay
pub const CMD_DELAY_ONE: u8 = 0x00;
/// Read the status byte
pub const CMD_STATE: u8 = 0x01;
/// Liveness check, answered with [`PING_REPLY`]
pub const CMD_PING: [u8; 2] = [0x02, 0x03];
/// Drive the flash bus (low bit: enable)
pub const CMD_DRIVE: u8 = 0x04;
/// Tristate the south bridge side (low bit: enable)
pub const CMD_TRISTATE: u8 = 0x06;
/// Hold the flash in reset (low bit: assert)
pub const CMD_RESET: u8 = 0x08;
/// Stall the command stream until the flash reports READY
pub const CMD_WAIT: u8 = 0x0E;
/// Read one word
pub const CMD_READ: u8 = 0x12;
/// Write one word, two data bytes follow
pub const CMD_WRITE: u8 = 0x18;
/// Delay of 2 to 65 clocks, length in the low 6 bits
pub const CMD_DELAY: u8 = 0x40;
/// Set the address, high 7 bits in the opcode, two more bytes follow
pub const CMD_ADDRESS: u8 = 0x80;

/// Answer to [`CMD_PING`]
pub const PING_REPLY: [u8; 2] = [0x42, 0xBD];

/// Longest delay a single command can encode
pub const MAX_DELAY: u32 = 0x41;

/// Highest word address the bridge can drive
pub const MAX_WORD_ADDRESS: u32 = 0x7F_FFFF;

/// FPGA clocks per microsecond
pub const CLOCKS_PER_US: u32 = 60;

bitflags! {
    /// Status byte returned by [`CMD_STATE`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NorStatus: u8 {
        /// The FPGA drives the flash bus
        const DRIVE   = 0x80;
        /// Flash supply is up
        const VCC     = 0x40;
        /// South bridge not tristated
        const TRIST_N = 0x20;
        /// Flash not in reset
        const RESET_N = 0x10;
        /// Flash RY/BY# line
        const READY   = 0x08;
        /// Chip enable, active low
        const CE_N    = 0x04;
        /// Write enable, active low
        const WE_N    = 0x02;
        /// Output enable, active low
        const OE_N    = 0x01;
    }
}

/// One bridge command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Wait 1 to [`MAX_DELAY`] clocks
    Delay(u8),
    /// Report [`NorStatus`]
    State,
    /// Echo [`PING_REPLY`]
    Ping,
    /// Enable or disable bus drivers
    Drive(bool),
    /// Tristate or release the south bridge
    Tristate(bool),
    /// Assert or release flash reset
    Reset(bool),
    /// Set the word address
    Address(u32),
    /// Wait for READY
    Wait {
        /// Advance the address afterwards
        increment: bool,
    },
    /// Read the word at the current address
    Read {
        /// Advance the address afterwards
        increment: bool,
    },
    /// Write a word at the current address
    Write {
        /// Data word
        word: u16,
        /// Advance the address afterwards
        increment: bool,
    },
}

/// Result of decoding the head of a command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A command and the number of bytes it used
    Command(Command, usize),
    /// More bytes are needed
    Incomplete,
    /// The first byte is not a known opcode
    Unknown(u8),
}

impl Command {
    /// Append the wire encoding to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Command::Delay(1) => out.push(CMD_DELAY_ONE),
            Command::Delay(clocks) => {
                out.push(CMD_DELAY | (clocks.clamp(2, MAX_DELAY as u8) - 2))
            }
            Command::State => out.push(CMD_STATE),
            Command::Ping => out.extend_from_slice(&CMD_PING),
            Command::Drive(on) => out.push(CMD_DRIVE | on as u8),
            Command::Tristate(on) => out.push(CMD_TRISTATE | on as u8),
            Command::Reset(on) => out.push(CMD_RESET | on as u8),
            Command::Address(addr) => {
                let [_, hi, mid, lo] = (addr & MAX_WORD_ADDRESS).to_be_bytes();
                out.extend_from_slice(&[CMD_ADDRESS | hi, mid, lo]);
            }
            Command::Wait { increment } => out.push(CMD_WAIT | increment as u8),
            Command::Read { increment } => out.push(CMD_READ | increment as u8),
            Command::Write { word, increment } => {
                let [hi, lo] = word.to_be_bytes();
                out.extend_from_slice(&[CMD_WRITE | increment as u8, hi, lo]);
            }
        }
    }

    /// Bytes the FPGA sends back for this command
    pub fn response_len(&self) -> usize {
        match self {
            Command::State => 1,
            Command::Ping | Command::Read { .. } => 2,
            _ => 0,
        }
    }

    /// Decode the command at the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Decoded {
        let Some(&op) = bytes.first() else {
            return Decoded::Incomplete;
        };
        let need = |len: usize, cmd: fn(&[u8]) -> Command| {
            if bytes.len() < len {
                Decoded::Incomplete
            } else {
                Decoded::Command(cmd(bytes), len)
            }
        };
        let flag = op & 1 != 0;

        match op {
            CMD_DELAY_ONE => Decoded::Command(Command::Delay(1), 1),
            CMD_STATE => Decoded::Command(Command::State, 1),
            0x02 => match bytes.get(1) {
                None => Decoded::Incomplete,
                Some(&second) if second == CMD_PING[1] => Decoded::Command(Command::Ping, 2),
                Some(_) => Decoded::Unknown(op),
            },
            0x04 | 0x05 => Decoded::Command(Command::Drive(flag), 1),
            0x06 | 0x07 => Decoded::Command(Command::Tristate(flag), 1),
            0x08 | 0x09 => Decoded::Command(Command::Reset(flag), 1),
            0x0E | 0x0F => Decoded::Command(Command::Wait { increment: flag }, 1),
            0x12 | 0x13 => Decoded::Command(Command::Read { increment: flag }, 1),
            0x18 | 0x19 => need(3, |b| Command::Write {
                word: u16::from_be_bytes([b[1], b[2]]),
                increment: b[0] & 1 != 0,
            }),
            0x40..=0x7F => Decoded::Command(Command::Delay((op & 0x3F) + 2), 1),
            0x80..=0xFF => need(3, |b| {
                Command::Address(u32::from_be_bytes([0, b[0] & 0x7F, b[1], b[2]]))
            }),
            _ => Decoded::Unknown(op),
        }
    }
}

/// Split a delay of `clocks` into delay commands
pub fn delay_commands(clocks: u32) -> impl Iterator<Item = Command> {
    let full = clocks.saturating_sub(1) / MAX_DELAY;
    let rest = clocks - full * MAX_DELAY;
    std::iter::repeat(Command::Delay(MAX_DELAY as u8))
        .take(full as usize)
        .chain((rest > 0).then_some(Command::Delay(rest as u8)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(cmds: &[Command]) -> Vec<u8> {
        let mut out = Vec::new();
        for cmd in cmds {
            cmd.encode(&mut out);
        }
        out
    }

    #[test]
    fn test_encoding() {
        assert_eq!(encode(&[Command::Ping, Command::State]), [0x02, 0x03, 0x01]);
        assert_eq!(
            encode(&[Command::Drive(true), Command::Tristate(false), Command::Reset(true)]),
            [0x05, 0x06, 0x09]
        );
        assert_eq!(encode(&[Command::Address(0x12_3456)]), [0x92, 0x34, 0x56]);
        assert_eq!(
            encode(&[Command::Write {
                word: 0xAA55,
                increment: true
            }]),
            [0x19, 0xAA, 0x55]
        );
        assert_eq!(encode(&[Command::Read { increment: true }]), [0x13]);
        assert_eq!(encode(&[Command::Wait { increment: false }]), [0x0E]);
    }

    #[test]
    fn test_delay_split() {
        let bytes = |clocks| encode(&delay_commands(clocks).collect::<Vec<_>>());
        assert!(bytes(0).is_empty());
        assert_eq!(bytes(1), [0x00]);
        assert_eq!(bytes(2), [0x40]);
        assert_eq!(bytes(10), [0x48]);
        assert_eq!(bytes(0x41), [0x7F]);
        assert_eq!(bytes(0x42), [0x7F, 0x00]);
        // 40 us reset pulse
        assert_eq!(bytes(40 * CLOCKS_PER_US).len(), 37);
        assert_eq!(bytes(40 * CLOCKS_PER_US).last(), Some(&(0x40 | (60 - 2))));
    }

    #[test]
    fn test_decode_matches_encode() {
        let cmds = [
            Command::Delay(1),
            Command::Delay(33),
            Command::State,
            Command::Ping,
            Command::Drive(false),
            Command::Tristate(true),
            Command::Reset(false),
            Command::Address(MAX_WORD_ADDRESS),
            Command::Wait { increment: true },
            Command::Read { increment: false },
            Command::Write {
                word: 0x0123,
                increment: false,
            },
        ];
        let bytes = encode(&cmds);
        let mut pos = 0;
        for cmd in cmds {
            match Command::decode(&bytes[pos..]) {
                Decoded::Command(decoded, len) => {
                    assert_eq!(decoded, cmd);
                    pos += len;
                }
                other => panic!("{:?} at {}", other, pos),
            }
        }
        assert_eq!(pos, bytes.len());
    }

    #[test]
    fn test_decode_partial_and_unknown() {
        assert_eq!(Command::decode(&[]), Decoded::Incomplete);
        assert_eq!(Command::decode(&[0x19, 0xAA]), Decoded::Incomplete);
        assert_eq!(Command::decode(&[0x85, 0x00]), Decoded::Incomplete);
        assert_eq!(Command::decode(&[0x02]), Decoded::Incomplete);
        assert_eq!(Command::decode(&[0x30]), Decoded::Unknown(0x30));
        assert_eq!(Command::decode(&[0x02, 0x01]), Decoded::Unknown(0x02));
    }

    #[test]
    fn test_response_len() {
        assert_eq!(Command::Ping.response_len(), 2);
        assert_eq!(Command::State.response_len(), 1);
        assert_eq!(Command::Read { increment: true }.response_len(), 2);
        assert_eq!(Command::Delay(5).response_len(), 0);
    }
}
