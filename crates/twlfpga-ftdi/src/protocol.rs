//! FT2232H SIO request constants and board wiring
//!
//! Request numbers follow the FTDI vendor protocol as implemented by libftdi.

use std::time::Duration;

// ============================================================================
// USB identity
// ============================================================================

/// VID programmed into the board EEPROM
pub const TWLFPGA_VID: u16 = 0xE461;

/// PID programmed into the board EEPROM
pub const TWLFPGA_PID: u16 = 0x0014;

/// FTDI vendor ID
pub const FTDI_VID: u16 = 0x0403;

/// FT2232H product ID, seen on a board with a blank EEPROM
pub const FTDI_FT2232H_PID: u16 = 0x6010;

/// Identities accepted by `open`, in order of preference
pub const SUPPORTED_IDS: [(u16, u16); 2] = [(TWLFPGA_VID, TWLFPGA_PID), (FTDI_VID, FTDI_FT2232H_PID)];

// ============================================================================
// Interfaces and endpoints
// ============================================================================

/// Interface of channel A
pub const INTERFACE_A: u8 = 0;

/// Interface of channel B
pub const INTERFACE_B: u8 = 1;

/// Bulk IN endpoint of channel A
pub const EP_IN_A: u8 = 0x81;

/// Bulk OUT endpoint of channel A
pub const EP_OUT_A: u8 = 0x02;

/// Bulk IN endpoint of channel B
pub const EP_IN_B: u8 = 0x83;

/// Bulk OUT endpoint of channel B
pub const EP_OUT_B: u8 = 0x04;

// ============================================================================
// SIO vendor requests
// ============================================================================

/// Reset / purge request
pub const SIO_RESET: u8 = 0x00;

/// Set latency timer (ms)
pub const SIO_SET_LATENCY_TIMER: u8 = 0x09;

/// Set bit mode: wValue = mode << 8 | output mask
pub const SIO_SET_BITMODE: u8 = 0x0B;

/// Read the instantaneous pin state
pub const SIO_READ_PINS: u8 = 0x0C;

/// Read one EEPROM word: wIndex = word address
pub const SIO_READ_EEPROM: u8 = 0x90;

/// Write one EEPROM word: wValue = data, wIndex = word address
pub const SIO_WRITE_EEPROM: u8 = 0x91;

/// wValue of SIO_RESET: reset the channel
pub const SIO_RESET_SIO: u16 = 0;

/// wValue of SIO_RESET: purge the IN buffer
pub const SIO_RESET_PURGE_RX: u16 = 1;

/// Latency timer used on both channels
pub const LATENCY_TIMER_MS: u16 = 2;

// ============================================================================
// Timeouts
// ============================================================================

/// Control request timeout
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Blocking bulk write timeout
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_identity_preferred() {
        assert_eq!(SUPPORTED_IDS[0], (0xE461, 0x0014));
        assert_eq!(SUPPORTED_IDS[1], (0x0403, 0x6010));
    }

    #[test]
    fn test_endpoint_directions() {
        for ep in [EP_IN_A, EP_IN_B] {
            assert_eq!(ep & 0x80, 0x80);
        }
        for ep in [EP_OUT_A, EP_OUT_B] {
            assert_eq!(ep & 0x80, 0);
        }
    }
}
