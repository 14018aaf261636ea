//! FT2232H configuration EEPROM provisioning
//!
//! The bridge only streams in synchronous FIFO mode if its EEPROM configures
//! channel A as a 245 FIFO. The board also gets its own VID/PID and strings.
//! [`check_and_program`] compares the EEPROM with the golden image and
//! rewrites the words that differ.
//!
//! Layout of the 93C56 (128 words) as used by FT2232H:
//!
//! ```text
//! 0x00  channel A type | driver      0x01  channel B type | driver
//! 0x02  vendor ID (LE)               0x04  product ID (LE)
//! 0x06  release (LE)                 0x08  config attributes
//! 0x09  max power / 2 mA             0x0A  chip options
//! 0x0E  manufacturer string ptr/len  0x10  product string ptr/len
//! 0x12  serial string ptr/len        0x18  EEPROM chip type
//! 0x9A  string descriptors           0xFE  checksum
//! ```

use thiserror::Error;

use crate::error::TransportError;
use crate::transport::Transport;

/// Size of the EEPROM in 16-bit words
pub const EEPROM_WORDS: usize = 128;

/// Size of the EEPROM in bytes
pub const EEPROM_BYTES: usize = EEPROM_WORDS * 2;

/// Byte offset where string descriptors start
const STRING_AREA_START: usize = 0x9A;

/// Byte offset of the checksum word
const CHECKSUM_OFFSET: usize = EEPROM_BYTES - 2;

/// Seed of the FTDI EEPROM checksum
const CHECKSUM_SEED: u16 = 0xAAAA;

/// Chip type byte for a 93C56
const CHIP_93C56: u8 = 0x56;

/// USB string descriptor type
const USB_DT_STRING: u8 = 0x03;

/// Configuration descriptor attribute: reserved bit, always set
const ATTR_RESERVED: u8 = 0x80;
/// Configuration descriptor attribute: self powered
const ATTR_SELF_POWERED: u8 = 0x40;

/// Chip option: report a serial number
const OPT_USE_SERIAL: u8 = 0x08;

/// Channel type byte for a 245 FIFO channel bound to the D2XX driver
const CHANNEL_FIFO245: u8 = 0x01;

/// Errors during EEPROM provisioning
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// EEPROM request failed on the bus
    #[error("EEPROM access failed: {0}")]
    Transport(#[from] TransportError),

    /// Read-back after programming did not match
    #[error("verify failed at word 0x{addr:02X}: wrote 0x{expected:04X}, read 0x{found:04X}")]
    VerifyMismatch {
        /// Word address
        addr: u8,
        /// Value written
        expected: u16,
        /// Value read back
        found: u16,
    },

    /// Descriptor strings do not fit in the string area
    #[error("descriptor strings need {needed} bytes, only {available} available")]
    StringsTooLong {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },
}

/// Decoded EEPROM contents the golden image is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EepromConfig {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// bcdDevice
    pub release: u16,
    /// Self powered instead of bus powered
    pub self_powered: bool,
    /// Maximum bus current in mA
    pub max_power_ma: u16,
    /// Manufacturer string
    pub manufacturer: String,
    /// Product string
    pub product: String,
    /// Serial number string
    pub serial: String,
}

impl EepromConfig {
    /// The configuration every twlfpga board must carry
    pub fn twlfpga() -> Self {
        Self {
            vendor_id: 0xE461,
            product_id: 0x0014,
            release: 0x0700,
            self_powered: false,
            max_power_ma: 500,
            manufacturer: "marcansoft".to_string(),
            product: "twlfpga".to_string(),
            serial: "TWL00001".to_string(),
        }
    }

    /// Encode the configuration into an EEPROM image
    pub fn build(&self) -> Result<EepromImage, ProvisionError> {
        let mut buf = [0u8; EEPROM_BYTES];

        // Both channels in 245 FIFO mode, required for synchronous FIFO
        buf[0x00] = CHANNEL_FIFO245;
        buf[0x01] = CHANNEL_FIFO245;
        buf[0x02..0x04].copy_from_slice(&self.vendor_id.to_le_bytes());
        buf[0x04..0x06].copy_from_slice(&self.product_id.to_le_bytes());
        buf[0x06..0x08].copy_from_slice(&self.release.to_le_bytes());
        buf[0x08] = ATTR_RESERVED;
        if self.self_powered {
            buf[0x08] |= ATTR_SELF_POWERED;
        }
        buf[0x09] = (self.max_power_ma / 2).min(0xFF) as u8;
        buf[0x0A] = OPT_USE_SERIAL;
        buf[0x18] = CHIP_93C56;

        let strings = [
            (0x0E, self.manufacturer.as_str()),
            (0x10, self.product.as_str()),
            (0x12, self.serial.as_str()),
        ];
        let needed: usize = strings.iter().map(|(_, s)| descriptor_len(s)).sum();
        let available = CHECKSUM_OFFSET - STRING_AREA_START;
        if needed > available {
            return Err(ProvisionError::StringsTooLong { needed, available });
        }

        let mut offset = STRING_AREA_START;
        for (ptr, s) in strings {
            let len = descriptor_len(s);
            buf[ptr] = offset as u8 | 0x80;
            buf[ptr + 1] = len as u8;
            buf[offset] = len as u8;
            buf[offset + 1] = USB_DT_STRING;
            for (i, unit) in s.encode_utf16().enumerate() {
                let at = offset + 2 + i * 2;
                buf[at..at + 2].copy_from_slice(&unit.to_le_bytes());
            }
            offset += len;
        }

        let mut words = [0u16; EEPROM_WORDS];
        for (word, bytes) in words.iter_mut().zip(buf.chunks_exact(2)) {
            *word = u16::from_le_bytes([bytes[0], bytes[1]]);
        }
        words[EEPROM_WORDS - 1] = checksum(&words[..EEPROM_WORDS - 1]);

        Ok(EepromImage(words))
    }
}

fn descriptor_len(s: &str) -> usize {
    2 + s.encode_utf16().count() * 2
}

/// FTDI EEPROM checksum over `words`
pub fn checksum(words: &[u16]) -> u16 {
    words.iter().fold(CHECKSUM_SEED, |sum, &word| (sum ^ word).rotate_left(1))
}

/// A full EEPROM image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromImage([u16; EEPROM_WORDS]);

impl EepromImage {
    /// Wrap raw words
    pub fn from_words(words: [u16; EEPROM_WORDS]) -> Self {
        Self(words)
    }

    /// Get the raw words
    pub fn words(&self) -> &[u16; EEPROM_WORDS] {
        &self.0
    }

    /// Whether the last word holds a valid checksum
    pub fn checksum_valid(&self) -> bool {
        checksum(&self.0[..EEPROM_WORDS - 1]) == self.0[EEPROM_WORDS - 1]
    }

    /// Vendor and product ID stored in the image
    pub fn usb_id(&self) -> (u16, u16) {
        (self.0[1], self.0[2])
    }

    /// Word addresses where `self` and `other` differ
    pub fn diff<'a>(&'a self, other: &'a EepromImage) -> impl Iterator<Item = u8> + 'a {
        self.0
            .iter()
            .zip(other.0.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(addr, _)| addr as u8)
    }
}

/// Result of [`check_and_program`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// EEPROM already matched the golden image
    UpToDate,
    /// Words were rewritten; holds how many
    Reprogrammed(usize),
}

/// Read the whole EEPROM
pub fn read_image<T: Transport + ?Sized>(transport: &mut T) -> Result<EepromImage, ProvisionError> {
    let mut words = [0u16; EEPROM_WORDS];
    for (addr, word) in words.iter_mut().enumerate() {
        *word = transport.read_eeprom(addr as u8)?;
    }
    Ok(EepromImage(words))
}

/// Bring the EEPROM in line with `golden`
///
/// Only differing words are written. Everything is read back afterwards.
pub fn check_and_program<T: Transport + ?Sized>(
    transport: &mut T,
    golden: &EepromImage,
) -> Result<ProvisionOutcome, ProvisionError> {
    let current = read_image(transport)?;
    let (vid, pid) = current.usb_id();
    log::debug!(
        "EEPROM identity {:04X}:{:04X}, checksum {}",
        vid,
        pid,
        if current.checksum_valid() { "ok" } else { "bad" }
    );

    let stale: Vec<u8> = golden.diff(&current).collect();
    if stale.is_empty() {
        log::info!("EEPROM up to date");
        return Ok(ProvisionOutcome::UpToDate);
    }

    log::info!("Programming {} EEPROM words", stale.len());
    for &addr in &stale {
        let word = golden.words()[addr as usize];
        log::trace!("EEPROM[0x{:02X}] <- 0x{:04X}", addr, word);
        transport.write_eeprom(addr, word)?;
    }

    let readback = read_image(transport)?;
    if let Some(addr) = golden.diff(&readback).next() {
        return Err(ProvisionError::VerifyMismatch {
            addr,
            expected: golden.words()[addr as usize],
            found: readback.words()[addr as usize],
        });
    }

    log::warn!("EEPROM reprogrammed; replug the board for the new configuration to apply");
    Ok(ProvisionOutcome::Reprogrammed(stale.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(image: &EepromImage) -> Vec<u8> {
        image.words().iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_golden_image_header() {
        let image = EepromConfig::twlfpga().build().unwrap();
        let bytes = bytes_of(&image);
        assert_eq!(bytes[0x00], 0x01);
        assert_eq!(bytes[0x01], 0x01);
        assert_eq!(image.usb_id(), (0xE461, 0x0014));
        assert_eq!(bytes[0x08], 0x80);
        assert_eq!(bytes[0x09], 250);
        assert_eq!(bytes[0x18], 0x56);
        assert!(image.checksum_valid());
    }

    #[test]
    fn test_golden_image_strings() {
        let image = EepromConfig::twlfpga().build().unwrap();
        let bytes = bytes_of(&image);

        let ptr = bytes[0x10] as usize;
        let len = bytes[0x11] as usize;
        assert_eq!(len, 2 + 7 * 2);
        assert_eq!(bytes[ptr], len as u8);
        assert_eq!(bytes[ptr + 1], 0x03);
        let units: Vec<u16> = bytes[ptr + 2..ptr + len]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "twlfpga");

        assert_eq!(bytes[0x0E], 0x9A);
    }

    #[test]
    fn test_checksum_detects_change() {
        let image = EepromConfig::twlfpga().build().unwrap();
        let mut words = *image.words();
        words[3] ^= 0x0100;
        assert!(!EepromImage::from_words(words).checksum_valid());
    }

    #[test]
    fn test_checksum_of_blank() {
        // Rotating 0xAAAA once per word alternates between 0x5555 and 0xAAAA
        assert_eq!(checksum(&[0u16; 1]), 0x5555);
        assert_eq!(checksum(&[0u16; 2]), 0xAAAA);
        assert_eq!(checksum(&[]), 0xAAAA);
    }

    #[test]
    fn test_strings_too_long() {
        let mut config = EepromConfig::twlfpga();
        config.product = "x".repeat(60);
        assert!(matches!(
            config.build(),
            Err(ProvisionError::StringsTooLong { .. })
        ));
    }

    #[test]
    fn test_diff() {
        let golden = EepromConfig::twlfpga().build().unwrap();
        let mut words = *golden.words();
        words[5] = 0;
        words[100] = 0xFFFF;
        let other = EepromImage::from_words(words);
        assert_eq!(golden.diff(&other).collect::<Vec<_>>(), vec![5, 100]);
        assert_eq!(golden.diff(&golden).count(), 0);
    }
}
