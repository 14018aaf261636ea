//! twlfpga - Bitstream loader, NOR address-bus sniffer and NOR flasher
//!
//! Command-line front end shared by the `loadbit`, `sniffer`, `noralizer`
//! and `norinfo` binaries.
//! The hardware logic lives in `twlfpga-core`; the USB transport in
//! `twlfpga-ftdi`.

pub mod cli;
pub mod commands;
