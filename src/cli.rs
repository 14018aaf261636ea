//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use twlfpga_core::nor::NOR_BYTES;

#[derive(Parser, Debug)]
#[command(name = "loadbit")]
#[command(author, version, about = "Load a bitstream into the twlfpga FPGA")]
#[command(long_about = "Load a bitstream into the twlfpga FPGA.\n\n\
    Checks the bridge EEPROM first and reprograms it if it does not hold the \
    twlfpga configuration. After loading, the FIFO channel is left in \
    synchronous FIFO mode.")]
pub struct LoadbitCli {
    /// Bitstream file (Xilinx .bit or raw .bin)
    #[arg(value_name = "BITFILE")]
    pub bitfile: PathBuf,
}

#[derive(Parser, Debug)]
#[command(name = "sniffer")]
#[command(author, version, about = "Print NOR address-bus captures as ranges")]
#[command(long_about = "Stream address samples captured by the twlfpga board \
    and print contiguous runs as START..END lines (or START+ for a single \
    sample). Runs until interrupted.\n\n\
    Set RUST_LOG=debug for USB parameters and throughput.")]
pub struct SnifferCli {}

#[derive(Parser, Debug)]
#[command(name = "noralizer")]
#[command(author, version, about = "Read and program the NOR flash through the twlfpga board")]
#[command(long_about = "Read and program the NOR flash through the twlfpga board.\n\n\
    Requires the NOR bridge bitstream to be loaded (see loadbit). The south \
    bridge is tristated, the tool waits for flash power, then takes the bus \
    and resets the flash before running the action. Without an action it \
    only brings the bus up. Addresses are byte addresses in hex.")]
pub struct NoralizerCli {
    #[command(subcommand)]
    pub action: Option<NorAction>,
}

/// What to do once the bus is ours
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum NorAction {
    /// Read the flash into FILE
    Dump {
        /// Output file
        file: PathBuf,

        /// Bytes to read
        #[arg(short, long, value_parser = parse_hex, default_value = "0x1000000")]
        length: u32,
    },

    /// Erase the sector at ADDR (aligned to 0x20000)
    Erase {
        /// Sector byte address
        #[arg(value_parser = parse_hex)]
        addr: u32,
    },

    /// Write FILE at ADDR, preserving the rest of each sector
    Write {
        /// Input file
        file: PathBuf,

        /// Start byte address
        #[arg(value_parser = parse_hex, default_value = "0")]
        addr: u32,
    },

    /// Write FILE at ADDR behind a region length header
    Writeimg {
        /// Input file
        file: PathBuf,

        /// Region byte address
        #[arg(value_parser = parse_hex)]
        addr: u32,
    },

    /// Erase, program and verify whole sectors from FILE
    Program {
        /// Input file
        file: PathBuf,

        /// Start byte address (aligned to 0x20000)
        #[arg(value_parser = parse_hex, default_value = "0")]
        addr: u32,
    },

    /// Give the bus back to the south bridge
    Release,
}

#[derive(Parser, Debug)]
#[command(name = "norinfo")]
#[command(author, version, about = "List the regions of a NOR flash image")]
pub struct NorinfoCli {
    /// Flash image, e.g. from noralizer dump
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
}

/// Parse a hex address, with or without `0x`
pub fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let value =
        u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex number '{}': {}", s, e))?;
    if value > NOR_BYTES {
        return Err(format!("0x{:x} is past the end of the flash", value));
    }
    Ok(value)
}
