//! noralizer - read and program the NOR flash through the twlfpga board
//!
//! Usage: noralizer [dump FILE | erase ADDR | write FILE [ADDR] |
//! writeimg FILE ADDR | program FILE [ADDR] | release]

use std::process::ExitCode;

use twlfpga::cli::NoralizerCli;
use twlfpga::commands::{self, nor};

fn main() -> ExitCode {
    let cli: NoralizerCli = commands::parse_args();
    commands::init_logging();

    match nor::run(twlfpga_ftdi::connect, cli.action.as_ref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", commands::diagnostic(&e));
            ExitCode::FAILURE
        }
    }
}
