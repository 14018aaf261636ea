//! loadbit - configure the twlfpga FPGA and enable streaming mode
//!
//! Usage: loadbit BITFILE

use std::process::ExitCode;

use twlfpga::cli::LoadbitCli;
use twlfpga::commands::{self, load};

fn main() -> ExitCode {
    let cli: LoadbitCli = commands::parse_args();
    commands::init_logging();

    match load::run(twlfpga_ftdi::connect, &cli.bitfile) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", commands::diagnostic(&e));
            ExitCode::FAILURE
        }
    }
}
