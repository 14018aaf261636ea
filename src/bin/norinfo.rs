//! norinfo - list the regions in a NOR flash image
//!
//! Usage: norinfo IMAGE

use std::io;
use std::process::ExitCode;

use twlfpga::cli::NorinfoCli;
use twlfpga::commands::{self, nor};

fn main() -> ExitCode {
    let cli: NorinfoCli = commands::parse_args();
    commands::init_logging();

    match nor::info(&cli.image, &mut io::stdout().lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", commands::diagnostic(&e));
            ExitCode::FAILURE
        }
    }
}
