//! sniffer - print NOR address-bus captures as ranges
//!
//! Runs until Ctrl-C or SIGTERM. A second signal exits immediately.

use std::io;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use twlfpga::cli::SnifferCli;
use twlfpga::commands::{self, sniff};

fn main() -> ExitCode {
    let _cli: SnifferCli = commands::parse_args();
    commands::init_logging();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        log::info!("Stopping capture");
    }) {
        log::warn!("Cannot install signal handler: {}", e);
    }

    match sniff::run(twlfpga_ftdi::connect, io::stdout().lock(), &shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", commands::diagnostic(&e));
            ExitCode::FAILURE
        }
    }
}
