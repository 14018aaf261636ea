//! loadbit: provision, configure the FPGA, switch to streaming mode

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use twlfpga_core::eeprom::ProvisionOutcome;
use twlfpga_core::transport::TransportResult;
use twlfpga_core::{Phase, Session, Transport};

use super::{status_line, Result};

fn load_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) Loading")
    {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => log::debug!("Progress template rejected: {}", e),
    }
    pb
}

/// Run the whole loader sequence on the board returned by `connect`
///
/// The device is released before this returns, on success and on failure.
pub fn run<T, F>(connect: F, bitfile: &Path) -> Result<()>
where
    T: Transport,
    F: FnOnce() -> TransportResult<T>,
{
    let mut session = Session::new();
    session.open(connect)?;

    if let ProvisionOutcome::Reprogrammed(words) = session.provision_if_needed()? {
        log::info!("EEPROM: rewrote {} words", words);
    }

    log::info!("Loading {}", bitfile.display());
    let pb = load_progress_bar();
    let loaded = session.load_configuration(bitfile, |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    });
    match &loaded {
        Ok(()) => pb.finish_and_clear(),
        Err(_) => pb.abandon(),
    }
    loaded?;

    session.set_streaming_mode()?;
    eprintln!("{}", status_line(Phase::Usb, "Set SYNC FIFO mode"));
    session.close();
    Ok(())
}
