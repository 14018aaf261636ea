//! noralizer and norinfo: NOR flash access through the bridge bitstream

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use twlfpga_core::nor::toc::{self, image_header};
use twlfpga_core::nor::{self, NorFlasher, NorProgress, SectorStep, SECTOR_BYTES};
use twlfpga_core::transport::TransportResult;
use twlfpga_core::{Session, Transport};

use super::{CommandError, Result};
use crate::cli::NorAction;

/// Pause between supply checks
const VCC_POLL: Duration = Duration::from_millis(10);

/// Action with its input loaded and addresses checked
#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    BringUp,
    Dump { file: PathBuf, length: u32 },
    Erase { addr: u32 },
    Write { addr: u32, data: Vec<u8> },
    Program { addr: u32, data: Vec<u8> },
    Release,
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| CommandError::Input {
        path: path.to_path_buf(),
        source,
    })
}

impl Job {
    /// Load input files and reject bad addresses before touching the board
    fn prepare(action: Option<&NorAction>) -> Result<Self> {
        let job = match action {
            None => Job::BringUp,
            Some(NorAction::Dump { file, length }) => Job::Dump {
                file: file.clone(),
                length: *length,
            },
            Some(NorAction::Erase { addr }) => {
                nor::sector_word_address(*addr).map_err(twlfpga_core::Error::from)?;
                Job::Erase { addr: *addr }
            }
            Some(NorAction::Write { file, addr }) => Job::Write {
                addr: *addr,
                data: read_input(file)?,
            },
            Some(NorAction::Writeimg { file, addr }) => {
                let data = read_input(file)?;
                let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                let mut image = image_header(len).to_vec();
                image.extend_from_slice(&data);
                Job::Write {
                    addr: *addr,
                    data: image,
                }
            }
            Some(NorAction::Program { file, addr }) => {
                nor::sector_word_address(*addr).map_err(twlfpga_core::Error::from)?;
                Job::Program {
                    addr: *addr,
                    data: read_input(file)?,
                }
            }
            Some(NorAction::Release) => Job::Release,
        };
        Ok(job)
    }

    /// Run on a flash whose bus is already taken
    ///
    /// Returns the data read by a dump.
    fn execute<T: Transport + ?Sized>(
        &self,
        nor: &mut NorFlasher<'_, T>,
    ) -> nor::Result<Option<Vec<u8>>> {
        match self {
            Job::BringUp => {}
            Job::Dump { length, .. } => {
                println!("Dumping NOR...");
                let mut bar = NorBar::bytes(*length);
                let data = nor.read_range(0, *length, &mut bar);
                bar.done(data.is_ok());
                return data.map(Some);
            }
            Job::Erase { addr } => {
                println!("Erasing sector {:06x}...", addr);
                nor.erase_sector(nor::sector_word_address(*addr)?)?;
            }
            Job::Write { addr, data } => {
                let mut bar = NorBar::sectors();
                let stats = nor.write_range(*addr, data, &mut bar);
                bar.done(stats.is_ok());
                let stats = stats?;
                println!("Rewrote {} of {} sectors", stats.rewritten, stats.sectors);
            }
            Job::Program { addr, data } => {
                let left = data.len() % SECTOR_BYTES as usize;
                if left != 0 {
                    println!(
                        "NOTE: padding file with 0x{:x} FF bytes to complete the sector",
                        SECTOR_BYTES as usize - left
                    );
                }
                let mut bar = NorBar::sectors();
                let programmed = nor.program(*addr, data, &mut bar);
                bar.done(programmed.is_ok());
                programmed?;
            }
            Job::Release => {
                nor.release_bus()?;
                println!("NOR Released");
                return Ok(None);
            }
        }
        if !matches!(self, Job::BringUp) {
            println!("Done.");
        }
        Ok(None)
    }
}

/// Progress bar fed by the flasher's callbacks
struct NorBar {
    pb: ProgressBar,
}

impl NorBar {
    fn styled(pb: ProgressBar, template: &str) -> Self {
        match ProgressStyle::default_bar().template(template) {
            Ok(style) => pb.set_style(style.progress_chars("#>-")),
            Err(e) => log::debug!("Progress template rejected: {}", e),
        }
        Self { pb }
    }

    fn bytes(total: u32) -> Self {
        Self::styled(
            ProgressBar::new(u64::from(total)),
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
    }

    fn sectors() -> Self {
        Self::styled(
            ProgressBar::new(0),
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
    }

    fn done(self, ok: bool) {
        if ok {
            self.pb.finish();
        } else {
            self.pb.abandon();
        }
    }
}

impl NorProgress for NorBar {
    fn sector(&mut self, addr: u32, index: usize, count: usize, step: SectorStep) {
        self.pb.set_length(count as u64);
        // Patch and Write report a finished sector, the others a starting one
        let finished = matches!(step, SectorStep::Write | SectorStep::Patch);
        self.pb.set_position((index + finished as usize) as u64);
        self.pb.set_message(format!("Sector {:06x} {}", addr, step));
    }

    fn read_progress(&mut self, done: usize, _total: usize) {
        self.pb.set_position(done as u64);
    }
}

/// Tristate the south bridge, wait for supply, then take and reset the bus
fn bring_up<T: Transport + ?Sized>(nor: &mut NorFlasher<'_, T>) -> nor::Result<()> {
    println!("Pinging...");
    nor.ping()?;

    nor.set_drive(false)?;
    nor.set_reset(false)?;
    println!("Set SB to tristate");
    nor.set_tristate(true)?;

    if !nor.vcc()? {
        println!("Waiting for VCC...");
        nor.wait_for_vcc(|| thread::sleep(VCC_POLL))?;
        println!("VCC up!");
    }
    println!("State: {:02x}", nor.state()?.bits());

    println!("Resetting NOR...");
    nor.take_bus()?;
    println!("Ready.");
    Ok(())
}

/// Run noralizer on the board returned by `connect`
///
/// The board must already run the NOR bridge bitstream. Input files are
/// read before the device is opened. The device is released before this
/// returns, on success and on failure.
pub fn run<T, F>(connect: F, action: Option<&NorAction>) -> Result<()>
where
    T: Transport,
    F: FnOnce() -> TransportResult<T>,
{
    let job = Job::prepare(action)?;

    let mut session = Session::new();
    session.open(connect)?;
    session.set_streaming_mode()?;

    let dumped = session.with_nor(|nor| {
        bring_up(nor)?;
        let dumped = job.execute(nor)?;
        nor.ping()?;
        Ok(dumped)
    })?;
    session.close();

    if let (Job::Dump { file, .. }, Some(data)) = (&job, dumped) {
        fs::write(file, data)?;
        log::info!("Wrote {}", file.display());
    }
    Ok(())
}

/// Print the region directory of the flash image at `path`
pub fn info<W: Write>(path: &Path, out: &mut W) -> Result<()> {
    let image = read_input(path)?;
    let toc = toc::parse_toc(&image)?;
    log::debug!(
        "Directory magic 0x{:08x}, {} entries, total length 0x{:x}",
        toc.magic,
        toc.entries.len(),
        toc.total_len
    );
    for entry in &toc.entries {
        writeln!(out, "{}", entry)?;
    }
    Ok(())
}
