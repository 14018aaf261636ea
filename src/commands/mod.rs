//! CLI command implementations
//!
//! The commands are generic over the transport so they can be run against
//! the in-memory board in tests.

pub mod load;
pub mod nor;
pub mod sniff;

use std::fmt;
use std::io;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use twlfpga_core::nor::toc::TocError;
use twlfpga_core::Phase;

/// Failure of a command
#[derive(Debug, Error)]
pub enum CommandError {
    /// Hardware or session failure
    #[error(transparent)]
    Session(#[from] twlfpga_core::Error),

    /// Writing decoded output failed
    #[error("Error writing output: {0}")]
    Output(#[from] io::Error),

    /// An input file could not be read
    #[error("Error reading {}: {source}", .path.display())]
    Input {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// A flash image has a malformed directory
    #[error("Error parsing image directory: {0}")]
    Toc(#[from] TocError),
}

impl CommandError {
    /// Label printed in front of the diagnostic
    pub fn label(&self) -> String {
        match self {
            CommandError::Session(e) => e.phase().to_string(),
            CommandError::Output(_) => "OUTPUT".to_string(),
            CommandError::Input { .. } | CommandError::Toc(_) => Phase::Nor.to_string(),
        }
    }
}

/// Result type for commands
pub type Result<T> = std::result::Result<T, CommandError>;

/// Initialize logging to stderr, `info` unless `RUST_LOG` says otherwise
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Phase-labelled status line, e.g. `USB: Set SYNC FIFO mode`
pub fn status_line(label: impl fmt::Display, message: impl fmt::Display) -> String {
    format!("{}: {}", label, message)
}

/// Single-line diagnostic for `err`
pub fn diagnostic(err: &CommandError) -> String {
    status_line(err.label(), err)
}

/// Parse the command line
///
/// Usage errors exit with status 1, `--help` and `--version` with 0.
pub fn parse_args<P: Parser>() -> P {
    match P::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            // Nothing sensible to do if printing the usage fails
            let _ = e.print();
            std::process::exit(code);
        }
    }
}
