//! Man page generator for the twlfpga tools
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::CommandFactory;
use std::fs;
use std::path::{Path, PathBuf};

use twlfpga::cli::{LoadbitCli, NoralizerCli, NorinfoCli, SnifferCli};

fn render(cmd: clap::Command, dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("{}.1", cmd.get_name()));
    let mut buffer = Vec::new();
    clap_mangen::Man::new(cmd).render(&mut buffer)?;
    fs::write(&path, buffer)?;
    Ok(path)
}

fn main() -> std::io::Result<()> {
    // Default to ./man directory
    let output_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));

    fs::create_dir_all(&output_dir)?;

    for cmd in [
        LoadbitCli::command(),
        SnifferCli::command(),
        NoralizerCli::command(),
        NorinfoCli::command(),
    ] {
        let path = render(cmd, &output_dir)?;
        println!("Man page generated at: {}", path.display());
    }

    println!("\nTo view a man page:");
    println!("  man -l {}", output_dir.join("sniffer.1").display());

    Ok(())
}
