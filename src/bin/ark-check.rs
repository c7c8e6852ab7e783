//! `ark-check`: thin CLI wrapper around the maintenance engine (spec §6).
//!
//! Dispatches straight to [`arkdata::cli::run_check`]; all the real logic
//! lives in the library so it stays testable without a subprocess.

use anyhow::Result;
use clap::Parser;

use arkdata::cli::{load_datasets, run_check, ArkCheckArgs};

fn main() -> Result<()> {
    env_logger::init();
    let args = ArkCheckArgs::parse();
    let datasets = load_datasets(&args.config)?;

    let (reports, code) = run_check(&args, &datasets)?;
    for report in &reports {
        for line in &report.lines {
            println!("{}", line);
        }
    }

    std::process::exit(code);
}
