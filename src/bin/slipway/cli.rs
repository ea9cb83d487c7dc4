//! CLI definitions using clap.

use clap::Parser;

/// Slipway - a phase-governed, modular build system
///
/// The buildspec names what to do and to what:
///
///   slipway update(exe{hello})
///   slipway configure(/out/proj/) 'perform(update(/out/proj/))'
///   slipway clean(./)
#[derive(Parser)]
#[command(name = "slipway")]
#[command(author, version, about)]
pub struct Cli {
    /// Number of simultaneously active jobs (defaults to the hardware
    /// concurrency)
    #[arg(short = 'j', long = "jobs")]
    pub jobs: Option<usize>,

    /// Keep going after errors where possible
    #[arg(short = 'k', long = "keep-going")]
    pub keep_going: bool,

    /// Run serially (same as -j 1)
    #[arg(short = 's', long = "serial-stop", conflicts_with = "jobs")]
    pub serial: bool,

    /// Diagnostics verbosity, 0-6
    #[arg(short = 'v', long = "verbose", default_value_t = 1)]
    pub verbose: u8,

    /// Print what would be done without doing it
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// The buildspec: meta-operations, operations, and targets
    #[arg(value_name = "buildspec", trailing_var_arg = true)]
    pub buildspec: Vec<String>,
}
