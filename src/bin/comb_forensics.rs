//! comb-forensics: pre-registered comb test for angular power spectra
//!
//! Every `run` validates its inputs against SHA-256 manifests, resolves Cl/Dl
//! units against the model, gates catastrophic mismatches, calibrates the comb
//! statistic by seeded Monte Carlo and appends one immutable record to the
//! ledger, whatever the verdict.
//!
//! ## Example Usage
//!
//! ```bash
//! # Hash a data release
//! comb-forensics manifest generate ./planck_pr3 --output planck_pr3.json
//!
//! # Check a release before using it
//! comb-forensics verify --manifest planck_pr3.json
//!
//! # Run a pre-registered test
//! comb-forensics run --config comb-2025-a.json --manifest planck_pr3.json
//!
//! # Quick run from flags
//! comb-forensics run --obs obs_tt.txt --model lcdm_tt.txt --period 42 --seed 7 --no-strict
//!
//! # Browse past runs
//! comb-forensics ledger list
//! ```
//!
//! Exit codes: 0 for any completed run (CONFIRMED, CANDIDATE or NULL), 1 for a
//! FAIL or a failed check, 2 for usage and I/O errors outside a run.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod forensics_cli;

use forensics_cli::{
    calibrate::CalibrateCmd, config::ConfigCmd, home::ledger_root, inspect::InspectCmd,
    ledger::LedgerCmd, manifest::ManifestCmd, output::format_error, run::RunCmd,
    verify::VerifyCmd,
};

#[derive(Parser)]
#[command(
    name = "comb-forensics",
    author,
    version,
    about = "Pre-registered, provenance-checked comb test for angular power spectra",
    long_about = "Validates data provenance, resolves units, gates catastrophic mismatches and \n\
                  calibrates a comb statistic by seeded Monte Carlo. Every run is recorded."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Ledger directory (default: $COMB_FORENSICS_HOME/ledger)
    #[arg(long, global = true)]
    ledger_dir: Option<PathBuf>,

    /// Output as JSON instead of human-readable format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (info-level logs on stderr)
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pre-registered comb test and record the verdict
    Run(RunCmd),

    /// Validate a manifest against its data directory
    Verify(VerifyCmd),

    /// Generate manifests for a data release
    Manifest(ManifestCmd),

    /// Resolve the units of a spectrum file
    Inspect(InspectCmd),

    /// List, show or verify recorded runs
    Ledger(LedgerCmd),

    /// Measure the false-positive rate on synthetic null data
    Calibrate(CalibrateCmd),

    /// Pre-registration helpers
    Config(ConfigCmd),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let Cli {
        command,
        ledger_dir,
        json,
        verbose,
    } = Cli::parse();
    init_tracing(verbose);
    let ledger_dir = ledger_root(ledger_dir);

    let result = match command {
        Commands::Run(cmd) => cmd.execute(&ledger_dir, json, verbose),
        Commands::Verify(cmd) => cmd.execute(json),
        Commands::Manifest(cmd) => cmd.execute(json),
        Commands::Inspect(cmd) => cmd.execute(json),
        Commands::Ledger(cmd) => cmd.execute(&ledger_dir, json),
        Commands::Calibrate(cmd) => cmd.execute(json),
        Commands::Config(cmd) => cmd.execute(json),
    };

    match result {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprint!("{}", format_error(&err, json));
            std::process::exit(2)
        }
    }
}
