//! bids-finalize - Apply field replacements and validate a BIDS layout
//!
//! **Usage:**
//! ```bash
//! bids-finalize [-s] [-v] [-p] [--config <file>] <bids_path>
//! ```
//!
//! Reads `field_replacements.json` at the layout root, applies renames and
//! field updates, rewrites only the affected files and appends the outcome to
//! REPORT.txt. Unless `-p` is given the external validator runs afterwards.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ess2bids_common::config::load_resolved;
use ess2bids_common::patch::replace_fields;
use ess2bids_common::validator::run_validator;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for bids-finalize
#[derive(Parser, Debug)]
#[command(name = "bids-finalize")]
#[command(about = "Apply field_replacements.json to a BIDS layout and validate it")]
#[command(version)]
struct Args {
    /// Root of the BIDS layout
    bids_path: PathBuf,

    /// Skip copying recordings and files ignored by BIDS
    #[arg(short = 's', long = "skip-large-files")]
    stub: bool,

    /// Log progress to standard error
    #[arg(short, long)]
    verbose: bool,

    /// Only replace fields; do not run the external validator
    #[arg(short = 'p', long = "skip-external-validation")]
    skip_validation: bool,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if !args.bids_path.is_dir() {
        bail!("Invalid directory specified: {}", args.bids_path.display());
    }

    // Only the optional validator command is read; a broken file falls back to defaults
    let config = match load_resolved(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            warn!("{}; using default settings", e);
            Default::default()
        }
    };

    let (report, summary) = replace_fields(&args.bids_path, args.stub)
        .with_context(|| format!("Failed to finalize {}", args.bids_path.display()))?;
    info!(
        failures = report.failures().len(),
        warnings = report.warnings().len(),
        written = summary.written.len(),
        archived = summary.archived.len(),
        renamed = summary.renamed.len(),
        "Field replacements applied"
    );

    if !args.skip_validation {
        let command = config.validator_command();
        if let Some(output) = run_validator(&command, &args.bids_path)? {
            println!(
                "{} has been analyzed for validity; see {}",
                args.bids_path.display(),
                output.display()
            );
        }
    }
    Ok(())
}
