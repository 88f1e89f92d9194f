//! ess2bids - Convert legacy ESS studies into BIDS layouts
//!
//! **Usage:**
//! ```bash
//! ess2bids [-s] [-v] [--use-legacy-converter] [-b] [--config <file>] <input> <output>
//! ```
//!
//! In batch mode every subdirectory of `input` is converted into
//! `output/<name>`; failures are logged and the exit code is 1 once all
//! studies were attempted.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ess2bids::convert::{convert_study, ConvertOptions};
use ess2bids::description::Mode;
use ess2bids::electrodes::{CachedExtractor, ExternalEngine};
use ess2bids::generator::GeneratorOptions;
use ess2bids_common::config::load_resolved;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for ess2bids
#[derive(Parser, Debug)]
#[command(name = "ess2bids")]
#[command(about = "Convert a legacy ESS study into a BIDS layout")]
#[command(version)]
struct Args {
    /// Root of the ESS study (or of a folder of studies with --batch)
    input: PathBuf,

    /// Destination root of the BIDS layout
    output: PathBuf,

    /// Skip copying recordings and files ignored by BIDS
    #[arg(short = 's', long = "skip-large-files")]
    stub: bool,

    /// Log progress to standard error
    #[arg(short, long)]
    verbose: bool,

    /// Require every element the legacy schema declares
    #[arg(long)]
    use_legacy_converter: bool,

    /// Treat every subdirectory of input as a separate study
    #[arg(short, long)]
    batch: bool,

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

    info!("Starting ess2bids v{}", env!("CARGO_PKG_VERSION"));

    let config = load_resolved(args.config.as_deref())
        .context("Failed to load configuration")?
        .require_converter()
        .context("Configuration is incomplete")?;

    let options = ConvertOptions {
        mode: if args.use_legacy_converter {
            Mode::Strict
        } else {
            Mode::Lenient
        },
        stub: args.stub,
        generator: GeneratorOptions {
            bids_version: config.bids_version.clone(),
            today: chrono::Local::now().date_naive(),
        },
    };

    let jobs = if args.batch {
        batch_jobs(&args.input, &args.output)?
    } else {
        vec![(args.input.clone(), args.output.clone())]
    };

    let mut engine = ExternalEngine::start(&config)
        .context("Failed to start the electrode extraction engine")?;

    let mut failed = Vec::new();
    for (input, output) in &jobs {
        // Parameter-set labels are study specific; each study gets a fresh cache
        let mut extractor = CachedExtractor::new(engine);
        let result = convert_study(input, output, &mut extractor, &options);
        engine = extractor.into_inner();

        if let Err(e) = result {
            error!("Failed to convert {}: {}", input.display(), e);
            failed.push(input.display().to_string());
        }
    }
    engine.shutdown();

    if !failed.is_empty() {
        bail!("{} of {} studies failed: {}", failed.len(), jobs.len(), failed.join(", "));
    }
    Ok(())
}

/// (study, destination) pairs for every subdirectory of `input`
fn batch_jobs(input: &Path, output: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut jobs = Vec::new();
    let entries = fs::read_dir(input)
        .with_context(|| format!("Unable to list studies in {}", input.display()))?;
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(name) = path.file_name() {
            jobs.push((path.clone(), output.join(name)));
        }
    }
    jobs.sort();
    info!(studies = jobs.len(), "Batch conversion");
    Ok(jobs)
}
