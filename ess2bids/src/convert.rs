//! End-to-end conversion of one legacy study into a BIDS layout

use crate::definitions::DISCLAIMER;
use crate::description::Mode;
use crate::electrodes::{CachedExtractor, ElectrodeExtractor};
use crate::generator::{generate_project, GeneratorOptions};
use crate::repair::load_study;
use ess2bids_common::export::{export_project, ExportOptions, ExportSummary};
use ess2bids_common::report::conversion_section;
use ess2bids_common::Result;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub mode: Mode,
    /// Skip copying recordings and ignored files
    pub stub: bool,
    pub generator: GeneratorOptions,
}

/// Convert the study at `input` into a layout rooted at `output`
pub fn convert_study<E: ElectrodeExtractor>(
    input: &Path,
    output: &Path,
    extractor: &mut CachedExtractor<E>,
    options: &ConvertOptions,
) -> Result<ExportSummary> {
    let (study_dir, study) = load_study(input, options.mode)?;
    let mut project = generate_project(&study, &study_dir, extractor, &options.generator)?;

    let report = conversion_section(DISCLAIMER, &project.generate_warnings());
    let export = ExportOptions {
        stub: options.stub,
        report,
        ..ExportOptions::default()
    };
    let summary = export_project(&mut project, output, &export)?;
    info!(
        input = %input.display(),
        output = %output.display(),
        written = summary.written.len(),
        "Conversion complete"
    );
    Ok(summary)
}
