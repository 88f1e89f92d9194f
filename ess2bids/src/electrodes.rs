//! Electrode extraction through an external scientific runtime
//!
//! The runtime is wrapped in an [`ExternalEngine`] handle owned by the caller.
//! Its lifecycle is explicit: `start` validates the configuration, each
//! `extract` runs the configured command once, `shutdown` ends the session.

use ess2bids_common::config::ConverterConfig;
use ess2bids_common::project::Electrode;
use ess2bids_common::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Channel layout of one recording as six parallel sequences
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelLayout {
    pub names: Vec<String>,
    pub types: Vec<String>,
    pub x: Vec<Option<f64>>,
    pub y: Vec<Option<f64>>,
    pub z: Vec<Option<f64>>,
    /// Carried through from the extractor, unused by the converter
    pub reserved: Vec<String>,
}

impl ChannelLayout {
    pub fn push(&mut self, name: &str, kind: &str, x: Option<f64>, y: Option<f64>, z: Option<f64>) {
        self.names.push(name.to_string());
        self.types.push(kind.to_string());
        self.x.push(x);
        self.y.push(y);
        self.z.push(z);
        self.reserved.push(String::new());
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Scalp electrodes: channels typed `EEG` or untyped, with a full position
    pub fn electrodes(&self) -> Vec<Electrode> {
        let mut electrodes = Vec::new();
        for (i, name) in self.names.iter().enumerate() {
            let kind = self.types.get(i).map(String::as_str).unwrap_or_default();
            if !(kind.is_empty() || kind.eq_ignore_ascii_case("EEG")) {
                continue;
            }
            let position = (
                self.x.get(i).copied().flatten(),
                self.y.get(i).copied().flatten(),
                self.z.get(i).copied().flatten(),
            );
            match position {
                (Some(x), Some(y), Some(z)) => electrodes.push(Electrode {
                    name: name.clone(),
                    x,
                    y,
                    z,
                }),
                _ => debug!(channel = %name, "Electrode has no position; skipped"),
            }
        }
        electrodes
    }

    /// Parse tab-separated `name type x y z [reserved]` lines
    pub fn parse(text: &str) -> Result<Self> {
        let mut layout = ChannelLayout::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let cells: Vec<&str> = line.split('\t').collect();
            if cells.len() < 5 {
                return Err(Error::ExternalTool(format!(
                    "electrode extractor output line {} has {} columns, expected at least 5",
                    number + 1,
                    cells.len()
                )));
            }
            let coordinate = |cell: &str| cell.trim().parse::<f64>().ok().filter(|v| v.is_finite());
            layout.names.push(cells[0].trim().to_string());
            layout.types.push(cells[1].trim().to_string());
            layout.x.push(coordinate(cells[2]));
            layout.y.push(coordinate(cells[3]));
            layout.z.push(coordinate(cells[4]));
            layout
                .reserved
                .push(cells.get(5).map(|c| c.trim().to_string()).unwrap_or_default());
        }
        Ok(layout)
    }
}

/// Source of channel layouts for recordings
pub trait ElectrodeExtractor {
    /// Channel layout of recording `filename` found in `directory`
    fn extract(&mut self, filename: &str, directory: &Path) -> Result<ChannelLayout>;
}

/// Handle on the external extraction runtime
#[derive(Debug)]
pub struct ExternalEngine {
    command: Vec<String>,
    eeglab_path: PathBuf,
    calls: usize,
}

impl ExternalEngine {
    /// Validate the configured command and EEGLAB installation
    pub fn start(config: &ConverterConfig) -> Result<Self> {
        if config.electrode_command.is_empty() {
            return Err(Error::Config("electrode_command is empty".to_string()));
        }
        if !config.eeglab_path.is_dir() {
            return Err(Error::ExternalTool(format!(
                "EEGLAB installation not found at {}; check eeglab_path in the configuration",
                config.eeglab_path.display()
            )));
        }
        info!(
            program = %config.electrode_command[0],
            eeglab = %config.eeglab_path.display(),
            "Started electrode extraction engine"
        );
        Ok(Self {
            command: config.electrode_command.clone(),
            eeglab_path: config.eeglab_path.clone(),
            calls: 0,
        })
    }

    /// Concrete argument list for one recording
    fn arguments(&self, filename: &str, directory: &Path) -> Vec<String> {
        let eeglab = self.eeglab_path.to_string_lossy();
        let dir = directory.to_string_lossy();
        self.command
            .iter()
            .map(|part| {
                part.replace("{eeglab}", &eeglab)
                    .replace("{file}", filename)
                    .replace("{dir}", &dir)
            })
            .collect()
    }

    pub fn shutdown(self) {
        info!(calls = self.calls, "Electrode extraction engine shut down");
    }
}

impl ElectrodeExtractor for ExternalEngine {
    fn extract(&mut self, filename: &str, directory: &Path) -> Result<ChannelLayout> {
        let args = self.arguments(filename, directory);
        let Some((program, rest)) = args.split_first() else {
            return Err(Error::Config("electrode_command is empty".to_string()));
        };

        debug!(program = %program, file = %filename, "Extracting channel layout");
        let output = Command::new(program)
            .args(rest)
            .output()
            .map_err(|e| Error::ExternalTool(format!("unable to launch {}: {}", program, e)))?;
        self.calls += 1;

        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "{} failed on {} ({}): {}",
                program,
                filename,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        ChannelLayout::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Extractor wrapper calling the inner extractor at most once per
/// recording-parameter-set label
pub struct CachedExtractor<E> {
    inner: E,
    cache: HashMap<String, ChannelLayout>,
}

impl<E: ElectrodeExtractor> CachedExtractor<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
        }
    }

    /// Layout for `label`, extracted from `filename` on first request
    pub fn layout(&mut self, label: &str, filename: &str, directory: &Path) -> Result<&ChannelLayout> {
        if !self.cache.contains_key(label) {
            info!("Extracting electrode set from {}...", label);
            let layout = self.inner.extract(filename, directory)?;
            self.cache.insert(label.to_string(), layout);
        }
        self.cache
            .get(label)
            .ok_or_else(|| Error::NotFound(format!("channel layout for {}", label)))
    }

    pub fn into_inner(self) -> E {
        self.inner
    }
}
