//! Encoding repair for study descriptions that fail to decode
//!
//! The original file is never modified. A repaired copy is written to a
//! scratch directory inside the study input and removed again when the
//! [`ScratchCopy`] guard goes out of scope.

use crate::description::{locate_study, read_description, Mode, StudyDescription, DESCRIPTION_FILE};
use ess2bids_common::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Scratch directory created inside the study input
pub const SCRATCH_DIR: &str = "DELETEME";

/// Characters known to break legacy descriptions, with their replacements
const SUBSTITUTIONS: &[(char, &str)] = &[
    ('\u{00D7}', "x"),
    ('\u{2014}', "-"),
    ('\u{201C}', "\""),
    ('\u{201D}', "\""),
];

/// Replace problem characters; invalid UTF-8 sequences are replaced lossily
pub fn repair_text(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    for (from, to) in SUBSTITUTIONS {
        if text.contains(*from) {
            text = text.replace(*from, to);
        }
    }
    text
}

/// Repaired copy of a study description, deleted on drop
#[derive(Debug)]
pub struct ScratchCopy {
    dir: PathBuf,
    path: PathBuf,
}

impl ScratchCopy {
    /// Write a repaired copy of `source` into `<input>/DELETEME/`
    pub fn create(input: &Path, source: &Path) -> Result<Self> {
        let bytes = fs::read(source)?;
        let dir = input.join(SCRATCH_DIR);
        fs::create_dir_all(&dir)?;
        // Guard exists before the write so a failed write still cleans up
        let copy = Self {
            path: dir.join(DESCRIPTION_FILE),
            dir,
        };
        fs::write(&copy.path, repair_text(&bytes))?;
        debug!(path = %copy.path.display(), "Wrote repaired study description");
        Ok(copy)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchCopy {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!("Unable to remove scratch directory {}: {}", self.dir.display(), e);
        }
    }
}

/// Locate and extract the study description under `input`
///
/// A decode failure triggers exactly one retry on a repaired scratch copy.
/// Returns the study directory (where recordings are resolved from) and the
/// extracted description.
pub fn load_study(input: &Path, mode: Mode) -> Result<(PathBuf, StudyDescription)> {
    let study_dir = locate_study(input)?;
    let source = study_dir.join(DESCRIPTION_FILE);

    match read_description(&source, mode) {
        Err(Error::SourceDecode { reason, .. }) => {
            warn!(
                "Error decoding {}: {}. Attempting to fix encoding errors...",
                source.display(),
                reason
            );
            let scratch = ScratchCopy::create(input, &source)?;
            let description = read_description(scratch.path(), mode).map_err(|e| match e {
                Error::SourceDecode { reason, .. } => Error::SourceDecode {
                    path: source.clone(),
                    reason,
                },
                other => other,
            })?;
            Ok((study_dir, description))
        }
        result => Ok((study_dir, result?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BROKEN: &str = "<studyLevel1><title>2\u{00D7}2 \u{201C}design\u{201D} \u{2014} v1</title>";

    #[test]
    fn test_repair_substitutes_known_characters() {
        let repaired = repair_text(BROKEN.as_bytes());
        assert_eq!(repaired, "<studyLevel1><title>2x2 \"design\" - v1</title>");
    }

    #[test]
    fn test_repair_replaces_invalid_utf8() {
        let repaired = repair_text(&[b'a', 0xFF, b'b']);
        assert_eq!(repaired, "a\u{FFFD}b");
    }

    #[test]
    fn test_scratch_directory_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join(DESCRIPTION_FILE);
        fs::write(&source, BROKEN).unwrap();

        let scratch = ScratchCopy::create(dir.path(), &source).unwrap();
        assert!(scratch.path().is_file());
        drop(scratch);
        assert!(!dir.path().join(SCRATCH_DIR).exists());
        assert_eq!(fs::read_to_string(&source).unwrap(), BROKEN);
    }

    #[test]
    fn test_load_retries_after_repair() {
        let dir = TempDir::new().unwrap();
        let mut bytes = b"<studyLevel1><title>Study ".to_vec();
        bytes.push(0xFF);
        bytes.extend_from_slice(b"</title></studyLevel1>");
        fs::write(dir.path().join(DESCRIPTION_FILE), &bytes).unwrap();

        let (study_dir, study) = load_study(dir.path(), Mode::Lenient).unwrap();
        assert_eq!(study_dir, dir.path());
        assert_eq!(study.header.title.as_deref(), Some("Study \u{FFFD}"));
        assert!(!dir.path().join(SCRATCH_DIR).exists());
    }

    #[test]
    fn test_load_fails_when_repair_does_not_help() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(DESCRIPTION_FILE), "<studyLevel1><title>").unwrap();

        let result = load_study(dir.path(), Mode::Lenient);
        assert!(matches!(result, Err(Error::SourceDecode { .. })));
        assert!(!dir.path().join(SCRATCH_DIR).exists());
    }
}
