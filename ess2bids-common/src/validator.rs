//! External BIDS validator invocation

use crate::layout::VALIDATOR_OUTPUT;
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

/// Run `command` (program plus arguments) against `root`
///
/// Standard output lands in VALIDATOR_OUTPUT.txt at the root whatever the exit
/// status. Returns `Ok(None)` if the validator cannot be launched.
pub fn run_validator(command: &[String], root: &Path) -> Result<Option<PathBuf>> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::Config("validator_command is empty".to_string()))?;

    info!(program = %program, root = %root.display(), "Running BIDS validator");
    let output = match Command::new(program).args(args).arg(root).output() {
        Ok(output) => output,
        Err(e) => {
            warn!("Unable to launch validator {}: {}; skipping validation", program, e);
            return Ok(None);
        }
    };

    if !output.status.success() {
        info!(status = %output.status, "Validator reported problems");
    }

    let path = root.join(VALIDATOR_OUTPUT);
    fs::write(&path, &output.stdout)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_validator_is_skipped() {
        let dir = TempDir::new().unwrap();
        let command = vec!["definitely-not-a-validator-binary".to_string()];
        assert!(run_validator(&command, dir.path()).unwrap().is_none());
        assert!(!dir.path().join(VALIDATOR_OUTPUT).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_validator_output_is_captured() {
        let dir = TempDir::new().unwrap();
        let command = vec!["echo".to_string(), "checked".to_string()];
        let path = run_validator(&command, dir.path()).unwrap().unwrap();
        let text = fs::read_to_string(path).unwrap();
        assert!(text.starts_with("checked "));
    }

    #[test]
    fn test_empty_command_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            run_validator(&[], dir.path()).unwrap_err(),
            Error::Config(_)
        ));
    }
}
