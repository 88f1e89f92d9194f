//! Configuration loading and config file resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "ESS2BIDS_CONFIG";

/// Config file looked up in the working directory as a last resort
pub const LOCAL_CONFIG_FILE: &str = "ess2bids.toml";

/// Validator used when the config does not name one
pub const DEFAULT_VALIDATOR: &str = "bids-validator";

/// Raw TOML contents; every key optional at this stage
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TomlConfig {
    pub eeglab_path: Option<PathBuf>,
    pub bids_version: Option<String>,
    /// Program plus argument template; `{eeglab}`, `{file}` and `{dir}` are substituted
    pub electrode_command: Option<Vec<String>>,
    pub validator_command: Option<Vec<String>>,
}

/// Settings the convert-tool cannot run without
#[derive(Debug, Clone, PartialEq)]
pub struct ConverterConfig {
    pub eeglab_path: PathBuf,
    pub bids_version: String,
    pub electrode_command: Vec<String>,
}

impl TomlConfig {
    /// Validate the keys the converter needs
    pub fn require_converter(&self) -> Result<ConverterConfig> {
        let mut missing = Vec::new();
        if self.eeglab_path.is_none() {
            missing.push("eeglab_path");
        }
        if self.bids_version.is_none() {
            missing.push("bids_version");
        }
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing required key(s): {}",
                missing.join(", ")
            )));
        }

        Ok(ConverterConfig {
            eeglab_path: self.eeglab_path.clone().unwrap_or_default(),
            bids_version: self.bids_version.clone().unwrap_or_default(),
            electrode_command: self
                .electrode_command
                .clone()
                .unwrap_or_else(default_electrode_command),
        })
    }

    pub fn validator_command(&self) -> Vec<String> {
        self.validator_command
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_VALIDATOR.to_string()])
    }
}

fn default_electrode_command() -> Vec<String> {
    ["ess2bids-channels", "--eeglab", "{eeglab}", "{file}", "{dir}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Config file resolution following the priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `<user config dir>/ess2bids/config.toml`
/// 4. `./ess2bids.toml` (fallback)
///
/// Returns `None` when no candidate exists.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }

    // Priority 3: user config directory
    if let Some(path) = dirs::config_dir().map(|d| d.join("ess2bids").join("config.toml")) {
        if path.exists() {
            return Some(path);
        }
    }

    // Priority 4: working directory
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    local.exists().then_some(local)
}

/// Parse a TOML config file
pub fn load_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let config = toml::from_str::<TomlConfig>(&content)
        .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
    debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Resolve and load; an unresolvable file yields the empty config
pub fn load_resolved(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg) {
        Some(path) => load_config(&path),
        None => Ok(TomlConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_required_keys_are_named() {
        let config = TomlConfig {
            bids_version: Some("1.2.1".into()),
            ..TomlConfig::default()
        };
        let err = config.require_converter().unwrap_err();
        assert!(err.to_string().contains("eeglab_path"));
        assert!(!err.to_string().contains("bids_version"));
    }

    #[test]
    fn test_validator_command_defaults() {
        assert_eq!(
            TomlConfig::default().validator_command(),
            vec![DEFAULT_VALIDATOR.to_string()]
        );
    }

    #[test]
    #[serial]
    fn test_cli_argument_beats_environment() {
        let dir = TempDir::new().unwrap();
        let cli = dir.path().join("cli.toml");
        std::env::set_var(CONFIG_ENV_VAR, dir.path().join("env.toml"));

        assert_eq!(resolve_config_path(Some(&cli)), Some(cli.clone()));
        assert_eq!(
            resolve_config_path(None),
            Some(dir.path().join("env.toml"))
        );

        std::env::remove_var(CONFIG_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_load_config_reads_all_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
eeglab_path = "/opt/eeglab"
bids_version = "1.2.1"
validator_command = ["bids-validator", "--json"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        let converter = config.require_converter().unwrap();
        assert_eq!(converter.eeglab_path, PathBuf::from("/opt/eeglab"));
        assert_eq!(converter.electrode_command[0], "ess2bids-channels");
        assert_eq!(config.validator_command().len(), 2);
    }

    #[test]
    fn test_malformed_config_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "eeglab_path = [").unwrap();
        assert!(matches!(load_config(&path).unwrap_err(), Error::Config(_)));
    }
}
