//! User configuration (`config.toml`).

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use objsheet_engine::Settings;
use serde::Deserialize;

use crate::error::{CliError, Result};

pub const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: Settings,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    pub level: Option<String>,
}

impl Config {
    pub fn log_level(&self) -> &str {
        self.log.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("", "", "objsheet")?;
    let mut path = proj.config_dir().to_path_buf();
    path.push("config.toml");
    Some(path)
}

/// Read the config at `path`. A missing default file is not an error; a
/// missing file named on the command line is.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(Config::default()),
        },
    };
    if !explicit && !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(&path).map_err(|source| CliError::ReadConfig {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| CliError::ParseConfig { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str("[engine]\ncompiler = true\n[log]\nlevel = \"info\"\n").unwrap();
        assert!(config.engine.compiler);
        assert_eq!(config.log_level(), "info");
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(!config.engine.compiler);
        assert_eq!(config.log_level(), DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("[engine]\njit = true\n").is_err());
        assert!(toml::from_str::<Config>("[colors]\n").is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load(Some(Path::new("/nonexistent/objsheet.toml"))).unwrap_err();
        assert!(matches!(err, CliError::ReadConfig { .. }));
    }
}
