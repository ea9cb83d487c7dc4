//! User-level tool defaults.
//!
//! An optional `slipway.toml` in the user's config directory supplies
//! defaults for things the command line can also set: parallelism,
//! verbosity, keep-going. Command-line flags always win. This is distinct
//! from per-project persisted configuration (`build/config.build`), which
//! belongs to the config module.

use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

static PROJECT_DIRS: LazyLock<Option<ProjectDirs>> =
    LazyLock::new(|| ProjectDirs::from("dev", "slipway", "slipway"));

/// User-level defaults loaded from `slipway.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    /// Default for `-j` (0 or absent: hardware concurrency).
    #[serde(default)]
    pub jobs: Option<usize>,

    /// Default verbosity (0-6).
    #[serde(default)]
    pub verbosity: Option<u8>,

    /// Default for `-k`.
    #[serde(default)]
    pub keep_going: Option<bool>,
}

impl UserConfig {
    /// The path of the user config file, if a config directory exists.
    pub fn path() -> Option<PathBuf> {
        PROJECT_DIRS
            .as_ref()
            .map(|d| d.config_dir().join("slipway.toml"))
            .or_else(|| dirs::home_dir().map(|h| h.join(".slipway").join("slipway.toml")))
    }

    /// Load the user config, returning defaults if the file is absent.
    pub fn load() -> Result<Self> {
        let Some(path) = Self::path() else {
            return Ok(UserConfig::default());
        };

        if !path.is_file() {
            return Ok(UserConfig::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("unable to read {}", path.display()))?;

        let cfg: UserConfig = toml::from_str(&text)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        if let Some(v) = cfg.verbosity {
            if v > 6 {
                tracing::warn!("{}: verbosity {} clamped to 6", path.display(), v);
            }
        }

        Ok(cfg)
    }

    /// Parse a config from TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let cfg = UserConfig::parse("").unwrap();
        assert_eq!(cfg.jobs, None);
        assert_eq!(cfg.verbosity, None);
        assert_eq!(cfg.keep_going, None);
    }

    #[test]
    fn test_parse_values() {
        let cfg = UserConfig::parse("jobs = 4\nverbosity = 2\nkeep_going = true\n").unwrap();
        assert_eq!(cfg.jobs, Some(4));
        assert_eq!(cfg.verbosity, Some(2));
        assert_eq!(cfg.keep_going, Some(true));
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        assert!(UserConfig::parse("threads = 4\n").is_err());
    }
}
