//! # Configuration
//!
//! This module handles the reading and parsing of the main configuration file.
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Deserializer};

use crate::certificate_authority::config::{Ca, Service};
use crate::issuance::policy::PolicyConfig;

/// The main configuration for the bastion CA.
#[derive(Deserialize, Debug)]
pub struct Config {
    /// The Certificate Authority (CA) configuration.
    pub ca: Ca,
    /// The issuance policy.
    pub policy: PolicyConfig,
    /// The CA service socket configuration.
    #[serde(default)]
    pub service: Service,
}

/// A trait for inserting the configuration root path into a configuration struct.
///
/// This is used to resolve relative paths in the configuration.
pub(crate) trait InsertConfigRoot {
    /// Inserts the configuration root path into the configuration struct.
    ///
    /// # Arguments
    ///
    /// * `config_root` - The directory containing the configuration file.
    fn insert_config_path(&mut self, config_root: &Path) -> Result<()>;
    /// Checks if the paths in the configuration are valid.
    fn check_paths(&self) -> Result<()>;
}

/// Deserializes a human readable duration such as `"5m"` or `"30days"`.
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

/// Like [`deserialize_duration`], for optional fields.
pub(crate) fn deserialize_optional_duration<'de, D>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(text) => humantime::parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Reads and parses the main configuration file.
///
/// Relative paths in the file are resolved against the file's directory.
///
/// # Arguments
///
/// * `file_path` - The path to the configuration file.
pub fn read_config(file_path: &str) -> Result<Config> {
    let config_path: PathBuf = PathBuf::from(file_path);
    if !config_path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Config file {} not found", file_path),
        )
        .into());
    }
    let config_root = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let mut config_file = File::open(file_path)?;
    let mut config = String::new();
    let _ = config_file.read_to_string(&mut config)?;

    let mut config: Config = toml::from_str(&config)?;
    config.ca.insert_config_path(&config_root)?;
    config.ca.check_paths()?;
    config.service.insert_config_path(&config_root)?;
    config.service.check_paths()?;
    config.service.check()?;

    Ok(config)
}
