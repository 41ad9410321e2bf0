//! # CA Configuration
//!
//! This module defines the configuration structures for the Certificate Authority (CA).
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::config::{InsertConfigRoot, deserialize_duration};

/// Configuration for the Certificate Authority.
#[derive(Deserialize, Debug, Clone)]
pub struct Ca {
    /// The path to the CA's private key.
    pub ca_key: PathBuf,
}

impl InsertConfigRoot for Ca {
    /// Resolves a relative CA key path against the configuration root.
    fn insert_config_path(&mut self, config_root: &Path) -> Result<()> {
        if !self.ca_key.has_root() {
            self.ca_key = config_root.join(&self.ca_key);
        }
        Ok(())
    }

    /// Checks that the CA key file exists.
    fn check_paths(&self) -> Result<()> {
        if self.ca_key.exists() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("CA key file {:?} not found", self.ca_key),
            )
            .into())
        }
    }
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(3600)
}

/// Configuration for the CA service socket.
#[derive(Deserialize, Debug, Clone)]
pub struct Service {
    /// Where the service listens. May be overridden on the command line.
    pub socket_path: Option<PathBuf>,
    /// File holding the bearer token clients must present.
    pub auth_token_file: Option<PathBuf>,
    /// How often expired replay records are swept.
    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub sweep_interval: Duration,
}

impl Default for Service {
    fn default() -> Self {
        Service {
            socket_path: None,
            auth_token_file: None,
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Service {
    /// Checks the values that cannot be expressed in the type.
    pub fn check(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            bail!("service sweep_interval must be greater than zero");
        }
        Ok(())
    }

    /// Reads the bearer token, ignoring surrounding whitespace.
    pub fn read_auth_token(&self) -> Result<Zeroizing<String>> {
        let Some(path) = &self.auth_token_file else {
            bail!("no auth_token_file configured for the CA service");
        };
        let raw = Zeroizing::new(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read auth token file {:?}", path))?,
        );
        let token = raw.trim();
        if token.is_empty() {
            bail!("auth token file {:?} is empty", path);
        }
        Ok(Zeroizing::new(token.to_string()))
    }
}

impl InsertConfigRoot for Service {
    fn insert_config_path(&mut self, config_root: &Path) -> Result<()> {
        for path in [&mut self.socket_path, &mut self.auth_token_file]
            .into_iter()
            .flatten()
        {
            if !path.has_root() {
                *path = config_root.join(&*path);
            }
        }
        Ok(())
    }

    fn check_paths(&self) -> Result<()> {
        match &self.auth_token_file {
            Some(path) if !path.exists() => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("auth token file {:?} not found", path),
            )
            .into()),
            _ => Ok(()),
        }
    }
}
