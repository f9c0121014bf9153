//! Persisted supervisor configuration
//!
//! The record is written once by the installer and read once at startup to
//! locate the binaries the supervisor launches.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to read config file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to write config file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to encode config: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Locations of the executables the supervisor manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "MystPath", default)]
    pub myst_path: String,
    #[serde(rename = "OpenVPNPath", default)]
    pub openvpn_path: String,
}

impl Config {
    pub fn new(myst_path: impl Into<String>, openvpn_path: impl Into<String>) -> Self {
        Self {
            myst_path: myst_path.into(),
            openvpn_path: openvpn_path.into(),
        }
    }

    /// Both paths must be present before the record is written or trusted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.myst_path.is_empty() {
            return Err(ConfigError::Invalid("MystPath is empty".to_string()));
        }
        if self.openvpn_path.is_empty() {
            return Err(ConfigError::Invalid("OpenVPNPath is empty".to_string()));
        }
        Ok(())
    }

    /// Read and validate the record at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let config: Config = toml::from_str(&content)?;
        if let Err(ConfigError::Invalid(reason)) = config.validate() {
            return Err(ConfigError::Invalid(format!(
                "{} in {}, please re-install the supervisor",
                reason,
                path.display()
            )));
        }
        Ok(config)
    }

    /// Validate and persist the record, replacing any previous file.
    ///
    /// The content goes to a sibling temporary file first and is renamed over
    /// `path`, so an existing record is either fully replaced or untouched.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;

        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let tmp_path = path.with_extension("tmp");
        debug!("Writing config to {}", tmp_path.display());
        let mut file = owner_only_file(&tmp_path).map_err(write_err)?;
        file.write_all(content.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            write_err(e)
        })?;
        Ok(())
    }
}

#[cfg(unix)]
fn owner_only_file(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn owner_only_file(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Well-known location of the configuration record.
pub fn default_path() -> PathBuf {
    if cfg!(windows) {
        let base = std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        PathBuf::from(base)
            .join("MystSupervisor")
            .join("supervisor.conf")
    } else {
        PathBuf::from("/etc/myst-supervisor/supervisor.conf")
    }
}
