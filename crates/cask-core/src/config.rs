//! Configuration system for Cask.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CASK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cask/config.toml
//!   3. ~/.config/cask/config.toml
//!
//! The listening port has its own order, kept for deployments that predate
//! the config file: $CASK_NETWORK__PORT → port file → config → 1234.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::crypto::ChecksumKind;

/// Port used when nothing else names one.
pub const DEFAULT_PORT: u16 = 1234;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaskConfig {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind.
    pub host: String,
    /// Listening port. Unset = consult the port file, then the default.
    pub port: Option<u16>,
    /// Legacy single-line port file. Relative paths resolve against the
    /// working directory.
    pub port_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the per-client upload directories.
    pub files_dir: PathBuf,
    /// SQLite database holding client and file records.
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Each frame must arrive in full within this many seconds, or the
    /// connection is closed. Must be at least 1.
    pub idle_timeout_secs: u64,
    pub upload_padding: UploadPadding,
    pub checksum: ChecksumKind,
}

/// How the plaintext of an upload ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPadding {
    /// Ciphertext is block aligned and the plaintext is stored verbatim.
    #[default]
    None,
    /// The final block carries PKCS#7 padding, stripped before storage.
    Pkcs7,
}

impl FromStr for UploadPadding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(UploadPadding::None),
            "pkcs7" => Ok(UploadPadding::Pkcs7),
            other => Err(format!("unknown upload padding: {other}")),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: None,
            port_file: PathBuf::from("port.info"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_dir: data_dir().join("files"),
            database_path: data_dir().join("cask.db"),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            upload_padding: UploadPadding::None,
            checksum: ChecksumKind::Cksum,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cask")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cask")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {0}: {1}")]
    Invalid(PathBuf, &'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Where the listening port came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    Env,
    PortFile,
    Config,
    Default,
}

impl CaskConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::file_path())?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load a config file without env overrides. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(CaskConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config
            .validate()
            .map_err(|reason| ConfigError::Invalid(path.to_path_buf(), reason))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.session.idle_timeout_secs == 0 {
            return Err("session.idle_timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CASK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text =
            toml::to_string_pretty(&CaskConfig::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply CASK_* overrides. Unparseable values are ignored.
    /// The port is not applied here; see `resolve_port`.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CASK_NETWORK__HOST") {
            self.network.host = v;
        }
        if let Some(v) = var("CASK_SESSION__IDLE_TIMEOUT_SECS") {
            match v.parse::<u64>() {
                Ok(0) | Err(_) => {}
                Ok(secs) => self.session.idle_timeout_secs = secs,
            }
        }
        if let Some(v) = var("CASK_SESSION__UPLOAD_PADDING") {
            if let Ok(p) = v.parse() {
                self.session.upload_padding = p;
            }
        }
        if let Some(v) = var("CASK_SESSION__CHECKSUM") {
            if let Ok(c) = v.parse() {
                self.session.checksum = c;
            }
        }
        if let Some(v) = var("CASK_STORAGE__FILES_DIR") {
            self.storage.files_dir = PathBuf::from(v);
        }
        if let Some(v) = var("CASK_STORAGE__DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
    }

    /// Resolve the listening port: env → port file → config → default.
    pub fn resolve_port(&self) -> (u16, PortSource) {
        self.resolve_port_with(|name| std::env::var(name).ok())
    }

    fn resolve_port_with(&self, var: impl Fn(&str) -> Option<String>) -> (u16, PortSource) {
        if let Some(port) = var("CASK_NETWORK__PORT").and_then(|v| v.trim().parse().ok()) {
            return (port, PortSource::Env);
        }
        if let Some(port) = read_port_file(&self.network.port_file) {
            return (port, PortSource::PortFile);
        }
        match self.network.port {
            Some(port) => (port, PortSource::Config),
            None => (DEFAULT_PORT, PortSource::Default),
        }
    }
}

/// A port file holds one decimal port number. Missing or garbled files are
/// treated as absent.
fn read_port_file(path: &Path) -> Option<u16> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
