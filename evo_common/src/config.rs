//! TOML loading shared by the EVO CANopen crates.
//!
//! [`ConfigLoader`] turns a file or string into any deserializable
//! configuration tree. [`SharedConfig`] is the `[shared]` table at the top
//! of every network file: the service name that tags log lines and the
//! default log level.

use crate::canopen::consts::CANOPEN_SERVICE_NAME;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading or validation failure.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to read {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },

    /// TOML syntax or schema mismatch; the message names the key.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Default log level of the binary. `RUST_LOG` and `-v` override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Every frame on the bus.
    Trace,
    /// Handshakes, handler decisions and loop statistics.
    Debug,
    #[default]
    Info,
    /// SDO aborts, timing violations, expired nodes.
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

fn default_service_name() -> String {
    format!("evo-{CANOPEN_SERVICE_NAME}")
}

/// The `[shared]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SharedConfig {
    /// Instance name used in engine log lines.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: LogLevel::default(),
        }
    }
}

impl SharedConfig {
    /// The service name must be a single printable ASCII token.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() || !self.service_name.chars().all(|c| c.is_ascii_graphic()) {
            return Err(ConfigError::ValidationError(format!(
                "shared.service_name {:?} must be non-empty printable ASCII without spaces",
                self.service_name
            )));
        }
        Ok(())
    }
}

/// Load TOML into a configuration type.
///
/// Blanket-implemented for every `DeserializeOwned` type.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Read and parse a file. Parse errors are prefixed with the path.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::ParseError(msg) => ConfigError::ParseError(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parse TOML text.
    fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
