//! Connection configuration and its on-disk store
//!
//! The record is a flat TOML table. Optional values that are not set are left
//! out of the file entirely, so an absent field always reads back as `None`.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::fsutil;

/// Interface name used when none is configured
pub const DEFAULT_INTERFACE: &str = "tun0";

/// Linux limits interface names to IFNAMSIZ - 1 bytes
const MAX_INTERFACE_LEN: usize = 15;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No saved configuration at {0}")]
    NotFound(PathBuf),
    #[error("No VPN server configured")]
    MissingServer,
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Parameters for one openconnect connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// VPN server hostname or URL
    #[serde(default)]
    pub server: String,
    /// Username; when absent openconnect asks for it itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Auth group/profile, if the server asks for one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_group: Option<String>,
    /// TUN interface name
    #[serde(default = "default_interface")]
    pub interface_name: String,
    /// Server certificate pin, e.g. `pin-sha256:BASE64...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_cert_pin: Option<String>,
    /// Force TLS/TCP by disabling DTLS/UDP
    #[serde(default)]
    pub disable_dtls: bool,
    /// Where openconnect's output is written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<PathBuf>,
    /// Extra openconnect arguments, passed through token by token
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

fn default_interface() -> String {
    DEFAULT_INTERFACE.to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: None,
            auth_group: None,
            interface_name: default_interface(),
            server_cert_pin: None,
            disable_dtls: false,
            log_file_path: None,
            extra_args: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    /// Trim values and turn empty optional strings into `None`.
    pub fn normalized(mut self) -> Self {
        self.server = self.server.trim().to_string();
        self.username = normalize(self.username);
        self.auth_group = normalize(self.auth_group);
        self.server_cert_pin = normalize(self.server_cert_pin);
        self.interface_name = match self.interface_name.trim() {
            "" => default_interface(),
            name => name.to_string(),
        };
        self.log_file_path = self.log_file_path.filter(|p| !p.as_os_str().is_empty());
        self
    }

    /// Check every field. An empty server is reported as [`ConfigError::MissingServer`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err(ConfigError::MissingServer);
        }
        if server.starts_with('-') {
            return Err(invalid("server", "must not start with '-'"));
        }
        if server.chars().any(char::is_whitespace) {
            return Err(invalid("server", "must not contain whitespace"));
        }

        for (field, value) in [
            ("username", &self.username),
            ("auth_group", &self.auth_group),
        ] {
            if let Some(value) = value {
                if value.is_empty() {
                    return Err(invalid(field, "must not be empty"));
                }
                if value.chars().any(char::is_control) {
                    return Err(invalid(field, "must not contain control characters"));
                }
            }
        }

        let iface = &self.interface_name;
        if iface.is_empty() || iface.len() > MAX_INTERFACE_LEN {
            return Err(invalid(
                "interface_name",
                format!("must be 1-{MAX_INTERFACE_LEN} bytes long"),
            ));
        }
        if iface == "." || iface == ".." || iface.contains('/') {
            return Err(invalid("interface_name", "is not a valid interface name"));
        }
        if iface.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("interface_name", "must not contain whitespace"));
        }

        if let Some(pin) = &self.server_cert_pin {
            if pin.is_empty() || pin.chars().any(char::is_whitespace) {
                return Err(invalid("server_cert_pin", "must be a single token"));
            }
        }

        if let Some(path) = &self.log_file_path {
            if path.as_os_str().is_empty() {
                return Err(invalid("log_file_path", "must not be empty"));
            }
        }

        if self.extra_args.iter().any(|arg| arg.contains('\0')) {
            return Err(invalid("extra_args", "must not contain NUL bytes"));
        }

        Ok(())
    }

    /// The record as it is written to disk
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn normalize(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Field overrides collected from the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPatch {
    pub server: Option<String>,
    pub username: Option<String>,
    pub auth_group: Option<String>,
    pub interface_name: Option<String>,
    pub server_cert_pin: Option<String>,
    pub disable_dtls: Option<bool>,
    pub log_file_path: Option<PathBuf>,
    pub extra_args: Option<Vec<String>>,
}

impl ConfigPatch {
    /// Overlay the set fields onto `base`.
    pub fn apply(self, mut base: ConnectionConfig) -> ConnectionConfig {
        if let Some(server) = self.server {
            base.server = server;
        }
        if self.username.is_some() {
            base.username = self.username;
        }
        if self.auth_group.is_some() {
            base.auth_group = self.auth_group;
        }
        if let Some(iface) = self.interface_name {
            base.interface_name = iface;
        }
        if self.server_cert_pin.is_some() {
            base.server_cert_pin = self.server_cert_pin;
        }
        if let Some(disable) = self.disable_dtls {
            base.disable_dtls = disable;
        }
        if self.log_file_path.is_some() {
            base.log_file_path = self.log_file_path;
        }
        if let Some(extra) = self.extra_args {
            base.extra_args = extra;
        }
        base.normalized()
    }
}

/// Per-user default location of the saved configuration
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("ocvpn").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("ocvpn.toml"))
}

/// Reads and writes the saved [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_default_location() -> Self {
        Self::new(default_config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<ConnectionConfig, ConfigError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.clone()));
            }
            Err(source) => {
                return Err(ConfigError::ReadError {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let config: ConnectionConfig =
            toml::from_str(&content).map_err(|source| ConfigError::ParseError {
                path: self.path.clone(),
                source,
            })?;
        debug!("Loaded config from {}", self.path.display());
        Ok(config.normalized())
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(&self) -> Result<ConnectionConfig, ConfigError> {
        match self.load() {
            Err(ConfigError::NotFound(_)) => Ok(ConnectionConfig::default()),
            other => other,
        }
    }

    pub fn save(&self, config: &ConnectionConfig) -> Result<(), ConfigError> {
        let config = config.clone().normalized();
        config.validate()?;
        let content = config.to_toml()?;
        fsutil::write_atomic(&self.path, content.as_bytes()).map_err(|source| {
            ConfigError::WriteError {
                path: self.path.clone(),
                source,
            }
        })?;
        debug!("Saved config to {}", self.path.display());
        Ok(())
    }

    pub fn delete(&self) -> Result<(), ConfigError> {
        match fsutil::remove_if_exists(&self.path) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ConfigError::NotFound(self.path.clone())),
            Err(source) => Err(ConfigError::WriteError {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
