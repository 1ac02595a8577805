//! Session lifecycle
//!
//! One openconnect session per host. The [`SessionManager`] is the only thing
//! that changes session state; the marker file carries that state between
//! separate invocations and the lock file serialises them.
//!
//! # States
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! Any state falls back to `Disconnected` when the client is found dead.

pub mod lock;
pub mod manager;
pub mod tracker;

pub use lock::{LockError, SessionLock};
pub use manager::{ActiveSession, SessionManager};
pub use tracker::{Marker, SessionTracker};

use nix::unistd::geteuid;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::openconnect::LocateError;
use crate::platform::PlatformError;
use crate::supervisor::SupervisorError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No VPN server configured")]
    ConfigMissing,
    #[error("No saved configuration at {0}")]
    NoSavedConfig(PathBuf),
    #[error("Invalid configuration value for {field}: {reason}")]
    ConfigInvalid { field: &'static str, reason: String },
    #[error("A VPN session is already active (pid {0})")]
    AlreadyConnected(u32),
    #[error("No active VPN session")]
    NotConnected,
    #[error("Failed to run openconnect: {0}")]
    SpawnError(String),
    #[error("openconnect exited before the tunnel came up ({})", describe_exit(.0))]
    ConnectFailed(Option<i32>),
    #[error("openconnect did not finish connecting within {0:?}")]
    ConnectTimedOut(Duration),
    #[error("openconnect (pid {0}) did not exit after the disconnect request; sent SIGTERM")]
    DisconnectTimedOut(u32),
    #[error("Creating a tunnel interface requires root privileges")]
    PrivilegeDenied,
    #[error("Another ocvpn invocation holds the session lock {0}")]
    SessionBusy(PathBuf),
    #[error("Refusing state directory {path}: it {reason}")]
    InsecureStateDir { path: PathBuf, reason: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by a signal".to_string(),
    }
}

impl SessionError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> SessionError + '_ {
        move |source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::ConfigMissing => 10,
            SessionError::ConfigInvalid { .. } => 11,
            SessionError::AlreadyConnected(_) => 12,
            SessionError::NotConnected => 13,
            SessionError::SpawnError(_) => 14,
            SessionError::ConnectFailed(_) => 15,
            SessionError::ConnectTimedOut(_) => 16,
            SessionError::DisconnectTimedOut(_) => 17,
            SessionError::PrivilegeDenied => 18,
            SessionError::SessionBusy(_) => 19,
            SessionError::Io { .. } => 20,
            SessionError::InsecureStateDir { .. } => 21,
            SessionError::NoSavedConfig(_) => 22,
        }
    }

    /// What the user can do about it
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SessionError::ConfigMissing => {
                Some("pass a server (`ocvpn connect vpn.example.com`) or save one with `ocvpn config set`")
            }
            SessionError::ConfigInvalid { .. } => Some("fix the value with `ocvpn config set` or `ocvpn config edit`"),
            SessionError::AlreadyConnected(_) => Some("run `ocvpn disconnect` first"),
            SessionError::NotConnected => Some("run `ocvpn connect` to start a session"),
            SessionError::SpawnError(_) => {
                Some("check that openconnect is installed (e.g. sudo apt-get install openconnect) or pass --openconnect-path")
            }
            SessionError::ConnectFailed(_) => {
                Some("check the server, credentials and certificate pin; use --foreground or --log-file to see openconnect's output")
            }
            SessionError::ConnectTimedOut(_) => Some("raise --connect-timeout or check that the server is reachable"),
            SessionError::DisconnectTimedOut(_) => Some("run `ocvpn status` to see whether it has stopped"),
            SessionError::PrivilegeDenied => Some("run with elevated privileges (sudo) or pass --elevate"),
            SessionError::SessionBusy(_) => Some("wait for the other ocvpn command to finish and try again"),
            SessionError::InsecureStateDir { .. } => Some(
                "use a directory owned by root (or you) that only its owner can write, e.g. --state-dir /run/ocvpn",
            ),
            SessionError::NoSavedConfig(_) => Some("save one with `ocvpn config set` or `ocvpn config edit`"),
            SessionError::Io { .. } => None,
        }
    }
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound(path) => SessionError::NoSavedConfig(path),
            ConfigError::MissingServer => SessionError::ConfigMissing,
            ConfigError::Invalid { field, reason } => SessionError::ConfigInvalid { field, reason },
            ConfigError::ParseError { path, source } => SessionError::ConfigInvalid {
                field: "config file",
                reason: format!("{}: {}", path.display(), source),
            },
            ConfigError::SerializeError(e) => SessionError::ConfigInvalid {
                field: "config",
                reason: e.to_string(),
            },
            ConfigError::ReadError { path, source } | ConfigError::WriteError { path, source } => {
                SessionError::Io { path, source }
            }
        }
    }
}

impl From<LockError> for SessionError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(path) => SessionError::SessionBusy(path),
            LockError::Io { path, source } => SessionError::Io { path, source },
        }
    }
}

impl From<PlatformError> for SessionError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::PermissionDenied(_) => SessionError::PrivilegeDenied,
            PlatformError::SignalError { .. } => SessionError::SpawnError(err.to_string()),
        }
    }
}

impl From<SupervisorError> for SessionError {
    fn from(err: SupervisorError) -> Self {
        if let SupervisorError::Spawn { source, .. } = &err {
            if source.kind() == io::ErrorKind::PermissionDenied {
                return SessionError::SpawnError(format!("{err} (is the binary executable?)"));
            }
        }
        match err {
            SupervisorError::LogFile { path, source } => SessionError::Io { path, source },
            other => SessionError::SpawnError(other.to_string()),
        }
    }
}

impl From<LocateError> for SessionError {
    fn from(err: LocateError) -> Self {
        SessionError::SpawnError(err.to_string())
    }
}

/// Lifecycle states of the managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (_, Disconnected)
        )
    }
}

/// Runtime view of the session. `pid` is only set while connecting or connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub pid: Option<u32>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            pid: None,
        }
    }
}

/// Answer to `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionReport {
    Disconnected,
    Connected { pid: u32 },
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionReport::Disconnected => write!(f, "DISCONNECTED"),
            SessionReport::Connected { pid } => write!(f, "CONNECTED pid={pid}"),
        }
    }
}

/// Password handed to openconnect on stdin
#[derive(Clone, Default)]
pub struct Credentials {
    pub password: Option<String>,
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// State directory used when running as root
pub const SYSTEM_STATE_DIR: &str = "/run/ocvpn";

/// Files the manager works with, all inside one state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Must be owned by root or us and not writable by anyone else
    pub dir: PathBuf,
    /// Pid of the active session, written only by the manager
    pub marker: PathBuf,
    pub lock: PathBuf,
    /// Pid file openconnect writes itself when it daemonizes
    pub handoff: PathBuf,
}

impl SessionPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            marker: dir.join("session.pid"),
            lock: dir.join("session.lock"),
            handoff: dir.join("openconnect.pid"),
        }
    }

    /// [`SYSTEM_STATE_DIR`] for root. Other users keep their state in their
    /// private runtime directory, which `--elevate` sessions need to write.
    pub fn default_dir() -> PathBuf {
        if geteuid().is_root() {
            return PathBuf::from(SYSTEM_STATE_DIR);
        }
        dirs::runtime_dir()
            .map(|dir| dir.join("ocvpn"))
            .unwrap_or_else(|| PathBuf::from(SYSTEM_STATE_DIR))
    }
}

impl Default for SessionPaths {
    fn default() -> Self {
        Self::in_dir(&Self::default_dir())
    }
}

/// Per-invocation knobs
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Explicit client binary; searched on `$PATH` when unset
    pub openconnect: Option<PathBuf>,
    /// Let openconnect daemonize (`--background`) instead of supervising it
    pub background: bool,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub lock_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            openconnect: None,
            background: true,
            connect_timeout: Duration::from_secs(120),
            disconnect_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
        }
    }
}
