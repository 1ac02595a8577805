//! Platform-specific process control

#[cfg(unix)]
pub mod unix;

#[cfg(test)]
pub(crate) mod fake;

use thiserror::Error;
use tracing::warn;

use crate::supervisor::{ProcessHandle, SpawnOptions, SupervisorError};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Not permitted to signal pid {0}")]
    PermissionDenied(u32),
    #[error("Failed to signal pid {pid}: {message}")]
    SignalError { pid: u32, message: String },
}

/// Signals the session manager sends to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// openconnect logs out of the session and tears the tunnel down
    Interrupt,
    /// Terminate without logging out
    Terminate,
}

impl Signal {
    /// Name as understood by `kill -<NAME>`
    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "INT",
            Signal::Terminate => "TERM",
        }
    }
}

/// What this invocation may do about tunnel interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Privilege {
    /// Running as root
    Root,
    /// Not root, but commands can be run through this elevation program
    Elevated(String),
    /// Neither
    Unprivileged,
}

/// Platform-agnostic process control interface
pub trait ProcessControl {
    fn privilege(&self) -> Privilege;
    /// Spawn the client, applying elevation when the invocation is not root.
    fn spawn(&self, argv: &[String], options: SpawnOptions)
    -> Result<ProcessHandle, SupervisorError>;
    fn is_alive(&self, pid: u32) -> bool;
    /// Deliver `signal` to `pid`. A process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), PlatformError>;
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
pub async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
