//! ocvpn - session manager for the openconnect VPN client
//!
//! Starts, tracks and stops a single openconnect (AnyConnect protocol)
//! session. All VPN negotiation happens inside openconnect; this crate builds
//! its command line, supervises the process and keeps a pid marker so that
//! separate invocations agree on whether a session is up.
//!
//! # Architecture
//!
//! - `config`: Connection record and its TOML store
//! - `openconnect`: Command line building, binary discovery, output markers
//! - `supervisor`: Spawning the client and waiting on it
//! - `platform`: Privilege, liveness and signals behind `ProcessControl`
//! - `session`: Marker, lock and the `SessionManager` state machine
//! - `prompt`: Asking the user for settings and credentials
//! - `menu`: Interactive front end
//!
//! # Usage
//!
//! ```bash
//! sudo ocvpn connect vpn.example.com --username alice --servercert pin-sha256:...
//! ocvpn status
//! sudo ocvpn disconnect
//! ```

#[cfg(not(unix))]
compile_error!("ocvpn supports Unix-like systems only");

pub mod config;
pub mod fsutil;
pub mod menu;
pub mod openconnect;
pub mod platform;
pub mod prompt;
pub mod session;
pub mod supervisor;

pub use config::{ConfigPatch, ConfigStore, ConnectionConfig};
pub use session::{Credentials, SessionError, SessionManager, SessionReport};
