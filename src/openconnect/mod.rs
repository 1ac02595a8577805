//! OpenConnect client integration
//!
//! The `openconnect` binary does all of the protocol work. This module only
//! knows how to find it, what to put on its command line, and how to read
//! its progress messages.
//!
//! # Usage
//!
//! ```bash
//! openconnect --protocol=anyconnect --interface tun0 \
//!   --background --pid-file /run/ocvpn/openconnect.pid \
//!   --passwd-on-stdin vpn.example.com --user alice
//! ```
//!
//! # Lifecycle
//!
//! With `--background`, openconnect forks into the background only after the
//! tunnel is up, so the launching process exiting with status 0 means the
//! session is connected. In the foreground the same moment is recognised
//! from its output (see [`output::is_ready_line`]).

pub mod command;
pub mod locate;
pub mod output;

pub use command::{CommandBuilder, connection_args, elevate, signal_args};
pub use locate::{LocateError, locate_client};
pub use output::is_ready_line;
