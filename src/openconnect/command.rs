//! openconnect command lines
//!
//! Everything here produces a literal argument vector for direct process
//! creation. Nothing is ever joined into a string for a shell to re-split.

use std::path::PathBuf;

use crate::config::ConnectionConfig;
use crate::platform::Signal;

/// Protocol openconnect is told to speak
pub const PROTOCOL: &str = "anyconnect";

/// Arguments derived from the connection record alone.
///
/// The server is always the first token. Each optional field that is set adds
/// one flag/value pair, `disable_dtls` adds a lone `--no-dtls`, and the extra
/// arguments follow verbatim.
pub fn connection_args(config: &ConnectionConfig) -> Vec<String> {
    let mut args = vec![config.server.clone()];

    if let Some(username) = &config.username {
        args.push("--user".to_string());
        args.push(username.clone());
    }
    if let Some(group) = &config.auth_group {
        args.push("--authgroup".to_string());
        args.push(group.clone());
    }
    if let Some(pin) = &config.server_cert_pin {
        args.push("--servercert".to_string());
        args.push(pin.clone());
    }
    if config.disable_dtls {
        args.push("--no-dtls".to_string());
    }

    args.extend(config.extra_args.iter().cloned());
    args
}

/// Builds the full openconnect invocation for a connection
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: PathBuf,
    pid_file: Option<PathBuf>,
    password_on_stdin: bool,
}

impl CommandBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            pid_file: None,
            password_on_stdin: false,
        }
    }

    /// Let openconnect daemonize once connected and write its pid to `pid_file`.
    pub fn background(mut self, pid_file: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(pid_file.into());
        self
    }

    pub fn password_on_stdin(mut self, enabled: bool) -> Self {
        self.password_on_stdin = enabled;
        self
    }

    pub fn build(&self, config: &ConnectionConfig) -> Vec<String> {
        let mut argv = vec![
            self.program.to_string_lossy().into_owned(),
            format!("--protocol={PROTOCOL}"),
            "--interface".to_string(),
            config.interface_name.clone(),
        ];

        if let Some(pid_file) = &self.pid_file {
            argv.push("--background".to_string());
            argv.push("--pid-file".to_string());
            argv.push(pid_file.to_string_lossy().into_owned());
        }
        if self.password_on_stdin {
            argv.push("--passwd-on-stdin".to_string());
        }

        argv.extend(connection_args(config));
        argv
    }
}

/// `kill` invocation delivering `signal` to `pid`.
///
/// Used when the client runs under a different uid and has to be signalled
/// through the elevation program.
pub fn signal_args(signal: Signal, pid: u32) -> Vec<String> {
    vec![
        "kill".to_string(),
        format!("-{}", signal.name()),
        pid.to_string(),
    ]
}

/// Prefix `argv` with an elevation program such as `sudo`.
pub fn elevate(program: &str, argv: Vec<String>) -> Vec<String> {
    let mut elevated = Vec::with_capacity(argv.len() + 1);
    elevated.push(program.to_string());
    elevated.extend(argv);
    elevated
}
