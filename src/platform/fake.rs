//! In-memory process control for lifecycle tests
//!
//! Background launches write a made-up daemon pid to the `--pid-file` found in
//! argv and then run a short `sh -c "exit N"` as the launcher. Liveness is a
//! set of pids the test controls.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use super::{PlatformError, Privilege, ProcessControl, Signal};
use crate::fsutil;
use crate::supervisor::{self, ProcessHandle, SpawnOptions, SupervisorError};

pub struct FakeProcessControl {
    privilege: Privilege,
    launcher_exit: i32,
    foreground_script: String,
    ignore_interrupt: bool,
    next_pid: Mutex<u32>,
    live: Mutex<HashSet<u32>>,
    spawned: Mutex<Vec<Vec<String>>>,
    stdin_secrets: Mutex<Vec<Option<String>>>,
    signals: Mutex<Vec<(u32, Signal)>>,
}

impl FakeProcessControl {
    pub fn new() -> Self {
        Self {
            privilege: Privilege::Root,
            launcher_exit: 0,
            foreground_script: "echo 'Connected as 10.0.0.5, using SSL'; exec sleep 0.3"
                .to_string(),
            ignore_interrupt: false,
            next_pid: Mutex::new(40_000),
            live: Mutex::new(HashSet::new()),
            spawned: Mutex::new(Vec::new()),
            stdin_secrets: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
        }
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn with_launcher_exit(mut self, code: i32) -> Self {
        self.launcher_exit = code;
        self
    }

    pub fn with_foreground_script(mut self, script: &str) -> Self {
        self.foreground_script = script.to_string();
        self
    }

    /// Make the daemon survive SIGINT, so only SIGTERM ends it.
    pub fn ignoring_interrupt(mut self) -> Self {
        self.ignore_interrupt = true;
        self
    }

    pub fn set_alive(&self, pid: u32) {
        self.live.lock().unwrap().insert(pid);
    }

    /// Simulate the process dying on its own.
    pub fn kill(&self, pid: u32) {
        self.live.lock().unwrap().remove(&pid);
    }

    pub fn spawned(&self) -> Vec<Vec<String>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn stdin_secrets(&self) -> Vec<Option<String>> {
        self.stdin_secrets.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().unwrap().clone()
    }

    fn allocate_pid(&self) -> u32 {
        let mut next = self.next_pid.lock().unwrap();
        *next += 1;
        *next
    }
}

fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|arg| arg == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

impl ProcessControl for FakeProcessControl {
    fn privilege(&self) -> Privilege {
        self.privilege.clone()
    }

    fn spawn(
        &self,
        argv: &[String],
        options: SpawnOptions,
    ) -> Result<ProcessHandle, SupervisorError> {
        self.spawned.lock().unwrap().push(argv.to_vec());
        self.stdin_secrets
            .lock()
            .unwrap()
            .push(options.stdin_secret.clone());

        let script = match flag_value(argv, "--pid-file") {
            Some(pid_file) => {
                if self.launcher_exit == 0 {
                    let pid = self.allocate_pid();
                    fsutil::write_atomic(Path::new(pid_file), format!("{pid}\n").as_bytes())
                        .unwrap();
                    self.set_alive(pid);
                }
                format!("exit {}", self.launcher_exit)
            }
            None => self.foreground_script.clone(),
        };

        let options = SpawnOptions {
            stdin_secret: None,
            ..options
        };
        let handle = supervisor::spawn(
            &["sh".to_string(), "-c".to_string(), script],
            options,
        )?;
        if flag_value(argv, "--pid-file").is_none() {
            self.set_alive(handle.pid());
        }
        Ok(handle)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.live.lock().unwrap().contains(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), PlatformError> {
        if self.privilege == Privilege::Unprivileged {
            return Err(PlatformError::PermissionDenied(pid));
        }
        self.signals.lock().unwrap().push((pid, signal));
        if signal == Signal::Terminate || !self.ignore_interrupt {
            self.kill(pid);
        }
        Ok(())
    }
}
