//! Unix process control via `kill(2)`

use nix::errno::Errno;
use nix::sys::signal::{self, kill};
use nix::unistd::{Pid, geteuid};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use super::{PlatformError, Privilege, ProcessControl, Signal};
use crate::openconnect::{elevate, signal_args};
use crate::supervisor::{self, ProcessHandle, SpawnOptions, SupervisorError};

/// Longest process name the kernel keeps in `/proc/<pid>/comm`
const COMM_LEN: usize = 15;

pub struct SystemProcessControl {
    elevation: Option<String>,
    /// Names a tracked pid may run under: openconnect, the elevation program
    client_names: Vec<String>,
}

impl SystemProcessControl {
    /// `elevation` names a program such as `sudo` used when not running as root.
    pub fn new(elevation: Option<String>) -> Self {
        let mut client_names = vec!["openconnect".to_string()];
        client_names.extend(elevation.as_deref().and_then(base_name));
        Self {
            elevation,
            client_names,
        }
    }

    /// Also accept processes running `client`, for a client installed under
    /// another name.
    pub fn with_client(mut self, client: &Path) -> Self {
        if let Some(name) = client.to_str().and_then(base_name) {
            self.client_names.push(name);
        }
        self
    }

    /// A recycled pid can belong to anything; only our client counts.
    fn runs_client(&self, pid: u32) -> bool {
        match process_name(pid) {
            Some(name) => self.client_names.iter().any(|c| comm_matches(c, &name)),
            // No procfs to ask
            None => true,
        }
    }

    fn elevated_signal(&self, program: &str, pid: u32, signal: Signal) -> Result<(), PlatformError> {
        let argv = elevate(program, signal_args(signal, pid));
        info!("Signalling pid {} through {}", pid, program);
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .map_err(|e| PlatformError::SignalError {
                pid,
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlatformError::SignalError {
                pid,
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

impl Default for SystemProcessControl {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProcessControl for SystemProcessControl {
    fn privilege(&self) -> Privilege {
        if geteuid().is_root() {
            Privilege::Root
        } else if let Some(program) = &self.elevation {
            Privilege::Elevated(program.clone())
        } else {
            Privilege::Unprivileged
        }
    }

    fn spawn(
        &self,
        argv: &[String],
        options: SpawnOptions,
    ) -> Result<ProcessHandle, SupervisorError> {
        match self.privilege() {
            Privilege::Elevated(program) => {
                supervisor::spawn(&elevate(&program, argv.to_vec()), options)
            }
            _ => supervisor::spawn(argv, options),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        if !pid_alive(pid) {
            return false;
        }
        if !self.runs_client(pid) {
            debug!("pid {} is running something else now", pid);
            return false;
        }
        true
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), PlatformError> {
        let Some(target) = to_pid(pid) else {
            return Err(PlatformError::SignalError {
                pid,
                message: "not a valid process id".to_string(),
            });
        };

        match kill(target, to_nix(signal)) {
            Ok(()) => {
                debug!("Sent SIG{} to pid {}", signal.name(), pid);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("pid {} already gone", pid);
                Ok(())
            }
            Err(Errno::EPERM) => match &self.elevation {
                Some(program) => self.elevated_signal(program, pid, signal),
                None => Err(PlatformError::PermissionDenied(pid)),
            },
            Err(e) => Err(PlatformError::SignalError {
                pid,
                message: e.to_string(),
            }),
        }
    }
}

/// Whether `pid` names a running process.
///
/// `EPERM` means the process exists but belongs to another user (openconnect
/// started through sudo), so it counts as alive.
pub fn pid_alive(pid: u32) -> bool {
    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Command name of `pid` from procfs
pub fn process_name(pid: u32) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    Some(comm.trim_end_matches('\n').to_string())
}

fn base_name(program: &str) -> Option<String> {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

/// `comm` is the executable's name cut to [`COMM_LEN`] bytes.
fn comm_matches(expected: &str, comm: &str) -> bool {
    let expected = expected.as_bytes();
    expected[..expected.len().min(COMM_LEN)] == *comm.as_bytes()
}

/// Pid 0 and anything that is not a positive `pid_t` would address a
/// process group, never a single process.
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

fn to_nix(signal: Signal) -> signal::Signal {
    match signal {
        Signal::Interrupt => signal::Signal::SIGINT,
        Signal::Terminate => signal::Signal::SIGTERM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_not_alive() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX));
        assert!(!pid_alive(i32::MAX as u32 + 1));
    }

    #[test]
    fn test_reaped_child_is_not_alive() {
        assert!(!pid_alive(exited_pid()));
    }

    #[test]
    fn test_comm_matches() {
        assert!(comm_matches("openconnect", "openconnect"));
        assert!(comm_matches("openconnect-wrapper-v9", "openconnect-wra"));
        assert!(!comm_matches("openconnect", "sleep"));
        assert!(!comm_matches("sudo", "sudoedit"));
    }

    #[test]
    fn test_client_names() {
        let control = SystemProcessControl::new(Some("/usr/bin/doas".to_string()))
            .with_client(Path::new("/opt/oc/bin/openconnect-gp"));
        assert_eq!(control.client_names, vec!["openconnect", "doas", "openconnect-gp"]);
    }

    #[test]
    fn test_recycled_pid_is_not_the_client() {
        if process_name(std::process::id()).is_none() {
            // No procfs here
            return;
        }
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id();

        assert!(pid_alive(pid));
        assert!(!SystemProcessControl::default().is_alive(pid));
        let control = SystemProcessControl::default().with_client(Path::new("/bin/sleep"));
        assert!(control.is_alive(pid));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!control.is_alive(pid));
    }

    #[test]
    fn test_signal_exited_process_is_ok() {
        let control = SystemProcessControl::default();
        assert!(control.signal(exited_pid(), Signal::Interrupt).is_ok());
    }

    #[test]
    fn test_signal_invalid_pid() {
        let control = SystemProcessControl::default();
        let result = control.signal(0, Signal::Terminate);
        assert!(matches!(result, Err(PlatformError::SignalError { pid: 0, .. })));
    }

    #[test]
    fn test_signal_terminates_child() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let control = SystemProcessControl::default();

        control.signal(child.id(), Signal::Terminate).unwrap();

        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_privilege() {
        let control = SystemProcessControl::new(Some("sudo".to_string()));
        let expected = if geteuid().is_root() {
            Privilege::Root
        } else {
            Privilege::Elevated("sudo".to_string())
        };
        assert_eq!(control.privilege(), expected);

        let control = SystemProcessControl::default();
        if !geteuid().is_root() {
            assert_eq!(control.privilege(), Privilege::Unprivileged);
        }
    }

    #[tokio::test]
    async fn test_spawn_without_elevation() {
        let control = SystemProcessControl::default();
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 4".to_string()];

        let mut handle = control.spawn(&argv, SpawnOptions::default()).unwrap();
        let code = handle.wait(std::time::Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, Some(4));
    }
}
