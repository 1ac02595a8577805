//! Connect, disconnect and status for the single managed session

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::tracker::read_pid_file;
use super::{
    Credentials, Marker, SessionError, SessionLock, SessionPaths, SessionReport, SessionSettings,
    SessionState, SessionStatus, SessionTracker,
};
use crate::config::ConnectionConfig;
use crate::fsutil;
use crate::openconnect::{CommandBuilder, is_ready_line, locate_client};
use crate::platform::{Privilege, ProcessControl, Signal};
use crate::supervisor::{OutputMode, ProcessHandle, Readiness, SpawnOptions, SupervisorError};

/// How often liveness is polled while waiting for the client to exit
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A session that reached `Connected`
#[derive(Debug)]
pub struct ActiveSession {
    pid: u32,
    /// Set when the client runs in the foreground under our supervision
    foreground: Option<ProcessHandle>,
}

impl ActiveSession {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.is_some()
    }
}

pub struct SessionManager<C> {
    control: C,
    paths: SessionPaths,
    tracker: SessionTracker,
    settings: SessionSettings,
    state: SessionState,
}

impl<C: ProcessControl> SessionManager<C> {
    pub fn new(control: C, paths: SessionPaths, settings: SessionSettings) -> Self {
        let tracker = SessionTracker::new(&paths.marker);
        let state = match tracker.inspect(&control) {
            Ok(Marker::Live(pid)) => SessionState {
                status: SessionStatus::Connected,
                pid: Some(pid),
            },
            Ok(_) => SessionState::default(),
            Err(e) => {
                warn!("Cannot read {}: {}", tracker.path().display(), e);
                SessionState::default()
            }
        };

        Self {
            control,
            paths,
            tracker,
            settings,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Fail early when this invocation cannot create a tunnel interface.
    pub fn check_privilege(&self) -> Result<(), SessionError> {
        match self.control.privilege() {
            Privilege::Root => Ok(()),
            Privilege::Elevated(program) => {
                debug!("Not root, running openconnect through {}", program);
                Ok(())
            }
            Privilege::Unprivileged => Err(SessionError::PrivilegeDenied),
        }
    }

    /// Read-only view of the session. Takes no lock and changes nothing.
    pub fn status(&self) -> Result<SessionReport, SessionError> {
        self.check_state_dir()?;
        let marker = self
            .tracker
            .inspect(&self.control)
            .map_err(SessionError::io(self.tracker.path()))?;

        Ok(match marker {
            Marker::Live(pid) => SessionReport::Connected { pid },
            Marker::Stale(pid) => {
                debug!("Marker names pid {} which is not running", pid);
                SessionReport::Disconnected
            }
            Marker::Absent => SessionReport::Disconnected,
        })
    }

    /// Start openconnect for `config`.
    ///
    /// Returns once the tunnel is up. In foreground mode the returned session
    /// still holds the child and should be handed to [`supervise`](Self::supervise).
    pub async fn connect(
        &mut self,
        config: &ConnectionConfig,
        credentials: &Credentials,
    ) -> Result<ActiveSession, SessionError> {
        config.validate()?;
        self.check_privilege()?;
        let program = locate_client(self.settings.openconnect.as_deref())?;

        self.prepare_state_dir()?;
        let _lock = self.lock().await?;
        if let Some(pid) = self.reconcile()? {
            return Err(SessionError::AlreadyConnected(pid));
        }

        let mut builder =
            CommandBuilder::new(program).password_on_stdin(credentials.password.is_some());
        if self.settings.background {
            let handoff = &self.paths.handoff;
            fsutil::remove_if_exists(handoff).map_err(SessionError::io(handoff))?;
            builder = builder.background(handoff);
        }
        let argv = builder.build(config);
        debug!("openconnect argv: {:?}", argv);

        self.transition(SessionStatus::Connecting, None);
        info!(
            "Connecting to {} (interface {})",
            config.server, config.interface_name
        );

        let options = SpawnOptions {
            stdin_secret: credentials.password.clone(),
            output: self.output_mode(config),
            ready_marker: (!self.settings.background).then_some(is_ready_line as fn(&str) -> bool),
        };
        let handle = match self.control.spawn(&argv, options) {
            Ok(handle) => handle,
            Err(e) => {
                self.transition(SessionStatus::Disconnected, None);
                return Err(e.into());
            }
        };

        let session = if self.settings.background {
            self.finish_background(handle).await?
        } else {
            self.finish_foreground(handle).await?
        };
        info!(
            "Connected to {}: pid={}, interface={}",
            config.server, session.pid, config.interface_name
        );
        Ok(session)
    }

    /// The launcher exits 0 once openconnect has connected and forked; the
    /// daemon's pid is then in the handoff file.
    async fn finish_background(
        &mut self,
        mut launcher: ProcessHandle,
    ) -> Result<ActiveSession, SessionError> {
        self.state.pid = Some(launcher.pid());
        let timeout = self.settings.connect_timeout;

        let code = match launcher.wait(timeout).await {
            Ok(code) => code,
            Err(SupervisorError::TimedOut { .. }) => {
                warn!("openconnect still not connected after {:?}, stopping it", timeout);
                self.stop_child(&mut launcher).await;
                self.transition(SessionStatus::Disconnected, None);
                return Err(SessionError::ConnectTimedOut(timeout));
            }
            Err(e) => {
                self.transition(SessionStatus::Disconnected, None);
                return Err(e.into());
            }
        };
        if code != Some(0) {
            warn!("openconnect exited before connecting: {:?}", code);
            self.transition(SessionStatus::Disconnected, None);
            return Err(SessionError::ConnectFailed(code));
        }

        let handoff = self.paths.handoff.clone();
        let pid = read_pid_file(&handoff).map_err(SessionError::io(&handoff))?;
        if let Err(e) = fsutil::remove_if_exists(&handoff) {
            warn!("Failed to remove {}: {}", handoff.display(), e);
        }

        let Some(pid) = pid else {
            self.transition(SessionStatus::Disconnected, None);
            return Err(SessionError::SpawnError(format!(
                "openconnect did not write its pid to {}",
                handoff.display()
            )));
        };
        if !self.control.is_alive(pid) {
            warn!("openconnect (pid {}) exited right after going to the background", pid);
            self.transition(SessionStatus::Disconnected, None);
            return Err(SessionError::ConnectFailed(None));
        }

        if let Err(source) = self.tracker.record_active(pid) {
            warn!("Could not record pid {}, stopping it", pid);
            if let Err(e) = self.control.signal(pid, Signal::Terminate) {
                warn!("{}", e);
            }
            self.transition(SessionStatus::Disconnected, None);
            return Err(SessionError::Io {
                path: self.tracker.path().to_path_buf(),
                source,
            });
        }
        self.transition(SessionStatus::Connected, Some(pid));
        Ok(ActiveSession {
            pid,
            foreground: None,
        })
    }

    /// The child is ours; it is recorded right away so that `disconnect`
    /// from another terminal can find it, and is connected once its output
    /// shows the tunnel is up.
    async fn finish_foreground(
        &mut self,
        mut handle: ProcessHandle,
    ) -> Result<ActiveSession, SessionError> {
        let pid = handle.pid();
        self.state.pid = Some(pid);
        if let Err(source) = self.tracker.record_active(pid) {
            self.stop_child(&mut handle).await;
            self.transition(SessionStatus::Disconnected, None);
            return Err(SessionError::Io {
                path: self.tracker.path().to_path_buf(),
                source,
            });
        }

        let timeout = self.settings.connect_timeout;
        let failure = match handle.wait_ready(timeout).await {
            Ok(Readiness::Ready) => {
                self.transition(SessionStatus::Connected, Some(pid));
                return Ok(ActiveSession {
                    pid,
                    foreground: Some(handle),
                });
            }
            Ok(Readiness::Exited(code)) => {
                warn!("openconnect exited before connecting: {:?}", code);
                SessionError::ConnectFailed(code)
            }
            Err(SupervisorError::TimedOut { .. }) => {
                warn!("openconnect still not connected after {:?}, stopping it", timeout);
                self.stop_child(&mut handle).await;
                SessionError::ConnectTimedOut(timeout)
            }
            Err(e) => {
                self.stop_child(&mut handle).await;
                e.into()
            }
        };

        self.tracker
            .clear_active()
            .map_err(SessionError::io(self.tracker.path()))?;
        self.transition(SessionStatus::Disconnected, None);
        Err(failure)
    }

    /// Stay with a foreground session until openconnect exits or `interrupt`
    /// resolves, then clear the marker.
    ///
    /// On interrupt openconnect is asked to log out and given the disconnect
    /// timeout before it is killed. Background sessions return immediately.
    pub async fn supervise<F>(
        &mut self,
        session: ActiveSession,
        interrupt: F,
    ) -> Result<Option<i32>, SessionError>
    where
        F: Future<Output = ()>,
    {
        let Some(mut handle) = session.foreground else {
            return Ok(None);
        };
        let pid = handle.pid();
        let mut interrupt = std::pin::pin!(interrupt);

        let code = tokio::select! {
            code = handle.wait_exit() => code?,
            () = &mut interrupt => {
                info!("Interrupted, asking openconnect (pid {}) to log out", pid);
                self.transition(SessionStatus::Disconnecting, None);
                if let Err(e) = self.control.signal(pid, Signal::Interrupt) {
                    warn!("{}", e);
                }
                match handle.wait(self.settings.disconnect_timeout).await {
                    Ok(code) => code,
                    Err(SupervisorError::TimedOut { .. }) => {
                        warn!("openconnect did not log out in time, stopping it");
                        self.stop_child(&mut handle).await;
                        None
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        info!("openconnect (pid {}) exited: {:?}", pid, code);

        let _lock = self.lock().await?;
        let marker = self.tracker.path().to_path_buf();
        if self.tracker.current_pid().map_err(SessionError::io(&marker))? == Some(pid) {
            self.tracker
                .clear_active()
                .map_err(SessionError::io(&marker))?;
        }
        self.transition(SessionStatus::Disconnected, None);
        Ok(code)
    }

    /// Ask the running client to tear the tunnel down and wait for it to go.
    pub async fn disconnect(&mut self) -> Result<u32, SessionError> {
        self.check_privilege()?;
        self.prepare_state_dir()?;
        let _lock = self.lock().await?;
        let Some(pid) = self.reconcile()? else {
            return Err(SessionError::NotConnected);
        };

        self.transition(SessionStatus::Disconnecting, None);
        info!("Disconnecting: pid={}", pid);
        if let Err(e) = self.control.signal(pid, Signal::Interrupt) {
            // Still running
            self.state = SessionState {
                status: SessionStatus::Connected,
                pid: Some(pid),
            };
            return Err(e.into());
        }

        let timeout = self.settings.disconnect_timeout;
        if !self.wait_for_exit(pid, timeout).await {
            warn!("pid {} still running after {:?}, sending SIGTERM", pid, timeout);
            if let Err(e) = self.control.signal(pid, Signal::Terminate) {
                warn!("{}", e);
            }
            return Err(SessionError::DisconnectTimedOut(pid));
        }

        self.tracker
            .clear_active()
            .map_err(SessionError::io(self.tracker.path()))?;
        self.transition(SessionStatus::Disconnected, None);
        info!("Disconnected");
        Ok(pid)
    }

    /// Stop a child we spawned. SIGTERM goes through [`ProcessControl`] so that
    /// an elevation wrapper such as sudo relays it to openconnect; SIGKILL
    /// cannot be relayed and is only the last resort.
    async fn stop_child(&self, handle: &mut ProcessHandle) {
        let pid = handle.pid();
        if let Err(e) = self.control.signal(pid, Signal::Terminate) {
            warn!("{}", e);
        }
        match handle.wait(self.settings.disconnect_timeout).await {
            Ok(code) => debug!("pid {} stopped: {:?}", pid, code),
            Err(e) => {
                warn!("pid {} did not stop after SIGTERM ({}), killing it", pid, e);
                handle.terminate().await;
            }
        }
    }

    fn prepare_state_dir(&self) -> Result<(), SessionError> {
        fsutil::create_dir(&self.paths.dir).map_err(SessionError::io(&self.paths.dir))?;
        self.check_state_dir()
    }

    /// Refuse a state directory that someone else could plant files in.
    fn check_state_dir(&self) -> Result<(), SessionError> {
        let dir = &self.paths.dir;
        match fsutil::trust_problem(dir).map_err(SessionError::io(dir))? {
            Some(reason) => Err(SessionError::InsecureStateDir {
                path: dir.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    async fn lock(&self) -> Result<SessionLock, SessionError> {
        Ok(SessionLock::acquire(&self.paths.lock, self.settings.lock_timeout).await?)
    }

    /// Bring the in-memory state in line with the marker, clearing it if the
    /// recorded process is gone. The caller holds the lock.
    fn reconcile(&mut self) -> Result<Option<u32>, SessionError> {
        let marker = self
            .tracker
            .inspect(&self.control)
            .map_err(SessionError::io(self.tracker.path()))?;

        match marker {
            Marker::Live(pid) => {
                // Possibly connected by another invocation since we were opened
                self.state = SessionState {
                    status: SessionStatus::Connected,
                    pid: Some(pid),
                };
                Ok(Some(pid))
            }
            Marker::Stale(pid) => {
                info!("Session pid {} is no longer running, clearing stale marker", pid);
                self.tracker
                    .clear_active()
                    .map_err(SessionError::io(self.tracker.path()))?;
                self.transition(SessionStatus::Disconnected, None);
                Ok(None)
            }
            Marker::Absent => {
                if self.state.status != SessionStatus::Disconnected {
                    self.transition(SessionStatus::Disconnected, None);
                }
                Ok(None)
            }
        }
    }

    fn transition(&mut self, next: SessionStatus, pid: Option<u32>) {
        let current = self.state.status;
        if current.can_transition_to(next) {
            debug!("Session {:?} -> {:?}", current, next);
        } else {
            warn!("Unexpected session transition {:?} -> {:?}", current, next);
        }

        let pid = match next {
            SessionStatus::Connecting | SessionStatus::Connected => pid,
            _ => None,
        };
        self.state = SessionState { status: next, pid };
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.control.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn output_mode(&self, config: &ConnectionConfig) -> OutputMode {
        let log_file: Option<PathBuf> = config.log_file_path.clone();
        match (log_file, self.settings.background) {
            // The daemon outlives us, so it gets the file itself
            (Some(path), true) => OutputMode::Redirect(path),
            (None, true) => OutputMode::Inherit,
            (log_file, false) => OutputMode::Capture { log_file },
        }
    }
}
