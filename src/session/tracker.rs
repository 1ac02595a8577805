//! PID marker for the active session

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::fsutil;
use crate::platform::ProcessControl;

/// What the marker says, checked against the process table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Absent,
    Live(u32),
    /// Recorded, but the process is gone
    Stale(u32),
}

#[derive(Debug, Clone)]
pub struct SessionTracker {
    path: PathBuf,
}

impl SessionTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_pid(&self) -> io::Result<Option<u32>> {
        read_pid_file(&self.path)
    }

    pub fn record_active(&self, pid: u32) -> io::Result<()> {
        fsutil::write_atomic(&self.path, format!("{pid}\n").as_bytes())?;
        debug!("Recorded pid {} in {}", pid, self.path.display());
        Ok(())
    }

    pub fn clear_active(&self) -> io::Result<()> {
        if fsutil::remove_if_exists(&self.path)? {
            debug!("Removed {}", self.path.display());
        }
        Ok(())
    }

    pub fn inspect<C: ProcessControl + ?Sized>(&self, control: &C) -> io::Result<Marker> {
        Ok(match self.current_pid()? {
            None => Marker::Absent,
            Some(pid) if control.is_alive(pid) => Marker::Live(pid),
            Some(pid) => Marker::Stale(pid),
        })
    }
}

/// Read a file holding a single decimal pid.
///
/// A missing file is `None`. So is unparseable content, which is logged and
/// otherwise treated like no marker at all. A file someone else could have
/// written is refused with `PermissionDenied`.
pub fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    if let Some(problem) = fsutil::trust_problem(path)? {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("refusing pid file {}: {}", path.display(), problem),
        ));
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let pid = parse_pid(&content);
    if pid.is_none() && !content.trim().is_empty() {
        warn!("Ignoring malformed pid file {}", path.display());
    }
    Ok(pid)
}

fn parse_pid(content: &str) -> Option<u32> {
    content
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0 && i32::try_from(*pid).is_ok())
}
