//! Cross-process session lock
//!
//! An exclusive `flock(2)` on a lock file next to the marker. The lock is
//! released when the [`SessionLock`] is dropped or the process exits.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::fsutil;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Session lock {0} is held by another invocation")]
    Busy(PathBuf),
    #[error("Failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct SessionLock {
    _lock: Flock<File>,
}

impl SessionLock {
    /// Take the lock, retrying until `timeout` has passed.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_error = |source: io::Error| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            fsutil::create_dir(dir).map_err(io_error)?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            // flock needs no write access, so a lock file made by root still works
            let file = match File::open(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .mode(0o644)
                    .open(path),
                other => other,
            }
            .map_err(io_error)?;

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    debug!("Acquired {}", path.display());
                    return Ok(Self { _lock: lock });
                }
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Busy(path.to_path_buf()));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err((_, errno)) => return Err(io_error(io::Error::from(errno))),
            }
        }
    }
}
