//! Spawning and supervising the client process
//!
//! A [`ProcessHandle`] wraps the spawned child together with the tasks that
//! pump its output. In [`OutputMode::Capture`] both streams are read line by
//! line, echoed to the terminal, appended to the log file if one is
//! configured, and checked against an optional readiness predicate.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long output pumps may take to flush after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Empty command line")]
    EmptyCommand,
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed waiting for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("pid {pid} did not finish within {timeout:?}")]
    TimedOut { pid: u32, timeout: Duration },
}

/// Where the child's stdout/stderr go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Share the supervisor's terminal
    #[default]
    Inherit,
    /// Pipe through the supervisor, echoing to the terminal and appending to a log file
    Capture { log_file: Option<PathBuf> },
    /// Hand both streams straight to a log file (the child may outlive us)
    Redirect(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Written to stdin followed by a newline, after which stdin is closed
    pub stdin_secret: Option<String>,
    pub output: OutputMode,
    /// Output lines matching this mark the process as ready. Needs `Capture`.
    pub ready_marker: Option<fn(&str) -> bool>,
}

/// Result of waiting for a captured process to become ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputLine {
    stream: Stream,
    line: String,
}

/// A running child process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    ready: Option<watch::Receiver<bool>>,
    pumps: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Spawn `argv` directly (no shell). Must be called inside a tokio runtime.
pub fn spawn(argv: &[String], options: SpawnOptions) -> Result<ProcessHandle, SupervisorError> {
    let (program, args) = argv.split_first().ok_or(SupervisorError::EmptyCommand)?;

    let log_file = match &options.output {
        OutputMode::Capture { log_file: Some(path) } | OutputMode::Redirect(path) => {
            Some(open_log(path)?)
        }
        _ => None,
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(if options.stdin_secret.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    });
    match (&options.output, &log_file) {
        (OutputMode::Capture { .. }, _) => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        (OutputMode::Redirect(path), Some(file)) => {
            let err = file.try_clone().map_err(|source| SupervisorError::LogFile {
                path: path.clone(),
                source,
            })?;
            let out = file.try_clone().map_err(|source| SupervisorError::LogFile {
                path: path.clone(),
                source,
            })?;
            cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
        }
        _ => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: program.clone(),
        source,
    })?;
    let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
        program: program.clone(),
        source: io::Error::other("process exited before its pid was known"),
    })?;
    debug!("Spawned {} (pid {})", program, pid);

    if let (Some(secret), Some(mut stdin)) = (options.stdin_secret, child.stdin.take()) {
        tokio::spawn(async move {
            let line = format!("{secret}\n");
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                debug!("Writing to child stdin failed: {}", e);
            }
        });
    }

    let mut handle = ProcessHandle {
        child,
        pid,
        ready: None,
        pumps: Vec::new(),
        writer: None,
    };

    if let OutputMode::Capture { .. } = options.output {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let marker = options.ready_marker;

        if let Some(stdout) = handle.child.stdout.take() {
            handle.pumps.push(tokio::spawn(pump(
                stdout,
                Stream::Stdout,
                line_tx.clone(),
                marker,
                ready_tx.clone(),
            )));
        }
        if let Some(stderr) = handle.child.stderr.take() {
            handle.pumps.push(tokio::spawn(pump(
                stderr,
                Stream::Stderr,
                line_tx.clone(),
                marker,
                ready_tx.clone(),
            )));
        }
        drop(line_tx);

        let log = log_file.map(tokio::fs::File::from_std);
        handle.writer = Some(tokio::spawn(write_lines(line_rx, log)));
        if marker.is_some() {
            handle.ready = Some(ready_rx);
        }
    }

    Ok(handle)
}

fn open_log(path: &Path) -> Result<std::fs::File, SupervisorError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| SupervisorError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

async fn pump<R: AsyncRead + Unpin>(
    reader: R,
    stream: Stream,
    lines: mpsc::UnboundedSender<OutputLine>,
    marker: Option<fn(&str) -> bool>,
    ready: Arc<watch::Sender<bool>>,
) {
    let mut reader = BufReader::new(reader).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if marker.is_some_and(|is_ready| is_ready(&line)) {
                    ready.send_replace(true);
                }
                if lines.send(OutputLine { stream, line }).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Output pump stopped: {}", e);
                break;
            }
        }
    }
}

/// Owns the log file; it is flushed and closed when every pump has finished.
async fn write_lines(
    mut lines: mpsc::UnboundedReceiver<OutputLine>,
    mut log: Option<tokio::fs::File>,
) {
    while let Some(OutputLine { stream, line }) = lines.recv().await {
        match stream {
            Stream::Stdout => println!("{line}"),
            Stream::Stderr => eprintln!("{line}"),
        }

        let failed = match log.as_mut() {
            Some(file) => file.write_all(format!("{line}\n").as_bytes()).await.is_err(),
            None => false,
        };
        if failed {
            warn!("Writing to log file failed, continuing without it");
            log = None;
        }
    }

    if let Some(mut file) = log {
        if let Err(e) = file.flush().await {
            warn!("Flushing log file failed: {}", e);
        }
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait up to `timeout` for the process to exit and return its exit code
    /// (`None` when it was killed by a signal).
    pub async fn wait(&mut self, timeout: Duration) -> Result<Option<i32>, SupervisorError> {
        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => status.map_err(|source| SupervisorError::Wait {
                pid: self.pid,
                source,
            })?,
            Err(_) => {
                return Err(SupervisorError::TimedOut {
                    pid: self.pid,
                    timeout,
                });
            }
        };
        self.drain().await;
        Ok(status.code())
    }

    /// Wait for the process to exit, however long that takes.
    pub async fn wait_exit(&mut self) -> Result<Option<i32>, SupervisorError> {
        let status = self.child.wait().await.map_err(|source| SupervisorError::Wait {
            pid: self.pid,
            source,
        })?;
        self.drain().await;
        Ok(status.code())
    }

    /// Wait until the readiness predicate matches an output line or the
    /// process exits, whichever comes first.
    ///
    /// Without a readiness predicate only the exit can be observed.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness, SupervisorError> {
        let Some(mut ready) = self.ready.clone() else {
            return self.wait(timeout).await.map(Readiness::Exited);
        };
        let pid = self.pid;

        let outcome = tokio::time::timeout(timeout, async {
            if *ready.borrow_and_update() {
                return Ok(Readiness::Ready);
            }
            loop {
                tokio::select! {
                    status = self.child.wait() => {
                        return status.map(|s| Readiness::Exited(s.code()));
                    }
                    changed = ready.changed() => {
                        if changed.is_err() {
                            // Both pumps are gone, so only the exit is left to see
                            return self.child.wait().await.map(|s| Readiness::Exited(s.code()));
                        }
                        if *ready.borrow_and_update() {
                            return Ok(Readiness::Ready);
                        }
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(Readiness::Ready)) => Ok(Readiness::Ready),
            Ok(Ok(exited)) => {
                self.drain().await;
                Ok(exited)
            }
            Ok(Err(source)) => Err(SupervisorError::Wait { pid, source }),
            Err(_) => Err(SupervisorError::TimedOut { pid, timeout }),
        }
    }

    /// Kill the process and reap it.
    pub async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Killing pid {} failed: {}", self.pid, e);
        }
        if let Err(e) = self.child.wait().await {
            debug!("Reaping pid {} failed: {}", self.pid, e);
        }
        self.drain().await;
    }

    async fn drain(&mut self) {
        let tasks: Vec<_> = self.pumps.drain(..).chain(self.writer.take()).collect();
        for mut task in tasks {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_empty_command() {
        let result = spawn(&[], SpawnOptions::default());
        assert!(matches!(result, Err(SupervisorError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let argv = vec!["/nonexistent/openconnect".to_string()];
        let result = spawn(&argv, SpawnOptions::default());

        let err = result.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/openconnect"));
    }

    #[tokio::test]
    async fn test_wait_returns_exit_code() {
        let mut handle = spawn(&sh("exit 3"), SpawnOptions::default()).unwrap();
        assert!(handle.pid() > 0);

        let code = handle.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut handle = spawn(&sh("exec sleep 5"), SpawnOptions::default()).unwrap();

        let result = handle.wait(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SupervisorError::TimedOut { .. })));

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_capture_writes_log_file() {
        let temp_dir = TempDir::new().unwrap();
        let log = temp_dir.path().join("openconnect.log");
        let options = SpawnOptions {
            output: OutputMode::Capture {
                log_file: Some(log.clone()),
            },
            ..SpawnOptions::default()
        };

        let mut handle = spawn(&sh("echo to-stdout; echo to-stderr >&2"), options).unwrap();
        let code = handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(code, Some(0));
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("to-stdout\n"));
        assert!(content.contains("to-stderr\n"));
    }

    #[tokio::test]
    async fn test_capture_appends_to_existing_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = temp_dir.path().join("openconnect.log");
        std::fs::write(&log, "earlier session\n").unwrap();
        let options = SpawnOptions {
            output: OutputMode::Capture {
                log_file: Some(log.clone()),
            },
            ..SpawnOptions::default()
        };

        let mut handle = spawn(&sh("echo later"), options).unwrap();
        handle.wait(Duration::from_secs(5)).await.unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content, "earlier session\nlater\n");
    }

    #[tokio::test]
    async fn test_redirect_writes_log_file() {
        let temp_dir = TempDir::new().unwrap();
        let log = temp_dir.path().join("openconnect.log");
        let options = SpawnOptions {
            output: OutputMode::Redirect(log.clone()),
            ..SpawnOptions::default()
        };

        let mut handle = spawn(&sh("echo hello; echo oops >&2"), options).unwrap();
        handle.wait(Duration::from_secs(5)).await.unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));
    }

    #[tokio::test]
    async fn test_log_file_open_failure() {
        let temp_dir = TempDir::new().unwrap();
        let options = SpawnOptions {
            output: OutputMode::Redirect(temp_dir.path().join("missing").join("x.log")),
            ..SpawnOptions::default()
        };

        let result = spawn(&sh("true"), options);
        assert!(matches!(result, Err(SupervisorError::LogFile { .. })));
    }

    #[tokio::test]
    async fn test_stdin_secret_is_delivered() {
        let temp_dir = TempDir::new().unwrap();
        let log = temp_dir.path().join("out.log");
        let options = SpawnOptions {
            stdin_secret: Some("hunter2".to_string()),
            output: OutputMode::Capture {
                log_file: Some(log.clone()),
            },
            ..SpawnOptions::default()
        };

        let mut handle = spawn(&sh("read pw; echo \"got:$pw\""), options).unwrap();
        handle.wait(Duration::from_secs(5)).await.unwrap();

        let content = std::fs::read_to_string(&log).unwrap();
        assert_eq!(content, "got:hunter2\n");
    }

    #[tokio::test]
    async fn test_wait_ready_sees_marker() {
        let options = SpawnOptions {
            output: OutputMode::Capture { log_file: None },
            ready_marker: Some(crate::openconnect::is_ready_line),
            ..SpawnOptions::default()
        };

        let mut handle = spawn(
            &sh("echo 'Connected as 192.0.2.10, using SSL + DTLS'; exec sleep 5"),
            options,
        )
        .unwrap();

        let readiness = handle.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(readiness, Readiness::Ready);

        handle.terminate().await;
    }

    #[tokio::test]
    async fn test_wait_ready_reports_early_exit() {
        let options = SpawnOptions {
            output: OutputMode::Capture { log_file: None },
            ready_marker: Some(crate::openconnect::is_ready_line),
            ..SpawnOptions::default()
        };

        let mut handle = spawn(&sh("echo 'Failed to obtain WebVPN cookie' >&2; exit 1"), options)
            .unwrap();

        let readiness = handle.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(readiness, Readiness::Exited(Some(1)));
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_without_marker() {
        let options = SpawnOptions {
            output: OutputMode::Capture { log_file: None },
            ready_marker: Some(crate::openconnect::is_ready_line),
            ..SpawnOptions::default()
        };

        let mut handle = spawn(&sh("echo 'SSL negotiation with vpn'; exec sleep 5"), options).unwrap();

        let result = handle.wait_ready(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(SupervisorError::TimedOut { .. })));

        handle.terminate().await;
    }
}
